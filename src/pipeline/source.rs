//! Reading source abstraction for pipeline input.
//!
//! Provides a unified trait for pulling raw readings from different inputs:
//! CSV files (replay), stdin (JSON lines), and a synthetic generator.

use crate::types::RawReading;
use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rand_distr::{Distribution, LogNormal};
use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::path::Path;
use tracing::{debug, warn};

/// Events produced by a reading source.
pub enum ReadingEvent {
    /// A raw reading was produced.
    Reading(RawReading),
    /// Source reached end of data (EOF for files/stdin; synthetic sources never end).
    Eof,
}

/// Trait abstracting where raw readings come from.
///
/// Implementations handle format parsing and pacing internally. The
/// processing loop calls [`next_reading`] in a select! with cancellation.
#[async_trait]
pub trait ReadingSource: Send + 'static {
    /// Produce the next reading.
    ///
    /// Returns `ReadingEvent::Eof` when no more data is available.
    /// Returns `Err` on unrecoverable errors (e.g. unreadable input).
    async fn next_reading(&mut self) -> Result<ReadingEvent>;

    /// Human-readable name for logging (e.g. "CSV", "stdin", "synthetic").
    fn source_name(&self) -> &str;
}

// ============================================================================
// CSV Source (file replay)
// ============================================================================

/// Replays raw readings loaded from a CSV file with optional inter-reading delay.
pub struct CsvSource {
    readings: std::vec::IntoIter<RawReading>,
    delay_ms: u64,
    yielded_first: bool,
}

impl CsvSource {
    pub fn new(readings: Vec<RawReading>, delay_ms: u64) -> Self {
        Self {
            readings: readings.into_iter(),
            delay_ms,
            yielded_first: false,
        }
    }

    /// Load a reading CSV from disk.
    ///
    /// The header row names the columns; unknown columns are ignored and
    /// unparseable rows are skipped with a count.
    pub fn from_path(path: impl AsRef<Path>, delay_ms: u64) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        let readings = parse_csv(&content)
            .with_context(|| format!("Failed to parse {}", path.display()))?;
        Ok(Self::new(readings, delay_ms))
    }

    /// Readings remaining in the replay.
    pub fn len(&self) -> usize {
        self.readings.len()
    }

    pub fn is_empty(&self) -> bool {
        self.readings.len() == 0
    }
}

#[async_trait]
impl ReadingSource for CsvSource {
    async fn next_reading(&mut self) -> Result<ReadingEvent> {
        // Delay between readings; no delay before the first one.
        if self.yielded_first && self.delay_ms > 0 {
            tokio::time::sleep(tokio::time::Duration::from_millis(self.delay_ms)).await;
        }
        match self.readings.next() {
            Some(r) => {
                self.yielded_first = true;
                Ok(ReadingEvent::Reading(r))
            }
            None => Ok(ReadingEvent::Eof),
        }
    }

    fn source_name(&self) -> &str {
        "CSV"
    }
}

/// Parse a full CSV document into raw readings.
fn parse_csv(content: &str) -> Result<Vec<RawReading>> {
    let mut lines = content.lines();
    let header = lines.next().ok_or_else(|| anyhow!("CSV file is empty"))?;
    let columns: Vec<String> = header.split(',').map(|c| c.trim().to_lowercase()).collect();

    if !columns.iter().any(|c| c == "city") {
        return Err(anyhow!("CSV header has no 'city' column"));
    }
    if !columns.iter().any(|c| c == "timestamp") {
        return Err(anyhow!("CSV header has no 'timestamp' column"));
    }

    let mut readings = Vec::new();
    let mut skipped = 0usize;

    for (index, line) in lines.enumerate() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        match parse_csv_row(&columns, line) {
            Some(reading) => readings.push(reading),
            None => {
                skipped += 1;
                debug!(line = index + 2, "Skipping unparseable CSV row");
            }
        }
    }

    if skipped > 0 {
        warn!(skipped = skipped, "Skipped unparseable CSV rows");
    }
    Ok(readings)
}

/// Parse one CSV row against the header columns. Returns `None` when the row
/// cannot yield a usable reading (field count mismatch, no city, no timestamp).
fn parse_csv_row(columns: &[String], line: &str) -> Option<RawReading> {
    let fields: Vec<&str> = line.split(',').map(str::trim).collect();
    if fields.len() != columns.len() {
        return None;
    }

    let mut city = String::new();
    let mut country = String::new();
    let mut latitude = 0.0;
    let mut longitude = 0.0;
    let mut timestamp = String::new();
    let mut source = "csv".to_string();
    let mut pm25 = None;
    let mut pm10 = None;
    let mut co = None;
    let mut no2 = None;
    let mut o3 = None;
    let mut so2 = None;
    let mut temperature = None;
    let mut humidity = None;
    let mut pressure = None;
    let mut wind_speed = None;

    for (name, field) in columns.iter().zip(&fields) {
        match name.as_str() {
            "city" => city = (*field).to_string(),
            "country" => country = (*field).to_string(),
            "latitude" | "lat" => latitude = opt_f64(field).unwrap_or(0.0),
            "longitude" | "lon" => longitude = opt_f64(field).unwrap_or(0.0),
            "timestamp" => timestamp = (*field).to_string(),
            "source" if !field.is_empty() => source = (*field).to_string(),
            "pm25" | "pm2_5" => pm25 = opt_f64(field),
            "pm10" => pm10 = opt_f64(field),
            "co" => co = opt_f64(field),
            "no2" => no2 = opt_f64(field),
            "o3" => o3 = opt_f64(field),
            "so2" => so2 = opt_f64(field),
            "temperature" => temperature = opt_f64(field),
            "humidity" => humidity = opt_f64(field),
            "pressure" => pressure = opt_f64(field),
            "wind_speed" => wind_speed = opt_f64(field),
            _ => {}
        }
    }

    if city.is_empty() || timestamp.is_empty() {
        return None;
    }

    Some(RawReading {
        city,
        country,
        latitude,
        longitude,
        timestamp,
        source,
        pm25,
        pm10,
        co,
        no2,
        o3,
        so2,
        temperature,
        humidity,
        pressure,
        wind_speed,
    })
}

fn opt_f64(field: &str) -> Option<f64> {
    if field.is_empty() {
        None
    } else {
        field.parse().ok()
    }
}

// ============================================================================
// Stdin Source (JSON readings, one per line)
// ============================================================================

/// Reads JSON-formatted raw readings from stdin.
///
/// Used with the generator binary:
/// `simulate --hours 1 | airwarden --stdin`
pub struct StdinSource {
    reader: tokio::io::BufReader<tokio::io::Stdin>,
    line_buffer: String,
}

impl StdinSource {
    pub fn new() -> Self {
        Self {
            reader: tokio::io::BufReader::new(tokio::io::stdin()),
            line_buffer: String::with_capacity(2048),
        }
    }
}

impl Default for StdinSource {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ReadingSource for StdinSource {
    async fn next_reading(&mut self) -> Result<ReadingEvent> {
        use tokio::io::AsyncBufReadExt;
        loop {
            self.line_buffer.clear();
            let bytes = self.reader.read_line(&mut self.line_buffer).await?;
            if bytes == 0 {
                return Ok(ReadingEvent::Eof);
            }
            let line = self.line_buffer.trim();
            if line.is_empty() {
                continue;
            }
            match serde_json::from_str::<RawReading>(line) {
                Ok(reading) => return Ok(ReadingEvent::Reading(reading)),
                Err(e) => {
                    warn!("[StdinSource] Failed to parse reading: {}", e);
                    // Skip malformed lines and keep reading
                }
            }
        }
    }

    fn source_name(&self) -> &str {
        "stdin"
    }
}

// ============================================================================
// Synthetic Source (generated readings)
// ============================================================================

/// Typical PM2.5 level per generated city, µg/m³. Other pollutants and the
/// weather fields derive from it or from their own fixed medians.
const CITY_PROFILES: &[(&str, &str, f64, f64, f64)] = &[
    ("New York", "US", 40.7128, -74.0060, 12.0),
    ("Los Angeles", "US", 34.0522, -118.2437, 18.0),
    ("Chicago", "US", 41.8781, -87.6298, 11.0),
    ("London", "GB", 51.5074, -0.1278, 13.0),
    ("Paris", "FR", 48.8566, 2.3522, 14.0),
    ("Tokyo", "JP", 35.6762, 139.6503, 10.0),
    ("Delhi", "IN", 28.6139, 77.2090, 95.0),
    ("Beijing", "CN", 39.9042, 116.4074, 55.0),
];

/// How likely a quiet city is to begin a pollution episode on any visit.
const EPISODE_CHANCE: f64 = 0.02;

/// Endless generator of plausible readings for the profiled cities.
///
/// Pollutant levels follow log-normal noise around each city's typical value,
/// with episodic multi-reading spikes so downstream anomaly detection has
/// something to find. Cities are visited round-robin.
pub struct SyntheticSource {
    rng: StdRng,
    noise: LogNormal<f64>,
    /// city index -> (readings remaining in episode, severity multiplier)
    episodes: HashMap<usize, (u32, f64)>,
    next_city: usize,
    interval_ms: u64,
    yielded_first: bool,
}

impl SyntheticSource {
    /// Build a generator pacing one reading per `interval_ms`.
    ///
    /// Passing a seed makes the sequence reproducible.
    pub fn new(interval_ms: u64, seed: Option<u64>) -> Result<Self> {
        let rng = match seed {
            Some(s) => StdRng::seed_from_u64(s),
            None => StdRng::from_entropy(),
        };
        let noise = LogNormal::new(0.0, 0.35)
            .map_err(|e| anyhow!("Bad log-normal parameters: {}", e))?;
        Ok(Self {
            rng,
            noise,
            episodes: HashMap::new(),
            next_city: 0,
            interval_ms,
            yielded_first: false,
        })
    }

    /// Generate one reading for the next city in the rotation.
    fn generate(&mut self) -> RawReading {
        let index = self.next_city;
        self.next_city = (self.next_city + 1) % CITY_PROFILES.len();
        let (city, country, latitude, longitude, pm25_typical) = CITY_PROFILES[index];

        // Episodes persist for several visits so spikes look like weather
        // events, not single-sample glitches.
        let spike = match self.episodes.entry(index) {
            Entry::Occupied(mut slot) => {
                let (remaining, multiplier) = slot.get_mut();
                let m = *multiplier;
                *remaining -= 1;
                if *remaining == 0 {
                    slot.remove();
                }
                m
            }
            Entry::Vacant(slot) => {
                if self.rng.gen_bool(EPISODE_CHANCE) {
                    let length = self.rng.gen_range(4..=12);
                    let multiplier = self.rng.gen_range(3.0..6.0);
                    slot.insert((length, multiplier));
                    multiplier
                } else {
                    1.0
                }
            }
        };

        let pm25 = pm25_typical * self.noise.sample(&mut self.rng) * spike;
        let pm10 = pm25 * self.rng.gen_range(1.4..2.2);
        let no2 = 18.0 * self.noise.sample(&mut self.rng) * spike.sqrt();
        let o3 = 30.0 * self.noise.sample(&mut self.rng);
        let co = 0.4 * self.noise.sample(&mut self.rng) * spike.sqrt();
        let so2 = 2.0 * self.noise.sample(&mut self.rng);

        RawReading {
            city: city.to_string(),
            country: country.to_string(),
            latitude,
            longitude,
            timestamp: chrono::Utc::now().to_rfc3339(),
            source: "simulated".to_string(),
            pm25: Some(pm25),
            pm10: Some(pm10),
            co: Some(co),
            no2: Some(no2),
            o3: Some(o3),
            so2: Some(so2),
            temperature: Some(self.rng.gen_range(-5.0..32.0)),
            humidity: Some(self.rng.gen_range(25.0..95.0)),
            pressure: Some(self.rng.gen_range(995.0..1030.0)),
            wind_speed: Some(self.rng.gen_range(0.0..14.0)),
        }
    }
}

#[async_trait]
impl ReadingSource for SyntheticSource {
    async fn next_reading(&mut self) -> Result<ReadingEvent> {
        if self.yielded_first && self.interval_ms > 0 {
            tokio::time::sleep(tokio::time::Duration::from_millis(self.interval_ms)).await;
        }
        self.yielded_first = true;
        Ok(ReadingEvent::Reading(self.generate()))
    }

    fn source_name(&self) -> &str {
        "synthetic"
    }
}
