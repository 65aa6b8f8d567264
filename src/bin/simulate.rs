//! Air Quality Reading Simulation
//!
//! Generates realistic city air quality readings for testing AIRWARDEN.
//! Simulates a monitoring day including:
//! - Normal urban pollution levels across the city roster
//! - A stagnant-air pollution episode building in one city
//! - A severe smog peak with correlated combustion pollutants
//! - A coarse-particulate dust front hitting a second city
//! - Dispersal and recovery
//!
//! # Usage
//! ```bash
//! ./simulate --hours 1 --speed 120 | ./airwarden --stdin
//! ```

use chrono::{DateTime, TimeDelta, Utc};
use clap::Parser;
use rand::prelude::*;
use rand_distr::{Distribution, Normal};
use std::io::{self, Write};
use std::time::{Duration, Instant};

use airwarden::types::RawReading;

// ============================================================================
// City Roster
// ============================================================================

/// (name, country, latitude, longitude, typical PM2.5 µg/m³)
const CITIES: &[(&str, &str, f64, f64, f64)] = &[
    ("New York", "US", 40.7128, -74.0060, 12.0),
    ("Los Angeles", "US", 34.0522, -118.2437, 18.0),
    ("Chicago", "US", 41.8781, -87.6298, 11.0),
    ("London", "GB", 51.5074, -0.1278, 13.0),
    ("Paris", "FR", 48.8566, 2.3522, 14.0),
    ("Tokyo", "JP", 35.6762, 139.6503, 10.0),
    ("Delhi", "IN", 28.6139, 77.2090, 95.0),
    ("Beijing", "CN", 39.9042, 116.4074, 55.0),
];

/// Normalization rejects PM2.5 above 500 and PM10 above 600; the scenario
/// peaks stay under these so every generated reading is accepted.
const PM25_CEILING: f64 = 450.0;
const PM10_CEILING: f64 = 550.0;

// ============================================================================
// CLI Arguments
// ============================================================================

#[derive(Parser, Debug)]
#[command(name = "aq-simulate")]
#[command(about = "Air quality reading simulation for AIRWARDEN testing")]
#[command(version = "1.0")]
struct Args {
    /// Simulated duration in hours (1-24); one reading per city per minute
    #[arg(short = 'H', long, default_value = "1", value_parser = clap::value_parser!(u32).range(1..=24))]
    hours: u32,

    /// Time compression factor (1 = real-time, 60 = one simulated minute per second)
    #[arg(short, long, default_value = "60", value_parser = clap::value_parser!(u32).range(1..=1000))]
    speed: u32,

    /// Output format: json or csv
    #[arg(short, long, default_value = "json")]
    format: String,

    /// Suppress scenario narration (only output reading data)
    #[arg(short, long)]
    quiet: bool,

    /// Random seed for reproducibility
    #[arg(long)]
    seed: Option<u64>,

    /// City hit by the pollution episode
    #[arg(long, default_value = "Los Angeles")]
    episode_city: String,
}

// ============================================================================
// Scenario Phases
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq)]
enum Phase {
    /// Normal urban air, baselines accumulating (0-40%)
    Baseline,
    /// Stagnant air, episode city PM climbing (40-60%)
    EpisodeBuildup,
    /// Severe smog in the episode city (60-75%)
    EpisodePeak,
    /// Coarse-particulate surge in the dust city (75-85%)
    DustFront,
    /// Dispersal, levels returning to normal (85-100%)
    Recovery,
}

impl Phase {
    fn name(&self) -> &'static str {
        match self {
            Phase::Baseline => "Baseline (Normal Urban Air)",
            Phase::EpisodeBuildup => "Pollution Episode Buildup (Stagnant Air)",
            Phase::EpisodePeak => "Pollution Episode Peak (Severe Smog)",
            Phase::DustFront => "Dust Front (Coarse Particulate Surge)",
            Phase::Recovery => "Recovery (Dispersal)",
        }
    }

    fn from_progress(progress: f64) -> Self {
        match progress {
            p if p < 0.40 => Phase::Baseline,
            p if p < 0.60 => Phase::EpisodeBuildup,
            p if p < 0.75 => Phase::EpisodePeak,
            p if p < 0.85 => Phase::DustFront,
            _ => Phase::Recovery,
        }
    }
}

// ============================================================================
// Simulation State
// ============================================================================

struct SimulationState {
    rng: StdRng,
    current_phase: Phase,

    /// One round = one reading per city, advancing the clock a minute.
    round: u64,
    total_rounds: u64,

    /// Simulated observation clock (UTC)
    clock: DateTime<Utc>,

    episode_index: usize,
    dust_index: usize,

    // Statistics
    readings_generated: u64,
    elevated_readings: u64,

    // Noise distributions (relative multipliers)
    small_noise: Normal<f64>,
    medium_noise: Normal<f64>,
}

impl SimulationState {
    fn new(
        duration_hours: u32,
        episode_index: usize,
        seed: Option<u64>,
    ) -> Result<Self, rand_distr::NormalError> {
        let rng = match seed {
            Some(s) => StdRng::seed_from_u64(s),
            None => StdRng::from_entropy(),
        };

        let total_rounds = u64::from(duration_hours) * 60;

        // Dust front hits Beijing unless it already hosts the episode.
        let dust_index = if episode_index == CITIES.len() - 1 {
            CITIES.len() - 2
        } else {
            CITIES.len() - 1
        };

        Ok(Self {
            rng,
            current_phase: Phase::Baseline,
            round: 0,
            total_rounds,
            // Backdate the clock so the run ends near wall time; every
            // timestamp lands inside the live aggregation windows.
            clock: Utc::now() - TimeDelta::minutes(total_rounds as i64),
            episode_index,
            dust_index,
            readings_generated: 0,
            elevated_readings: 0,
            small_noise: Normal::new(0.0, 0.04)?,
            medium_noise: Normal::new(0.0, 0.12)?,
        })
    }

    fn progress(&self) -> f64 {
        self.round as f64 / self.total_rounds as f64
    }

    fn update_phase(&mut self) -> bool {
        let new_phase = Phase::from_progress(self.progress());
        if new_phase != self.current_phase {
            self.current_phase = new_phase;
            true
        } else {
            false
        }
    }

    /// Generate one reading for the city at `index` in the current phase.
    fn generate_reading(&mut self, index: usize) -> RawReading {
        self.readings_generated += 1;

        let (name, country, latitude, longitude, typical_pm25) = CITIES[index];
        let small = self.small_noise.sample(&mut self.rng);
        let medium = self.medium_noise.sample(&mut self.rng);

        // Normal urban levels; the scenario overrides below.
        let mut pm25 = typical_pm25 * (1.0 + small);
        let mut pm10 = pm25 * (1.7 + small * 0.3);
        let mut no2 = 20.0 * (1.0 + medium);
        let o3 = 30.0 * (1.0 + medium);
        let mut co = 0.5 * (1.0 + small);
        let so2 = 2.0 * (1.0 + small);
        let mut wind_speed = self.rng.gen_range(1.5..9.0);

        let is_episode_city = index == self.episode_index;
        let is_dust_city = index == self.dust_index;

        match self.current_phase {
            Phase::Baseline => {}

            Phase::EpisodeBuildup if is_episode_city => {
                let ramp = ((self.progress() - 0.40) / 0.20).clamp(0.0, 1.0);
                pm25 = (typical_pm25 * (1.0 + 5.0 * ramp) * (1.0 + small)).min(PM25_CEILING);
                pm10 = (pm25 * 1.6).min(PM10_CEILING);
                no2 = 20.0 * (1.0 + 1.5 * ramp) * (1.0 + medium.abs());
                co = 0.5 * (1.0 + 2.0 * ramp);
                // Stagnant air drives the buildup
                wind_speed = self.rng.gen_range(0.2..2.0);
                self.elevated_readings += 1;
            }

            Phase::EpisodePeak if is_episode_city => {
                let ramp = ((self.progress() - 0.60) / 0.15).clamp(0.0, 1.0);
                pm25 = (typical_pm25 * (6.0 + 4.0 * ramp) * (1.0 + small)).min(PM25_CEILING);
                pm10 = (pm25 * 1.6).min(PM10_CEILING);
                no2 = 50.0 * (1.0 + medium.abs());
                co = (1.5 + 1.0 * ramp) * (1.0 + small);
                wind_speed = self.rng.gen_range(0.2..1.5);
                self.elevated_readings += 1;
            }

            Phase::DustFront if is_dust_city => {
                let ramp = ((self.progress() - 0.75) / 0.10).clamp(0.0, 1.0);
                // Coarse-dominant: PM10 surges far ahead of PM2.5
                pm10 = (250.0 + 250.0 * ramp * (1.0 + small)).min(PM10_CEILING);
                pm25 = typical_pm25 * (1.5 + ramp) * (1.0 + small);
                wind_speed = self.rng.gen_range(8.0..18.0);
                self.elevated_readings += 1;
            }

            Phase::Recovery if is_episode_city => {
                let decay = 1.0 - ((self.progress() - 0.85) / 0.15).clamp(0.0, 1.0);
                pm25 = (typical_pm25 * (1.0 + 9.0 * decay) * (1.0 + small)).min(PM25_CEILING);
                pm10 = (pm25 * 1.6).min(PM10_CEILING);
                no2 = 20.0 * (1.0 + 1.5 * decay);
                co = 0.5 * (1.0 + 2.0 * decay);
            }

            Phase::Recovery if is_dust_city => {
                let decay = 1.0 - ((self.progress() - 0.85) / 0.15).clamp(0.0, 1.0);
                pm10 = (pm10 + (500.0 - pm10) * decay).min(PM10_CEILING);
                pm25 = typical_pm25 * (1.0 + 1.5 * decay);
            }

            _ => {}
        }

        RawReading {
            city: name.to_string(),
            country: country.to_string(),
            latitude,
            longitude,
            timestamp: self.clock.to_rfc3339(),
            source: "simulated".to_string(),
            pm25: Some(pm25.max(0.5)),
            pm10: Some(pm10.max(1.0)),
            co: Some(co.max(0.05)),
            no2: Some(no2.max(1.0)),
            o3: Some(o3.max(1.0)),
            so2: Some(so2.max(0.2)),
            temperature: Some(self.rng.gen_range(8.0..28.0)),
            humidity: Some(self.rng.gen_range(35.0..85.0)),
            pressure: Some(self.rng.gen_range(995.0..1030.0)),
            wind_speed: Some(wind_speed),
        }
    }
}

// ============================================================================
// Logging Utilities
// ============================================================================

fn log_scenario(clock: DateTime<Utc>, message: &str, quiet: bool) {
    if !quiet {
        eprintln!("[{}] {}", clock.format("%H:%M:%S"), message);
    }
}

// ============================================================================
// Main Entry Point
// ============================================================================

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    let episode_index = CITIES
        .iter()
        .position(|(name, ..)| name.eq_ignore_ascii_case(&args.episode_city))
        .ok_or_else(|| {
            let roster: Vec<&str> = CITIES.iter().map(|(name, ..)| *name).collect();
            format!(
                "Unknown episode city '{}'. Roster: {}",
                args.episode_city,
                roster.join(", ")
            )
        })?;

    let mut state = SimulationState::new(args.hours, episode_index, args.seed)?;

    let episode_city = CITIES[state.episode_index].0;
    let dust_city = CITIES[state.dust_index].0;
    let total_readings = state.total_rounds * CITIES.len() as u64;
    let round_interval = Duration::from_secs_f64(60.0 / f64::from(args.speed));

    // Scenario briefing
    let clock0 = state.clock;
    log_scenario(clock0, &"=".repeat(70), args.quiet);
    log_scenario(clock0, "AIR QUALITY SIMULATION v1.0", args.quiet);
    log_scenario(clock0, "AIRWARDEN Monitoring Core Test Data Generator", args.quiet);
    log_scenario(clock0, &"=".repeat(70), args.quiet);
    log_scenario(clock0, "", args.quiet);
    log_scenario(clock0, "CITY ROSTER:", args.quiet);
    for (name, country, _, _, typical) in CITIES {
        log_scenario(
            clock0,
            &format!("  {} ({}): typical PM2.5 {:.0} µg/m³", name, country, typical),
            args.quiet,
        );
    }
    log_scenario(clock0, "", args.quiet);
    log_scenario(clock0, "SIMULATION PARAMETERS:", args.quiet);
    log_scenario(
        clock0,
        &format!(
            "  Duration: {} hours ({} readings across {} cities)",
            args.hours,
            total_readings,
            CITIES.len()
        ),
        args.quiet,
    );
    log_scenario(clock0, &format!("  Speed: {}x compression", args.speed), args.quiet);
    log_scenario(clock0, &format!("  Episode city: {}", episode_city), args.quiet);
    log_scenario(clock0, &format!("  Dust front city: {}", dust_city), args.quiet);
    if let Some(seed) = args.seed {
        log_scenario(clock0, &format!("  Random seed: {}", seed), args.quiet);
    }
    log_scenario(clock0, "", args.quiet);
    log_scenario(clock0, "SCENARIO PHASES:", args.quiet);
    log_scenario(clock0, "  0-40%:   Baseline (normal urban air)", args.quiet);
    log_scenario(clock0, "  40-60%:  Episode buildup (stagnant air)", args.quiet);
    log_scenario(clock0, "  60-75%:  Episode peak (severe smog)", args.quiet);
    log_scenario(clock0, "  75-85%:  Dust front (PM10 surge)", args.quiet);
    log_scenario(clock0, "  85-100%: Recovery (dispersal)", args.quiet);
    log_scenario(clock0, &"=".repeat(70), args.quiet);
    log_scenario(clock0, "SIMULATION START", args.quiet);
    log_scenario(clock0, &"=".repeat(70), args.quiet);

    // CSV header if needed
    if args.format == "csv" {
        println!("city,country,latitude,longitude,timestamp,source,pm25,pm10,no2,o3,co,so2");
    }

    let start_time = Instant::now();
    let mut last_log_percent = 0;

    let stdout = io::stdout();
    let mut stdout_lock = stdout.lock();

    // Main simulation loop
    while state.round < state.total_rounds {
        let loop_start = Instant::now();

        // Phase transition logging
        if state.update_phase() {
            log_scenario(state.clock, "", args.quiet);
            log_scenario(
                state.clock,
                &format!(">>> PHASE: {}", state.current_phase.name()),
                args.quiet,
            );

            match state.current_phase {
                Phase::Baseline => {
                    log_scenario(state.clock, "    Normal levels in every city", args.quiet);
                    log_scenario(state.clock, "    Expected: no alerts, baselines accumulating", args.quiet);
                }
                Phase::EpisodeBuildup => {
                    log_scenario(
                        state.clock,
                        &format!("    PM2.5 climbing in {} under stagnant air", episode_city),
                        args.quiet,
                    );
                    log_scenario(state.clock, "    Expected: warning-level threshold alerts", args.quiet);
                }
                Phase::EpisodePeak => {
                    log_scenario(
                        state.clock,
                        &format!("    SEVERE SMOG in {} with correlated NO2/CO", episode_city),
                        args.quiet,
                    );
                    log_scenario(state.clock, "    Expected: CRITICAL threshold and anomaly alerts", args.quiet);
                }
                Phase::DustFront => {
                    log_scenario(
                        state.clock,
                        &format!("    Coarse particulate surge hitting {}", dust_city),
                        args.quiet,
                    );
                    log_scenario(state.clock, "    Expected: PM10 threshold alerts", args.quiet);
                }
                Phase::Recovery => {
                    log_scenario(state.clock, "    Winds dispersing both events", args.quiet);
                    log_scenario(state.clock, "    Expected: alerts clearing as levels drop", args.quiet);
                }
            }
            log_scenario(state.clock, "", args.quiet);
        }

        // Progress logging (every 10%)
        let current_percent = (state.progress() * 100.0) as u32 / 10 * 10;
        if current_percent > last_log_percent && current_percent <= 100 {
            log_scenario(
                state.clock,
                &format!(
                    "Progress: {}% | {} readings | {} elevated",
                    current_percent, state.readings_generated, state.elevated_readings
                ),
                args.quiet,
            );
            last_log_percent = current_percent;
        }

        // One reading per city this simulated minute
        for index in 0..CITIES.len() {
            let reading = state.generate_reading(index);

            match args.format.as_str() {
                "csv" => {
                    writeln!(
                        stdout_lock,
                        "{},{},{:.4},{:.4},{},{},{:.1},{:.1},{:.1},{:.1},{:.2},{:.1}",
                        reading.city,
                        reading.country,
                        reading.latitude,
                        reading.longitude,
                        reading.timestamp,
                        reading.source,
                        reading.pm25.unwrap_or(0.0),
                        reading.pm10.unwrap_or(0.0),
                        reading.no2.unwrap_or(0.0),
                        reading.o3.unwrap_or(0.0),
                        reading.co.unwrap_or(0.0),
                        reading.so2.unwrap_or(0.0),
                    )?;
                }
                _ => {
                    let json = serde_json::to_string(&reading)?;
                    writeln!(stdout_lock, "{}", json)?;
                }
            }
        }

        stdout_lock.flush()?;

        // Advance the simulated clock
        state.round += 1;
        state.clock += TimeDelta::minutes(1);

        // Sleep for time compression
        if args.speed < 1000 {
            let elapsed = loop_start.elapsed();
            if elapsed < round_interval {
                std::thread::sleep(round_interval - elapsed);
            }
        }
    }

    stdout_lock.flush()?;
    drop(stdout_lock);

    // Run summary
    let total_elapsed = start_time.elapsed();

    log_scenario(state.clock, &"=".repeat(70), args.quiet);
    log_scenario(state.clock, "SIMULATION COMPLETE", args.quiet);
    log_scenario(state.clock, &"=".repeat(70), args.quiet);
    log_scenario(state.clock, &format!("Total readings: {}", state.readings_generated), args.quiet);
    log_scenario(state.clock, &format!("Elevated readings: {}", state.elevated_readings), args.quiet);
    log_scenario(
        state.clock,
        &format!("Real time: {:.1}s", total_elapsed.as_secs_f64()),
        args.quiet,
    );
    log_scenario(state.clock, &"=".repeat(70), args.quiet);

    Ok(())
}
