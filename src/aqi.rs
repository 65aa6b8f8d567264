//! AQI computation from pollutant concentrations
//!
//! Implements the EPA piecewise-linear index: each pollutant maps through a
//! fixed breakpoint table to a 0-500 sub-index, and the overall AQI is the
//! maximum sub-index across pollutants present (worst-pollutant rule).
//!
//! ## Policy as data
//!
//! Breakpoint tables are plain data on [`AqiScale`], not match arms, so a
//! deployment can load revised tables without touching the interpolation
//! code. [`AqiScale::epa_defaults`] carries the standard US EPA tables for
//! PM2.5 (µg/m³), PM10 (µg/m³), and ozone (ppb). Pollutants without a table
//! (CO, NO2, SO2) contribute no sub-index; a measurement carrying only
//! untabled pollutants receives the neutral default index.

use crate::types::{AqiCategory, Metric};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Sub-index assigned when no tabled pollutant is present.
pub const DEFAULT_AQI: u16 = 50;

/// Index reported when a concentration exceeds the top of its table.
pub const MAX_AQI: u16 = 500;

/// One linear segment of a breakpoint table.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Breakpoint {
    pub conc_low: f64,
    pub conc_high: f64,
    pub index_low: f64,
    pub index_high: f64,
}

impl Breakpoint {
    const fn new(conc_low: f64, conc_high: f64, index_low: f64, index_high: f64) -> Self {
        Self {
            conc_low,
            conc_high,
            index_low,
            index_high,
        }
    }
}

/// Breakpoint tables for all tabled pollutants.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AqiScale {
    tables: BTreeMap<Metric, Vec<Breakpoint>>,
}

impl AqiScale {
    /// Standard US EPA breakpoint tables.
    pub fn epa_defaults() -> Self {
        let mut tables = BTreeMap::new();
        tables.insert(
            Metric::Pm25,
            vec![
                Breakpoint::new(0.0, 12.0, 0.0, 50.0),
                Breakpoint::new(12.1, 35.4, 51.0, 100.0),
                Breakpoint::new(35.5, 55.4, 101.0, 150.0),
                Breakpoint::new(55.5, 150.4, 151.0, 200.0),
                Breakpoint::new(150.5, 250.4, 201.0, 300.0),
                Breakpoint::new(250.5, 500.4, 301.0, 500.0),
            ],
        );
        tables.insert(
            Metric::Pm10,
            vec![
                Breakpoint::new(0.0, 54.0, 0.0, 50.0),
                Breakpoint::new(55.0, 154.0, 51.0, 100.0),
                Breakpoint::new(155.0, 254.0, 101.0, 150.0),
                Breakpoint::new(255.0, 354.0, 151.0, 200.0),
                Breakpoint::new(355.0, 424.0, 201.0, 300.0),
                Breakpoint::new(425.0, 604.0, 301.0, 500.0),
            ],
        );
        tables.insert(
            Metric::O3,
            vec![
                Breakpoint::new(0.0, 54.0, 0.0, 50.0),
                Breakpoint::new(55.0, 70.0, 51.0, 100.0),
                Breakpoint::new(71.0, 85.0, 101.0, 150.0),
                Breakpoint::new(86.0, 105.0, 151.0, 200.0),
                Breakpoint::new(106.0, 200.0, 201.0, 300.0),
            ],
        );
        Self { tables }
    }

    /// Sub-index for one pollutant concentration, or `None` if the
    /// pollutant has no table.
    ///
    /// Concentrations falling in the gap between two segments snap up to
    /// the start of the higher segment; concentrations above the top of the
    /// table saturate at [`MAX_AQI`].
    pub fn sub_index(&self, metric: Metric, concentration: f64) -> Option<u16> {
        let table = self.tables.get(&metric)?;

        for segment in table {
            if concentration <= segment.conc_high {
                let conc = concentration.max(segment.conc_low);
                let span = segment.conc_high - segment.conc_low;
                let index = if span > 0.0 {
                    (segment.index_high - segment.index_low) / span * (conc - segment.conc_low)
                        + segment.index_low
                } else {
                    segment.index_low
                };
                return Some(index.round().clamp(0.0, f64::from(MAX_AQI)) as u16);
            }
        }

        Some(MAX_AQI)
    }

    /// Overall AQI and category over (metric, concentration) pairs.
    ///
    /// Worst-pollutant rule: the overall index is the maximum sub-index.
    /// When none of the supplied pollutants is tabled, the neutral
    /// [`DEFAULT_AQI`] is returned.
    pub fn overall<'a, I>(&self, concentrations: I) -> (u16, AqiCategory)
    where
        I: IntoIterator<Item = (Metric, f64)>,
    {
        let aqi = concentrations
            .into_iter()
            .filter_map(|(metric, value)| self.sub_index(metric, value))
            .max()
            .unwrap_or(DEFAULT_AQI);

        (aqi, AqiCategory::from_index(aqi))
    }
}

impl Default for AqiScale {
    fn default() -> Self {
        Self::epa_defaults()
    }
}
