//! Rolling statistical baselines for anomaly detection
//!
//! One [`MetricBaseline`] per (city, metric) pair, maintained by the
//! detector. Uses Welford's online algorithm so mean and variance stay
//! numerically stable over long runs without keeping samples around.

/// Relative floor applied to the standard deviation. A flat baseline
/// (all samples identical) would otherwise make every deviation an
/// infinite z-score.
pub const STD_FLOOR: f64 = 0.001;

/// Online mean/variance accumulator for one metric's recent history.
#[derive(Debug, Clone, Default)]
pub struct MetricBaseline {
    count: u64,
    mean: f64,
    m2: f64,
}

impl MetricBaseline {
    pub fn new() -> Self {
        Self::default()
    }

    /// Baseline pre-filled from stored history values.
    pub fn seeded<I>(values: I) -> Self
    where
        I: IntoIterator<Item = f64>,
    {
        let mut baseline = Self::new();
        for value in values {
            baseline.observe(value);
        }
        baseline
    }

    /// Fold one sample in (Welford update).
    ///
    /// Non-finite values are ignored. A single NaN would permanently
    /// corrupt the running mean and m2.
    pub fn observe(&mut self, value: f64) {
        if !value.is_finite() {
            return;
        }
        self.count += 1;
        let delta = value - self.mean;
        self.mean += delta / self.count as f64;
        let delta2 = value - self.mean;
        self.m2 += delta * delta2;
    }

    pub fn count(&self) -> u64 {
        self.count
    }

    pub fn mean(&self) -> f64 {
        self.mean
    }

    /// Sample variance (n - 1 denominator).
    pub fn variance(&self) -> f64 {
        if self.count < 2 {
            0.0
        } else {
            self.m2 / (self.count - 1) as f64
        }
    }

    pub fn std_dev(&self) -> f64 {
        self.variance().sqrt()
    }

    /// Standard deviation with the divide-by-zero floor applied:
    /// never below 0.1% of the mean's magnitude, never below the
    /// absolute floor.
    pub fn effective_std(&self) -> f64 {
        let min_std = (self.mean.abs() * STD_FLOOR).max(STD_FLOOR);
        self.std_dev().max(min_std)
    }

    /// Signed standard deviations from the baseline mean.
    pub fn z_score(&self, value: f64) -> f64 {
        (value - self.mean) / self.effective_std()
    }
}
