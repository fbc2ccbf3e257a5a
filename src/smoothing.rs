/// Exponential moving average of the gyroscope sampling interval.
///
/// Provides a trustworthy fallback `dt` when a gap between gyro events is
/// abnormally long (dropped samples, thread stalls).
#[derive(Debug, Clone)]
pub struct GyroTimestepFilter {
    coeff: f64,
    min_samples: u32,
    filtered: f64,
    samples: u32,
}

impl GyroTimestepFilter {
    /// Create a filter with smoothing coefficient `coeff` (weight of the old average)
    /// that becomes valid once more than `min_samples` intervals have been seen.
    pub fn new(coeff: f64, min_samples: u32) -> Self {
        GyroTimestepFilter {
            coeff,
            min_samples,
            filtered: 0.0,
            samples: 0,
        }
    }

    /// Feed one measured interval in seconds
    pub fn push(&mut self, timestep: f64) {
        if self.samples == 0 {
            self.filtered = timestep;
        } else {
            self.filtered = self.coeff * self.filtered + (1.0 - self.coeff) * timestep;
        }
        self.samples = self.samples.saturating_add(1);
    }

    pub fn is_valid(&self) -> bool {
        self.samples > self.min_samples
    }

    /// Filtered interval, once enough samples have been seen
    pub fn timestep(&self) -> Option<f64> {
        if self.is_valid() {
            Some(self.filtered)
        } else {
            None
        }
    }

    pub fn sample_count(&self) -> u32 {
        self.samples
    }

    pub fn reset(&mut self) {
        self.filtered = 0.0;
        self.samples = 0;
    }
}
