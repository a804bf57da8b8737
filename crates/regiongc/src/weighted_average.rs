//! Exponentially weighted averages used by adaptive sizing

/// Samples after which the average stops over-weighting early samples
const OLD_THRESHOLD: u32 = 100;

/// Weighted average where each new sample gets `weight` percent.
///
/// While fewer than `OLD_THRESHOLD` samples were seen the weight is raised to
/// `OLD_THRESHOLD / count` so the first samples are not drowned out by the
/// initial zero average.
#[derive(Debug, Clone)]
pub struct AdaptiveWeightedAverage {
    average: f64,
    sample_count: u32,
    weight: u32,
    is_old: bool,
    last_sample: f64,
}

impl AdaptiveWeightedAverage {
    /// New average giving `weight` percent to each sample
    pub fn new(weight: u32) -> Self {
        Self {
            average: 0.0,
            sample_count: 0,
            weight: weight.min(100),
            is_old: false,
            last_sample: 0.0,
        }
    }

    /// Current average
    pub fn average(&self) -> f64 {
        self.average
    }

    /// Most recent sample
    pub fn last_sample(&self) -> f64 {
        self.last_sample
    }

    /// Number of samples taken
    pub fn count(&self) -> u32 {
        self.sample_count
    }

    /// Add a sample
    pub fn sample(&mut self, value: f64) {
        self.sample_count = self.sample_count.saturating_add(1);
        if !self.is_old && self.sample_count > OLD_THRESHOLD {
            self.is_old = true;
        }
        let count_weight = if self.is_old {
            0
        } else {
            OLD_THRESHOLD / self.sample_count
        };
        let weight = self.weight.max(count_weight).min(100) as f64;
        self.average = (100.0 - weight) * self.average / 100.0 + weight * value / 100.0;
        self.last_sample = value;
    }
}

/// Decaying average with a fixed smoothing factor, used for cost predictions
#[derive(Debug, Clone)]
pub struct DecayingAverage {
    alpha: f64,
    value: Option<f64>,
}

impl DecayingAverage {
    /// Average where each sample gets `alpha` of the weight
    pub fn new(alpha: f64) -> Self {
        Self { alpha, value: None }
    }

    /// Add a sample
    pub fn add(&mut self, sample: f64) {
        self.value = Some(match self.value {
            None => sample,
            Some(v) => v * (1.0 - self.alpha) + sample * self.alpha,
        });
    }

    /// Current value or `default` if no sample was taken
    pub fn get_or(&self, default: f64) -> f64 {
        self.value.unwrap_or(default)
    }
}
