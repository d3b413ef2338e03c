use serde::{Deserialize, Serialize};

/// Bounds how far inserts may run ahead of samples.
///
/// With `diff = inserts * samples_per_insert - samples`, an insert is allowed
/// while `diff + samples_per_insert <= max_diff` and a sample while the table
/// holds at least `min_size_to_sample` items and `diff - 1 >= min_diff`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RateLimiter {
    pub samples_per_insert: f64,
    pub min_size_to_sample: usize,
    pub min_diff: f64,
    pub max_diff: f64,
}

impl RateLimiter {
    /// Every item is sampled exactly once, and writers may be at most `size`
    /// items ahead.
    pub fn queue(size: usize) -> Self {
        Self {
            samples_per_insert: 1.0,
            min_size_to_sample: 1,
            min_diff: 0.0,
            max_diff: size as f64,
        }
    }

    /// Samples wait for `min_size` items; nothing else is limited.
    pub fn min_size(min_size: usize) -> Self {
        Self {
            samples_per_insert: 1.0,
            min_size_to_sample: min_size,
            min_diff: f64::MIN,
            max_diff: f64::MAX,
        }
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.samples_per_insert.is_nan() || self.samples_per_insert <= 0.0 {
            return Err("samples_per_insert must be greater than 0".to_string());
        }
        if self.min_size_to_sample == 0 {
            return Err("min_size_to_sample must be greater than 0".to_string());
        }
        if self.min_diff > self.max_diff {
            return Err("min_diff must not exceed max_diff".to_string());
        }
        Ok(())
    }

    fn diff(&self, inserts: u64, samples: u64) -> f64 {
        inserts as f64 * self.samples_per_insert - samples as f64
    }

    pub fn can_insert(&self, inserts: u64, samples: u64) -> bool {
        self.diff(inserts, samples) + self.samples_per_insert <= self.max_diff
    }

    pub fn can_sample(&self, size: usize, inserts: u64, samples: u64) -> bool {
        size >= self.min_size_to_sample && self.diff(inserts, samples) - 1.0 >= self.min_diff
    }
}
