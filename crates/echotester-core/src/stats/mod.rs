//! Raw signal statistics
//!
//! Running min/max/mean/RMS over 16-bit samples. Used for the whole-capture
//! summary in a [`crate::TestResult`] and for per-chunk trace logging.

use serde::Serialize;

/// Running statistics over a stream of 16-bit samples
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct SignalStats {
    /// Smallest sample seen (0 when empty)
    pub min: i16,
    /// Largest sample seen (0 when empty)
    pub max: i16,
    /// Number of samples accumulated
    pub count: u64,
    sum: f64,
    sum_squared: f64,
}

impl SignalStats {
    /// Create an empty accumulator
    pub fn new() -> Self {
        Self::default()
    }

    /// Compute statistics over a slice in one pass
    ///
    /// # Example
    /// ```
    /// use echotester_core::stats::SignalStats;
    ///
    /// let stats = SignalStats::from_samples(&[-3, 0, 3]);
    /// assert_eq!(stats.min, -3);
    /// assert_eq!(stats.max, 3);
    /// assert_eq!(stats.mean(), 0.0);
    /// ```
    pub fn from_samples(samples: &[i16]) -> Self {
        let mut stats = Self::new();
        stats.extend(samples);
        stats
    }

    /// Add a single sample
    pub fn push(&mut self, sample: i16) {
        if self.count == 0 {
            self.min = sample;
            self.max = sample;
        } else {
            self.min = self.min.min(sample);
            self.max = self.max.max(sample);
        }
        let s = sample as f64;
        self.sum += s;
        self.sum_squared += s * s;
        self.count += 1;
    }

    /// Add every sample of a slice
    pub fn extend(&mut self, samples: &[i16]) {
        for &s in samples {
            self.push(s);
        }
    }

    /// Arithmetic mean (0.0 when empty)
    pub fn mean(&self) -> f64 {
        if self.count == 0 {
            0.0
        } else {
            self.sum / self.count as f64
        }
    }

    /// Root mean square (0.0 when empty)
    pub fn rms(&self) -> f64 {
        if self.count == 0 {
            0.0
        } else {
            (self.sum_squared / self.count as f64).sqrt()
        }
    }

    /// Peak-to-peak range (max - min)
    pub fn range(&self) -> i32 {
        self.max as i32 - self.min as i32
    }

    /// Whether no samples have been accumulated
    pub fn is_empty(&self) -> bool {
        self.count == 0
    }
}
