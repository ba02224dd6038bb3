//! Linear-FM chirp synthesis
//!
//! Generates the ultrasonic test pulse: a quadratic-phase sweep from the
//! start to the end frequency, shaped by a Hamming window so the pulse edges
//! do not splatter energy into the audible band.

use crate::config::RunConfig;
use std::f64::consts::PI;
use std::sync::Arc;

/// Peak amplitude as a fraction of full scale (~-0.45dBFS)
const CHIRP_AMPLITUDE: f64 = 0.95;

/// Immutable chirp waveform plus the parameters it was generated from
///
/// Cloning is cheap; the samples are shared.
///
/// # Example
/// ```
/// use echotester_core::audio::chirp::ChirpTemplate;
///
/// let chirp = ChirpTemplate::generate(18000, 22000, 20, 48000);
/// assert_eq!(chirp.len(), 960); // 20ms at 48kHz
/// ```
#[derive(Debug, Clone, PartialEq)]
pub struct ChirpTemplate {
    min_freq: u32,
    max_freq: u32,
    duration_ms: u32,
    sample_rate: u32,
    samples: Arc<[i16]>,
}

impl ChirpTemplate {
    /// Synthesize a chirp
    ///
    /// # Arguments
    /// * `min_freq` - Sweep start frequency in Hz
    /// * `max_freq` - Sweep end frequency in Hz
    /// * `duration_ms` - Pulse length in milliseconds
    /// * `sample_rate` - Sample rate in Hz
    pub fn generate(min_freq: u32, max_freq: u32, duration_ms: u32, sample_rate: u32) -> Self {
        let n = (sample_rate as f64 * duration_ms as f64 / 1000.0).round() as usize;
        let sr = sample_rate as f64;
        let f0 = min_freq as f64;
        let duration_s = duration_ms as f64 / 1000.0;
        let chirp_rate = if duration_s > 0.0 {
            (max_freq as f64 - f0) / duration_s
        } else {
            0.0
        };
        let peak = CHIRP_AMPLITUDE * i16::MAX as f64;

        let samples: Arc<[i16]> = (0..n)
            .map(|i| {
                let t = i as f64 / sr;
                let phase = 2.0 * PI * (f0 * t + 0.5 * chirp_rate * t * t);
                let window = hamming(i, n);
                let value = (peak * window * phase.sin()).round();
                value.clamp(i16::MIN as f64, i16::MAX as f64) as i16
            })
            .collect();

        let template = Self {
            min_freq,
            max_freq,
            duration_ms,
            sample_rate,
            samples,
        };

        tracing::debug!(
            samples = n,
            duration_ms,
            min_freq,
            max_freq,
            peak = template.peak(),
            "Chirp generated"
        );

        template
    }

    /// Synthesize the chirp described by a run configuration
    pub fn from_config(config: &RunConfig) -> Self {
        Self::generate(
            config.chirp_min_freq,
            config.chirp_max_freq,
            config.chirp_duration_ms,
            config.sample_rate,
        )
    }

    /// Whether this template was generated from the chirp parameters of `config`
    pub fn matches(&self, config: &RunConfig) -> bool {
        self.min_freq == config.chirp_min_freq
            && self.max_freq == config.chirp_max_freq
            && self.duration_ms == config.chirp_duration_ms
            && self.sample_rate == config.sample_rate
    }

    /// Waveform samples
    pub fn samples(&self) -> &[i16] {
        &self.samples
    }

    /// Length in samples
    pub fn len(&self) -> usize {
        self.samples.len()
    }

    /// Whether the template has no samples (zero duration)
    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// Largest absolute sample value
    pub fn peak(&self) -> u16 {
        self.samples
            .iter()
            .map(|s| s.unsigned_abs())
            .max()
            .unwrap_or(0)
    }

    /// Sweep start frequency in Hz
    pub fn min_freq(&self) -> u32 {
        self.min_freq
    }

    /// Sweep end frequency in Hz
    pub fn max_freq(&self) -> u32 {
        self.max_freq
    }

    /// Pulse length in milliseconds
    pub fn duration_ms(&self) -> u32 {
        self.duration_ms
    }

    /// Sample rate in Hz
    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }
}

/// Hamming window coefficient for sample `i` of `n`
fn hamming(i: usize, n: usize) -> f64 {
    if n <= 1 {
        return 1.0;
    }
    0.54 - 0.46 * (2.0 * PI * i as f64 / (n - 1) as f64).cos()
}
