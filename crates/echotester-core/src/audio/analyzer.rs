//! Echo presence analysis
//!
//! Reduces one run's capture to a [`TestResult`]. For every emitted chirp the
//! analyzer compares the mean energy of an echo window (5-50ms after the chirp
//! ends) with a noise window (the 1000 samples before the chirp starts),
//! locates the strongest sample in the echo window, and aggregates the
//! per-chirp figures into an SNR and a quality verdict.
//!
//! Chirp positions are estimated from emission timestamps, not from the
//! capture stream itself, so scheduling jitter between the playback write and
//! the capture reads shifts both windows by the same amount.

use crate::audio::session::{CaptureRecord, ChirpEvent};
use crate::config::{
    ChirpAlignment, RunConfig, ECHO_WINDOW_END_MS, ECHO_WINDOW_START_MS, NOISE_WINDOW_SAMPLES,
};
use crate::stats::SignalStats;
use serde::Serialize;
use std::fmt;

/// SNR above which a detected echo is rated excellent
const EXCELLENT_SNR_DB: f64 = 10.0;

/// SNR above which a detected echo is rated good
const GOOD_SNR_DB: f64 = 5.0;

/// Echo quality verdict
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub enum QualityTier {
    VeryPoor,
    Poor,
    Fair,
    Good,
    Excellent,
    /// Not enough data to judge
    #[default]
    Unknown,
}

impl QualityTier {
    /// Human readable label
    pub fn label(&self) -> &'static str {
        match self {
            QualityTier::VeryPoor => "Very Poor",
            QualityTier::Poor => "Poor",
            QualityTier::Fair => "Fair",
            QualityTier::Good => "Good",
            QualityTier::Excellent => "Excellent",
            QualityTier::Unknown => "Unknown",
        }
    }
}

impl fmt::Display for QualityTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Outcome of one echo test run
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct TestResult {
    /// Whether echo energy and SNR both cleared their thresholds
    pub echo_detected: bool,
    /// Quality verdict
    pub quality: QualityTier,
    /// Mean echo-window energy across contributing chirps
    pub signal_energy: f64,
    /// Echo to noise energy ratio in dB
    pub snr_db: f64,
    /// Peak-to-peak range of the whole capture
    pub peak_amplitude: f64,
    /// Mean delay from chirp end to echo peak in milliseconds
    pub echo_delay_ms: f64,
    /// Number of chirps whose echo window held a peak
    pub echo_count: usize,
    /// Smallest captured sample
    pub min_value: i16,
    /// Largest captured sample
    pub max_value: i16,
    /// Mean of all captured samples
    pub mean_value: f64,
    /// RMS of all captured samples
    pub rms_value: f64,
}

impl fmt::Display for TestResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "Echo Detection: {}",
            if self.echo_detected { "YES" } else { "NO" }
        )?;
        writeln!(f, "Signal Quality: {}", self.quality)?;
        writeln!(f, "Signal Energy: {:.2}", self.signal_energy)?;
        writeln!(f, "SNR: {:.2} dB", self.snr_db)?;
        writeln!(f, "Peak Amplitude: {:.2}", self.peak_amplitude)?;
        writeln!(f, "Echo Delay: {:.2} ms", self.echo_delay_ms)?;
        writeln!(f, "Echo Count: {}", self.echo_count)?;
        write!(
            f,
            "Raw Stats: Min: {} | Max: {} | Mean: {:.2} | RMS: {:.2}",
            self.min_value, self.max_value, self.mean_value, self.rms_value
        )
    }
}

/// Figures for a single chirp that contributed to the result
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ChirpAnalysis {
    /// Emission index of the chirp
    pub index: usize,
    /// Estimated sample index of the chirp start
    pub start_sample: usize,
    /// Mean squared amplitude in the echo window
    pub echo_energy: f64,
    /// Mean squared amplitude in the noise window
    pub noise_energy: f64,
    /// Per-chirp SNR in dB (0 when the noise window is silent)
    pub snr_db: f64,
    /// Absolute sample index of the echo peak
    pub peak_index: Option<usize>,
    /// Delay from chirp end to echo peak in milliseconds
    pub delay_ms: Option<f64>,
}

/// Aggregate result plus the per-chirp breakdown
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct AnalysisReport {
    pub result: TestResult,
    pub chirps: Vec<ChirpAnalysis>,
}

/// Windowed-energy echo analyzer
#[derive(Debug, Clone)]
pub struct EchoAnalyzer {
    /// Sample rate in Hz
    sample_rate: u32,
    /// Chirp length in samples
    chirp_len: usize,
    /// Echo window start, in samples after chirp end
    echo_start_offset: usize,
    /// Echo window end, in samples after chirp end
    echo_end_offset: usize,
    /// Minimum mean echo energy for detection
    echo_threshold: f64,
    /// Minimum SNR (dB) for detection
    snr_threshold: f64,
    /// Timestamp to sample index mapping
    alignment: ChirpAlignment,
}

impl EchoAnalyzer {
    /// Create an analyzer for the given run configuration
    pub fn new(config: &RunConfig) -> Self {
        Self {
            sample_rate: config.sample_rate,
            chirp_len: config.chirp_samples(),
            echo_start_offset: config.ms_to_samples(ECHO_WINDOW_START_MS),
            echo_end_offset: config.ms_to_samples(ECHO_WINDOW_END_MS),
            echo_threshold: config.echo_threshold,
            snr_threshold: config.snr_threshold,
            alignment: config.alignment,
        }
    }

    /// Analyze a capture and return the aggregate result
    pub fn analyze(&self, capture: CaptureRecord, chirps: &[ChirpEvent]) -> TestResult {
        self.analyze_detailed(capture, chirps).result
    }

    /// Analyze a capture and return the result with per-chirp figures
    ///
    /// Never fails: empty input yields a zeroed result with
    /// [`QualityTier::Unknown`].
    pub fn analyze_detailed(&self, capture: CaptureRecord, chirps: &[ChirpEvent]) -> AnalysisReport {
        if capture.is_empty() || chirps.is_empty() {
            tracing::warn!(
                samples = capture.total_samples(),
                chirps = chirps.len(),
                "No recordings or chirps to analyze"
            );
            return AnalysisReport::default();
        }

        tracing::info!(
            chunks = capture.chunks().len(),
            chirps = chirps.len(),
            "Analyzing capture"
        );

        let samples = capture.into_contiguous();
        let stats = SignalStats::from_samples(&samples);

        let mut result = TestResult {
            min_value: stats.min,
            max_value: stats.max,
            mean_value: stats.mean(),
            rms_value: stats.rms(),
            ..TestResult::default()
        };

        let origin_ms = match self.alignment {
            ChirpAlignment::CaptureStart => 0,
            ChirpAlignment::FirstChirp => chirps[0].timestamp_ms,
        };

        let per_chirp: Vec<ChirpAnalysis> = chirps
            .iter()
            .filter_map(|event| self.analyze_chirp(&samples, event, origin_ms))
            .collect();

        if per_chirp.is_empty() {
            tracing::warn!(
                samples = samples.len(),
                "No chirp had usable echo and noise windows"
            );
            return AnalysisReport {
                result,
                chirps: per_chirp,
            };
        }

        let count = per_chirp.len() as f64;
        let avg_echo = per_chirp.iter().map(|c| c.echo_energy).sum::<f64>() / count;
        let avg_noise = per_chirp.iter().map(|c| c.noise_energy).sum::<f64>() / count;
        let snr_db = snr_db(avg_echo, avg_noise);

        let delays: Vec<f64> = per_chirp.iter().filter_map(|c| c.delay_ms).collect();
        let avg_delay = if delays.is_empty() {
            0.0
        } else {
            delays.iter().sum::<f64>() / delays.len() as f64
        };

        let (detected, quality) = self.classify(avg_echo, snr_db);

        result.echo_detected = detected;
        result.quality = quality;
        result.signal_energy = avg_echo;
        result.snr_db = snr_db;
        result.peak_amplitude = stats.range() as f64;
        result.echo_delay_ms = avg_delay;
        result.echo_count = delays.len();

        tracing::info!(
            detected,
            quality = %quality,
            energy = %format!("{:.2}", avg_echo),
            snr_db = %format!("{:.2}", snr_db),
            count = result.echo_count,
            "Analysis complete"
        );

        AnalysisReport {
            result,
            chirps: per_chirp,
        }
    }

    /// Apply the detection rule and quality tiers to aggregate figures
    ///
    /// # Example
    /// ```
    /// use echotester_core::{EchoAnalyzer, QualityTier, RunConfig};
    ///
    /// let analyzer = EchoAnalyzer::new(&RunConfig::default());
    /// assert_eq!(analyzer.classify(41.0, 11.0), (true, QualityTier::Excellent));
    /// assert_eq!(analyzer.classify(10.0, 0.3), (false, QualityTier::VeryPoor));
    /// ```
    pub fn classify(&self, avg_echo_energy: f64, snr_db: f64) -> (bool, QualityTier) {
        let detected = avg_echo_energy > self.echo_threshold && snr_db > self.snr_threshold;

        let quality = if detected {
            if snr_db > EXCELLENT_SNR_DB {
                QualityTier::Excellent
            } else if snr_db > GOOD_SNR_DB {
                QualityTier::Good
            } else {
                QualityTier::Fair
            }
        } else if avg_echo_energy > self.echo_threshold / 2.0 {
            QualityTier::Poor
        } else {
            QualityTier::VeryPoor
        };

        (detected, quality)
    }

    /// Estimated sample index of a chirp start relative to `origin_ms`
    pub fn chirp_start_index(&self, event: &ChirpEvent, origin_ms: u64) -> usize {
        let offset_ms = event.timestamp_ms.saturating_sub(origin_ms);
        (offset_ms * self.sample_rate as u64 / 1000) as usize
    }

    fn analyze_chirp(
        &self,
        samples: &[i16],
        event: &ChirpEvent,
        origin_ms: u64,
    ) -> Option<ChirpAnalysis> {
        let start = self.chirp_start_index(event, origin_ms);
        let chirp_end = start + self.chirp_len;
        if chirp_end >= samples.len() {
            return None;
        }

        let echo_start = chirp_end + self.echo_start_offset;
        let echo_end = samples.len().min(chirp_end + self.echo_end_offset);
        let noise_start = start.saturating_sub(NOISE_WINDOW_SAMPLES);
        let noise_end = start;

        if echo_end <= echo_start || noise_end <= noise_start {
            return None;
        }

        let echo_window = &samples[echo_start..echo_end];
        let echo_energy = mean_energy(echo_window);
        let noise_energy = mean_energy(&samples[noise_start..noise_end]);

        let peak_index = peak_position(echo_window).map(|i| echo_start + i);
        let delay_ms = peak_index
            .map(|peak| (peak - chirp_end) as f64 * 1000.0 / self.sample_rate as f64);

        tracing::debug!(
            chirp = event.index,
            start,
            echo_energy = %format!("{:.2}", echo_energy),
            noise_energy = %format!("{:.2}", noise_energy),
            delay_ms = ?delay_ms,
            "Chirp analyzed"
        );

        Some(ChirpAnalysis {
            index: event.index,
            start_sample: start,
            echo_energy,
            noise_energy,
            snr_db: snr_db(echo_energy, noise_energy),
            peak_index,
            delay_ms,
        })
    }
}

/// Analyze one run's capture with the thresholds of `config`
pub fn analyze(capture: CaptureRecord, chirps: &[ChirpEvent], config: &RunConfig) -> TestResult {
    EchoAnalyzer::new(config).analyze(capture, chirps)
}

/// Mean of squared sample values
fn mean_energy(window: &[i16]) -> f64 {
    if window.is_empty() {
        return 0.0;
    }
    let sum: f64 = window.iter().map(|&s| (s as f64) * (s as f64)).sum();
    sum / window.len() as f64
}

/// Position of the first maximum absolute value; `None` if all samples are zero
fn peak_position(window: &[i16]) -> Option<usize> {
    let mut peak = None;
    let mut peak_value = 0u16;
    for (i, s) in window.iter().enumerate() {
        let magnitude = s.unsigned_abs();
        if magnitude > peak_value {
            peak_value = magnitude;
            peak = Some(i);
        }
    }
    peak
}

fn snr_db(signal_energy: f64, noise_energy: f64) -> f64 {
    if noise_energy > 0.0 {
        10.0 * (signal_energy / noise_energy).log10()
    } else {
        0.0
    }
}
