//! Run configuration
//!
//! All parameters of one echo test run. Stored as JSON so a test setup can be
//! saved and replayed; missing fields fall back to the defaults below.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Echo window starts this long after the chirp ends
pub const ECHO_WINDOW_START_MS: u32 = 5;

/// Echo window ends this long after the chirp ends
pub const ECHO_WINDOW_END_MS: u32 = 50;

/// Number of samples preceding a chirp used as the noise baseline
pub const NOISE_WINDOW_SAMPLES: usize = 1000;

/// Longest chirp a run may emit
pub const MAX_CHIRP_DURATION_MS: u32 = 1000;

/// Largest capture read, in seconds of audio
pub const MAX_CHUNK_SECONDS: usize = 1;

/// Errors raised while validating, loading or saving a [`RunConfig`]
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Sample rate {0} Hz out of range (8000-384000)")]
    SampleRate(u32),

    #[error("Invalid chirp band {min}-{max} Hz (must satisfy 0 < min < max <= {nyquist})")]
    ChirpBand { min: u32, max: u32, nyquist: u32 },

    #[error("{0} must be greater than zero")]
    Zero(&'static str),

    #[error("{field} {value} exceeds the maximum of {max}")]
    TooLarge {
        field: &'static str,
        value: u64,
        max: u64,
    },

    #[error("Chirp gap {gap_ms}ms must exceed chirp duration plus echo window ({required_ms}ms)")]
    GapTooShort { gap_ms: u32, required_ms: u32 },

    #[error("Threshold {0} must be finite and non-negative")]
    Threshold(&'static str),

    #[error("Config I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Config parse error: {0}")]
    Parse(#[from] serde_json::Error),
}

/// How chirp timestamps are mapped onto capture sample indices
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChirpAlignment {
    /// Timestamps are measured from the first captured sample (run start)
    #[default]
    CaptureStart,
    /// Timestamps are measured from the first emitted chirp
    FirstChirp,
}

/// Configuration for a single echo test run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RunConfig {
    /// Sample rate in Hz, shared by capture and playback
    pub sample_rate: u32,
    /// Chirp start frequency in Hz
    pub chirp_min_freq: u32,
    /// Chirp end frequency in Hz
    pub chirp_max_freq: u32,
    /// Chirp length in milliseconds
    pub chirp_duration_ms: u32,
    /// Time between chirp emissions in milliseconds
    pub chirp_gap_ms: u32,
    /// Samples requested per capture read
    pub chunk_size: usize,
    /// Total run length in milliseconds
    pub run_duration_ms: u32,
    /// Minimum mean echo-window energy for a detection
    pub echo_threshold: f64,
    /// Minimum SNR (dB) for a detection
    pub snr_threshold: f64,
    /// Timestamp to sample index mapping
    pub alignment: ChirpAlignment,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            sample_rate: crate::DEFAULT_SAMPLE_RATE,
            chirp_min_freq: 18000,
            chirp_max_freq: 22000,
            chirp_duration_ms: 20,
            chirp_gap_ms: 500,
            chunk_size: (crate::DEFAULT_SAMPLE_RATE / 10) as usize, // 100ms
            run_duration_ms: 5000,
            echo_threshold: 40.0,
            snr_threshold: 0.5,
            alignment: ChirpAlignment::CaptureStart,
        }
    }
}

impl RunConfig {
    /// Number of samples in the chirp template
    pub fn chirp_samples(&self) -> usize {
        (self.sample_rate as f64 * self.chirp_duration_ms as f64 / 1000.0).round() as usize
    }

    /// Convert a duration in milliseconds to a sample count at this rate
    pub fn ms_to_samples(&self, ms: u32) -> usize {
        (ms as u64 * self.sample_rate as u64 / 1000) as usize
    }

    /// Check that the configuration describes a runnable test
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(8000..=384000).contains(&self.sample_rate) {
            return Err(ConfigError::SampleRate(self.sample_rate));
        }

        let nyquist = self.sample_rate / 2;
        if self.chirp_min_freq == 0
            || self.chirp_min_freq >= self.chirp_max_freq
            || self.chirp_max_freq > nyquist
        {
            return Err(ConfigError::ChirpBand {
                min: self.chirp_min_freq,
                max: self.chirp_max_freq,
                nyquist,
            });
        }

        if self.chirp_duration_ms == 0 {
            return Err(ConfigError::Zero("chirp_duration_ms"));
        }
        if self.chunk_size == 0 {
            return Err(ConfigError::Zero("chunk_size"));
        }
        if self.run_duration_ms == 0 {
            return Err(ConfigError::Zero("run_duration_ms"));
        }
        if self.chirp_duration_ms > MAX_CHIRP_DURATION_MS {
            return Err(ConfigError::TooLarge {
                field: "chirp_duration_ms",
                value: self.chirp_duration_ms as u64,
                max: MAX_CHIRP_DURATION_MS as u64,
            });
        }
        let max_chunk = self.sample_rate as usize * MAX_CHUNK_SECONDS;
        if self.chunk_size > max_chunk {
            return Err(ConfigError::TooLarge {
                field: "chunk_size",
                value: self.chunk_size as u64,
                max: max_chunk as u64,
            });
        }

        // Successive echo windows must not overlap
        let required_ms = self
            .chirp_duration_ms
            .checked_add(ECHO_WINDOW_END_MS)
            .unwrap_or(u32::MAX);
        if self.chirp_gap_ms <= required_ms {
            return Err(ConfigError::GapTooShort {
                gap_ms: self.chirp_gap_ms,
                required_ms,
            });
        }

        if !self.echo_threshold.is_finite() || self.echo_threshold < 0.0 {
            return Err(ConfigError::Threshold("echo_threshold"));
        }
        if !self.snr_threshold.is_finite() || self.snr_threshold < 0.0 {
            return Err(ConfigError::Threshold("snr_threshold"));
        }

        Ok(())
    }

    /// Load a config from a JSON file
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let config: Self = serde_json::from_str(&contents)?;
        tracing::info!(path = %path.display(), "Loaded run config");
        Ok(config)
    }

    /// Save config to disk, creating parent directories if needed
    pub fn save(&self, path: &Path) -> Result<(), ConfigError> {
        let io_err = |source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        };
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(io_err)?;
        }
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(path, json).map_err(io_err)?;
        tracing::info!(path = %path.display(), "Run config saved");
        Ok(())
    }
}
