//! Echotester Core - Chirp synthesis, duplex audio loop, and echo analysis
//!
//! This library verifies that a speaker/microphone pair can emit a short
//! ultrasonic chirp and pick up its reflection. A test run interleaves chirp
//! playback with continuous capture on a single worker, then reduces the
//! capture to a [`TestResult`] using windowed energy comparison.

pub mod audio;
pub mod config;
pub mod stats;

pub use audio::analyzer::{AnalysisReport, ChirpAnalysis, EchoAnalyzer, QualityTier, TestResult};
pub use audio::callback::{ChannelCallback, EchoTestCallback, TestEvent};
pub use audio::chirp::ChirpTemplate;
pub use audio::engine::{EchoTester, EngineError};
pub use audio::session::{CaptureRecord, ChirpEvent, TestSession};
pub use config::{ChirpAlignment, ConfigError, RunConfig};
pub use stats::SignalStats;

/// Application version from Cargo.toml
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Date the core library was built (YYYY-MM-DD)
pub const BUILD_DATE: &str = env!("BUILD_DATE");

/// Default sample rate for capture and playback (48kHz covers the 18-22kHz band)
pub const DEFAULT_SAMPLE_RATE: u32 = 48000;
