//! Echotester - speaker/microphone ultrasonic echo self-test
//!
//! This library re-exports the chirp synthesizer, duplex run loop, echo
//! analyzer and statistics from `echotester-core`.

pub use echotester_core::audio;
pub use echotester_core::config;
pub use echotester_core::stats;

pub use echotester_core::{
    AnalysisReport, CaptureRecord, ChannelCallback, ChirpAlignment, ChirpAnalysis, ChirpEvent,
    ChirpTemplate, ConfigError, EchoAnalyzer, EchoTestCallback, EchoTester, EngineError,
    QualityTier, RunConfig, SignalStats, TestEvent, TestResult, TestSession,
};
pub use echotester_core::{BUILD_DATE, DEFAULT_SAMPLE_RATE, VERSION};
