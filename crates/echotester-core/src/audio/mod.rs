//! Audio processing module
//!
//! This module contains all audio-related functionality including:
//! - Linear-FM chirp synthesis ([`chirp`])
//! - Capture/playback device abstractions ([`device`])
//! - cpal hardware backend ([`cpal_backend`], feature `cpal-backend`)
//! - Simulated room backend for tests and demos ([`simulated`])
//! - Per-run state owned by the active test ([`session`])
//! - The interleaved transmit/receive loop ([`duplex`])
//! - Worker thread and public start/stop/release API ([`engine`])
//! - Echo/noise window analysis and quality classification ([`analyzer`])
//! - Optional session persistence ([`recorder`])

pub mod analyzer;
pub mod callback;
pub mod chirp;
#[cfg(feature = "cpal-backend")]
pub mod cpal_backend;
pub mod device;
pub mod duplex;
pub mod engine;
pub mod recorder;
pub mod session;
pub mod simulated;
