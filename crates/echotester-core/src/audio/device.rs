//! Capture and playback device abstractions
//!
//! The duplex loop talks to audio hardware only through these traits. A
//! backend opens one capture and one playback device per run; the devices
//! live on the worker thread for the duration of the run and are dropped
//! when it ends, so they do not need to be `Send`.

use thiserror::Error;

/// Errors raised by audio devices and backends
#[derive(Error, Debug)]
pub enum DeviceError {
    #[error("No {0} device available")]
    NoDevice(&'static str),

    #[error("Device not found: {0}")]
    DeviceNotFound(String),

    #[error("Unsupported stream format: {0}")]
    UnsupportedFormat(String),

    #[error("Failed to open stream: {0}")]
    Open(String),

    #[error("Failed to start stream: {0}")]
    Start(String),

    #[error("Capture read failed: {0}")]
    Read(String),

    #[error("Playback write failed: {0}")]
    Write(String),

    #[error("Failed to stop stream: {0}")]
    Stop(String),
}

/// Stream format requested by the engine (always mono, signed 16-bit)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamFormat {
    /// Sample rate in Hz
    pub sample_rate: u32,
    /// Samples per capture read
    pub chunk_size: usize,
}

/// Source of captured microphone samples
pub trait CaptureDevice {
    /// Begin capturing
    fn start(&mut self) -> Result<(), DeviceError>;

    /// Read up to `buffer.len()` samples, blocking for at most about one chunk
    ///
    /// Returns the number of samples written to the front of `buffer`.
    fn read(&mut self, buffer: &mut [i16]) -> Result<usize, DeviceError>;

    /// Stop capturing
    fn stop(&mut self) -> Result<(), DeviceError>;
}

/// Sink for speaker samples
pub trait PlaybackDevice {
    /// Begin playback
    fn start(&mut self) -> Result<(), DeviceError>;

    /// Queue samples, blocking until all of them are buffered
    fn write(&mut self, samples: &[i16]) -> Result<(), DeviceError>;

    /// Stop playback
    fn stop(&mut self) -> Result<(), DeviceError>;
}

/// Opens the device pair for a run
///
/// The backend is moved onto the engine worker thread, hence `Send`.
pub trait AudioBackend: Send + 'static {
    /// Short backend name for logs
    fn name(&self) -> &str;

    /// Open the microphone
    fn open_capture(&mut self, format: StreamFormat) -> Result<Box<dyn CaptureDevice>, DeviceError>;

    /// Open the speaker
    fn open_playback(
        &mut self,
        format: StreamFormat,
    ) -> Result<Box<dyn PlaybackDevice>, DeviceError>;
}
