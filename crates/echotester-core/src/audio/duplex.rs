//! Duplex run loop
//!
//! One run interleaves chirp emission and capture on a single thread:
//!
//! 1. check the cancellation token, report progress, exit once the run
//!    duration has elapsed
//! 2. emit the chirp if it is due (the first one immediately)
//! 3. read one chunk from the microphone
//! 4. sleep [`LOOP_YIELD`]
//!
//! Worst-case stop latency is therefore one capture read plus one yield.
//! Mid-run read/write failures are logged and skipped; only failing to open
//! or start the devices aborts the run.

use super::analyzer::{AnalysisReport, EchoAnalyzer};
use super::callback::EchoTestCallback;
use super::chirp::ChirpTemplate;
use super::device::{AudioBackend, CaptureDevice, DeviceError, PlaybackDevice, StreamFormat};
use super::recorder::SessionRecorder;
use super::session::TestSession;
use crate::config::RunConfig;
use crate::stats::SignalStats;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Delay at the end of every loop iteration
pub const LOOP_YIELD: Duration = Duration::from_millis(10);

/// Cooperative stop flag for one run
///
/// Cloning shares the flag. The loop polls it at the top of every iteration.
#[derive(Debug, Clone, Default)]
pub struct CancellationToken(Arc<AtomicBool>);

impl CancellationToken {
    /// Create a token that is not cancelled
    pub fn new() -> Self {
        Self::default()
    }

    /// Request the run to stop
    pub fn cancel(&self) {
        self.0.store(true, Ordering::Release);
    }

    /// Whether a stop was requested
    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}

/// Stop a device and log, rather than propagate, any failure
fn stop_quietly(name: &str, result: Result<(), DeviceError>) {
    if let Err(e) = result {
        tracing::warn!(device = name, "Failed to stop device: {}", e);
    }
}

/// Open and start both devices
fn open_devices(
    backend: &mut dyn AudioBackend,
    format: StreamFormat,
) -> Result<(Box<dyn CaptureDevice>, Box<dyn PlaybackDevice>), DeviceError> {
    let mut playback = backend.open_playback(format)?;
    let mut capture = backend.open_capture(format)?;

    capture.start()?;
    if let Err(e) = playback.start() {
        stop_quietly("capture", capture.stop());
        return Err(e);
    }
    Ok((capture, playback))
}

/// Execute one run and analyze what it captured
///
/// Returns an error only when the devices cannot be opened or started. A
/// cancelled run still yields a report over whatever was captured.
pub fn run_duplex(
    backend: &mut dyn AudioBackend,
    config: &RunConfig,
    template: &ChirpTemplate,
    cancel: &CancellationToken,
    callback: &dyn EchoTestCallback,
    mut recorder: Option<Box<dyn SessionRecorder>>,
) -> Result<AnalysisReport, DeviceError> {
    let format = StreamFormat {
        sample_rate: config.sample_rate,
        chunk_size: config.chunk_size,
    };
    let (mut capture, mut playback) = open_devices(backend, format)?;

    tracing::info!(
        backend = backend.name(),
        sample_rate = config.sample_rate,
        duration_ms = config.run_duration_ms,
        gap_ms = config.chirp_gap_ms,
        chirp_samples = template.len(),
        "Echo test run started"
    );

    // Timestamps are relative to capture start, so the clock starts here
    let mut session = TestSession::new(config.clone());

    if let Some(rec) = recorder.as_mut() {
        if let Err(e) = rec.begin(config, template) {
            tracing::warn!("Session recording disabled: {}", e);
            recorder = None;
        }
    }

    let mut buffer = vec![0i16; config.chunk_size];
    let mut cancelled = false;

    loop {
        if cancel.is_cancelled() {
            cancelled = true;
            break;
        }

        let now_ms = session.elapsed_ms();
        callback.on_progress(session.progress_percent(now_ms));
        if session.is_finished(now_ms) {
            break;
        }

        if session.chirp_due(now_ms) {
            match playback.write(template.samples()) {
                Ok(()) => {
                    let event = session.record_chirp(now_ms);
                    tracing::debug!(index = event.index, timestamp_ms = event.timestamp_ms, "Chirp emitted");
                    if let Some(rec) = recorder.as_mut() {
                        if let Err(e) = rec.record_chirp(&event) {
                            tracing::warn!("Session recording disabled: {}", e);
                            recorder = None;
                        }
                    }
                }
                Err(e) => {
                    tracing::warn!(timestamp_ms = now_ms, "Chirp write failed: {}", e);
                    session.schedule_next_chirp(now_ms);
                }
            }
        }

        match capture.read(&mut buffer) {
            Ok(0) => {}
            Ok(n) => {
                let chunk = buffer[..n].to_vec();
                if tracing::enabled!(tracing::Level::TRACE) {
                    let stats = SignalStats::from_samples(&chunk);
                    tracing::trace!(
                        samples = n,
                        min = stats.min,
                        max = stats.max,
                        rms = stats.rms(),
                        "Chunk captured"
                    );
                }
                if let Some(rec) = recorder.as_mut() {
                    if let Err(e) = rec.record_chunk(&chunk) {
                        tracing::warn!("Session recording disabled: {}", e);
                        recorder = None;
                    }
                }
                session.append_chunk(chunk);
            }
            Err(e) => tracing::warn!("Capture read failed: {}", e),
        }

        std::thread::sleep(LOOP_YIELD);
    }

    stop_quietly("playback", playback.stop());
    stop_quietly("capture", capture.stop());
    drop(playback);
    drop(capture);

    tracing::info!(
        cancelled,
        chirps = session.chirps().len(),
        samples = session.captured_samples(),
        "Echo test run finished"
    );

    let (config, record, chirps) = session.into_parts();
    let report = EchoAnalyzer::new(&config).analyze_detailed(record, &chirps);

    if let Some(mut rec) = recorder {
        if let Err(e) = rec.finish(&report) {
            tracing::warn!("Failed to finish session recording: {}", e);
        }
    }

    Ok(report)
}
