//! Per-run state
//!
//! A [`TestSession`] owns everything one run accumulates: the chirp emission
//! log and the captured chunks. It is created when the run starts, filled by
//! the duplex loop, and consumed by value when the run ends, so nothing is
//! shared between runs.

use crate::config::RunConfig;
use serde::Serialize;
use std::time::Instant;

/// One emitted chirp
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ChirpEvent {
    /// Emission order, starting at 0
    pub index: usize,
    /// Milliseconds since run start on the monotonic clock
    pub timestamp_ms: u64,
}

/// Captured samples in arrival order
#[derive(Debug, Clone, Default)]
pub struct CaptureRecord {
    chunks: Vec<Vec<i16>>,
    total: usize,
}

impl CaptureRecord {
    /// Create an empty record
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a record from a single contiguous buffer
    pub fn from_samples(samples: Vec<i16>) -> Self {
        let mut record = Self::new();
        record.push_chunk(samples);
        record
    }

    /// Append a chunk; empty chunks are ignored
    pub fn push_chunk(&mut self, chunk: Vec<i16>) {
        if chunk.is_empty() {
            return;
        }
        self.total += chunk.len();
        self.chunks.push(chunk);
    }

    /// Chunks in arrival order
    pub fn chunks(&self) -> &[Vec<i16>] {
        &self.chunks
    }

    /// Total number of samples across all chunks
    pub fn total_samples(&self) -> usize {
        self.total
    }

    /// Whether nothing was captured
    pub fn is_empty(&self) -> bool {
        self.total == 0
    }

    /// Concatenate all chunks into one contiguous sequence
    pub fn into_contiguous(self) -> Vec<i16> {
        if self.chunks.len() == 1 {
            return self.chunks.into_iter().next().unwrap_or_default();
        }
        let mut samples = Vec::with_capacity(self.total);
        for chunk in self.chunks {
            samples.extend_from_slice(&chunk);
        }
        samples
    }
}

/// State of the single active run
#[derive(Debug)]
pub struct TestSession {
    config: RunConfig,
    started_at: Instant,
    next_chirp_ms: u64,
    chirps: Vec<ChirpEvent>,
    capture: CaptureRecord,
}

impl TestSession {
    /// Start a session now; the first chirp is due immediately
    pub fn new(config: RunConfig) -> Self {
        Self::starting_at(config, Instant::now())
    }

    /// Start a session with an explicit origin
    pub fn starting_at(config: RunConfig, started_at: Instant) -> Self {
        Self {
            config,
            started_at,
            next_chirp_ms: 0,
            chirps: Vec::new(),
            capture: CaptureRecord::new(),
        }
    }

    /// Configuration of this run
    pub fn config(&self) -> &RunConfig {
        &self.config
    }

    /// Milliseconds since the session started
    pub fn elapsed_ms(&self) -> u64 {
        self.started_at.elapsed().as_millis() as u64
    }

    /// Whether the configured run duration has elapsed at `now_ms`
    pub fn is_finished(&self, now_ms: u64) -> bool {
        now_ms >= self.config.run_duration_ms as u64
    }

    /// Progress at `now_ms` as a percentage clamped to 0..=100
    pub fn progress_percent(&self, now_ms: u64) -> u8 {
        let duration = self.config.run_duration_ms.max(1) as u64;
        (now_ms.saturating_mul(100) / duration).min(100) as u8
    }

    /// Whether the next chirp is due at `now_ms`
    pub fn chirp_due(&self, now_ms: u64) -> bool {
        now_ms >= self.next_chirp_ms
    }

    /// Log a chirp emitted at `now_ms` and schedule the next one
    ///
    /// Emission times are strictly increasing: a chirp is never due before
    /// the previous one plus the gap.
    pub fn record_chirp(&mut self, now_ms: u64) -> ChirpEvent {
        let event = ChirpEvent {
            index: self.chirps.len(),
            timestamp_ms: now_ms,
        };
        self.chirps.push(event);
        self.schedule_next_chirp(now_ms);
        event
    }

    /// Schedule the next chirp one gap after `now_ms` without logging an emission
    pub fn schedule_next_chirp(&mut self, now_ms: u64) {
        self.next_chirp_ms = now_ms + self.config.chirp_gap_ms.max(1) as u64;
    }

    /// Append a captured chunk
    pub fn append_chunk(&mut self, chunk: Vec<i16>) {
        self.capture.push_chunk(chunk);
    }

    /// Chirps emitted so far
    pub fn chirps(&self) -> &[ChirpEvent] {
        &self.chirps
    }

    /// Samples captured so far
    pub fn captured_samples(&self) -> usize {
        self.capture.total_samples()
    }

    /// Hand the accumulators over to analysis
    pub fn into_parts(self) -> (RunConfig, CaptureRecord, Vec<ChirpEvent>) {
        (self.config, self.capture, self.chirps)
    }
}
