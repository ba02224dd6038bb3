//! Session persistence
//!
//! A [`SessionRecorder`] is handed everything a run produces so it can be
//! inspected offline. Recording is best effort: the duplex loop logs a failed
//! call, drops the recorder for the rest of the run, and carries on.
//!
//! ## Directory layout
//!
//! [`DirectoryRecorder`] creates `session_YYYYMMDD_HHMMSS/` under its root:
//!
//! | file | content |
//! |------|---------|
//! | `raw_recording.pcm` | captured samples, i16 little-endian |
//! | `recording.wav` | captured samples, mono 16-bit WAV |
//! | `chirp_template.raw` | transmitted chirp, i16 little-endian |
//! | `session_metadata.json` | run config, start time, chirp info |
//! | `chirp_timing.csv` | `chirp_index,timestamp_ms` |
//! | `analysis_results.json` | final [`TestResult`](crate::TestResult) |
//! | `detailed_analysis.csv` | per-chirp energies, SNR and delay |

use super::analyzer::AnalysisReport;
use super::chirp::ChirpTemplate;
use super::session::ChirpEvent;
use crate::config::RunConfig;
use chrono::{DateTime, Local};
use serde::Serialize;
use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use thiserror::Error;

type WavWriter = hound::WavWriter<BufWriter<File>>;

/// Errors raised while persisting a session
#[derive(Error, Debug)]
pub enum RecorderError {
    #[error("Recorder I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("WAV write error: {0}")]
    Wav(#[from] hound::Error),

    #[error("JSON write error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Recorder used before begin()")]
    NotStarted,
}

/// Sink for the artifacts of one run
pub trait SessionRecorder: Send {
    /// Run is starting with this configuration and chirp
    fn begin(&mut self, config: &RunConfig, template: &ChirpTemplate) -> Result<(), RecorderError>;

    /// A chirp was emitted
    fn record_chirp(&mut self, event: &ChirpEvent) -> Result<(), RecorderError>;

    /// A chunk was captured
    fn record_chunk(&mut self, samples: &[i16]) -> Result<(), RecorderError>;

    /// Run was analyzed; flush and close everything
    fn finish(&mut self, report: &AnalysisReport) -> Result<(), RecorderError>;
}

#[derive(Serialize)]
struct SessionMetadata<'a> {
    started_at: DateTime<Local>,
    engine_version: &'static str,
    chirp_samples: usize,
    chirp_peak: u16,
    config: &'a RunConfig,
}

/// Open writers for the session in progress
struct OpenSession {
    dir: PathBuf,
    pcm: BufWriter<File>,
    wav: WavWriter,
    timing: BufWriter<File>,
    samples_written: u64,
}

/// Shared view of the session directory a [`DirectoryRecorder`] writes to
///
/// The recorder itself is moved into the engine, so callers keep a handle to
/// find the timestamped directory once the run has begun.
#[derive(Debug, Clone, Default)]
pub struct SessionDirHandle(Arc<Mutex<Option<PathBuf>>>);

impl SessionDirHandle {
    /// Directory of the current or most recent session, if any began
    pub fn get(&self) -> Option<PathBuf> {
        self.0
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    fn set(&self, dir: PathBuf) {
        *self.0.lock().unwrap_or_else(|poisoned| poisoned.into_inner()) = Some(dir);
    }
}

/// Recorder writing each run into its own timestamped directory
pub struct DirectoryRecorder {
    root: PathBuf,
    session: Option<OpenSession>,
    dir_handle: SessionDirHandle,
}

impl DirectoryRecorder {
    /// Create a recorder writing sessions below `root`
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            session: None,
            dir_handle: SessionDirHandle::default(),
        }
    }

    /// Directory of the current or most recent session
    pub fn session_dir(&self) -> Option<PathBuf> {
        self.dir_handle.get()
    }

    /// Handle that keeps reporting the session directory after the recorder
    /// has been handed to the engine
    pub fn dir_handle(&self) -> SessionDirHandle {
        self.dir_handle.clone()
    }

    /// Create a fresh session directory, suffixing it if the second is taken
    fn create_session_dir(&self) -> Result<PathBuf, RecorderError> {
        fs::create_dir_all(&self.root)?;
        let stamp = Local::now().format("%Y%m%d_%H%M%S").to_string();
        let mut attempt = 0u32;
        loop {
            let name = if attempt == 0 {
                format!("session_{}", stamp)
            } else {
                format!("session_{}_{}", stamp, attempt)
            };
            let dir = self.root.join(name);
            match fs::create_dir(&dir) {
                Ok(()) => return Ok(dir),
                Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => attempt += 1,
                Err(e) => return Err(e.into()),
            }
        }
    }
}

fn write_samples_le(writer: &mut impl Write, samples: &[i16]) -> std::io::Result<()> {
    for s in samples {
        writer.write_all(&s.to_le_bytes())?;
    }
    Ok(())
}

impl SessionRecorder for DirectoryRecorder {
    fn begin(&mut self, config: &RunConfig, template: &ChirpTemplate) -> Result<(), RecorderError> {
        let dir = self.create_session_dir()?;

        let mut chirp_file = BufWriter::new(File::create(dir.join("chirp_template.raw"))?);
        write_samples_le(&mut chirp_file, template.samples())?;
        chirp_file.flush()?;

        let metadata = SessionMetadata {
            started_at: Local::now(),
            engine_version: crate::VERSION,
            chirp_samples: template.len(),
            chirp_peak: template.peak(),
            config,
        };
        fs::write(
            dir.join("session_metadata.json"),
            serde_json::to_string_pretty(&metadata)?,
        )?;

        let pcm = BufWriter::with_capacity(8192, File::create(dir.join("raw_recording.pcm"))?);

        let spec = hound::WavSpec {
            channels: 1,
            sample_rate: config.sample_rate,
            bits_per_sample: 16,
            sample_format: hound::SampleFormat::Int,
        };
        let wav = hound::WavWriter::create(dir.join("recording.wav"), spec)?;

        let mut timing = BufWriter::new(File::create(dir.join("chirp_timing.csv"))?);
        writeln!(timing, "chirp_index,timestamp_ms")?;

        tracing::info!(dir = %dir.display(), "Session recording started");
        self.dir_handle.set(dir.clone());

        self.session = Some(OpenSession {
            dir,
            pcm,
            wav,
            timing,
            samples_written: 0,
        });
        Ok(())
    }

    fn record_chirp(&mut self, event: &ChirpEvent) -> Result<(), RecorderError> {
        let session = self.session.as_mut().ok_or(RecorderError::NotStarted)?;
        writeln!(session.timing, "{},{}", event.index, event.timestamp_ms)?;
        Ok(())
    }

    fn record_chunk(&mut self, samples: &[i16]) -> Result<(), RecorderError> {
        let session = self.session.as_mut().ok_or(RecorderError::NotStarted)?;
        write_samples_le(&mut session.pcm, samples)?;
        for &s in samples {
            session.wav.write_sample(s)?;
        }
        session.samples_written += samples.len() as u64;
        Ok(())
    }

    fn finish(&mut self, report: &AnalysisReport) -> Result<(), RecorderError> {
        let mut session = self.session.take().ok_or(RecorderError::NotStarted)?;

        session.pcm.flush()?;
        session.timing.flush()?;
        session.wav.finalize()?;

        fs::write(
            session.dir.join("analysis_results.json"),
            serde_json::to_string_pretty(&report.result)?,
        )?;

        let mut detail = BufWriter::new(File::create(session.dir.join("detailed_analysis.csv"))?);
        writeln!(
            detail,
            "chirp_index,start_sample,echo_energy,noise_energy,snr_db,peak_index,delay_ms"
        )?;
        for chirp in &report.chirps {
            writeln!(
                detail,
                "{},{},{:.4},{:.4},{:.4},{},{}",
                chirp.index,
                chirp.start_sample,
                chirp.echo_energy,
                chirp.noise_energy,
                chirp.snr_db,
                chirp.peak_index.map(|p| p.to_string()).unwrap_or_default(),
                chirp
                    .delay_ms
                    .map(|d| format!("{:.4}", d))
                    .unwrap_or_default(),
            )?;
        }
        detail.flush()?;

        tracing::info!(
            dir = %session.dir.display(),
            samples = session.samples_written,
            chirps = report.chirps.len(),
            "Session recording finished"
        );
        Ok(())
    }
}
