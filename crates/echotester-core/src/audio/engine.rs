//! Echo test engine
//!
//! [`EchoTester`] owns an audio backend and a single worker thread. Every
//! accepted [`start`](EchoTester::start) becomes one job on that worker,
//! which opens the devices, runs the duplex loop, analyzes the capture and
//! fires exactly one terminal callback.
//!
//! ## Threading
//!
//! - `start`/`stop`/`release` take `&self` and may be called from any thread
//! - at most one run is active; a second `start` returns [`EngineError::Busy`]
//! - callbacks run on the worker thread
//! - the running flag is cleared before the terminal callback, so a new run
//!   may be started from inside `on_complete`/`on_error`

use super::callback::EchoTestCallback;
use super::chirp::ChirpTemplate;
use super::device::{AudioBackend, DeviceError};
use super::duplex::{run_duplex, CancellationToken};
use super::recorder::SessionRecorder;
use crate::config::{ConfigError, RunConfig};
use crossbeam_channel::{Receiver, Sender};
use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::JoinHandle;
use thiserror::Error;

/// Errors returned synchronously by the engine API
///
/// Failures during a run are reported through
/// [`EchoTestCallback::on_error`] instead.
#[derive(Error, Debug)]
pub enum EngineError {
    #[error("An echo test is already running")]
    Busy,

    #[error("Echo tester has been released")]
    Released,

    #[error("Invalid configuration: {0}")]
    InvalidConfig(#[from] ConfigError),

    #[error("Audio device error: {0}")]
    Device(#[from] DeviceError),

    #[error("Failed to spawn worker thread: {0}")]
    Worker(#[source] std::io::Error),

    #[error("Echo test run panicked: {0}")]
    Panicked(String),
}

/// One accepted run waiting for the worker
struct Job {
    config: RunConfig,
    callback: Box<dyn EchoTestCallback>,
    recorder: Option<Box<dyn SessionRecorder>>,
    cancel: CancellationToken,
}

/// State shared between the API and the worker
#[derive(Default)]
struct Shared {
    running: AtomicBool,
    released: AtomicBool,
    cancel: Mutex<Option<CancellationToken>>,
}

impl Shared {
    /// Claim the single run slot and install its cancellation token
    ///
    /// The token is published under the same lock `stop` takes, so a stop
    /// issued as soon as `start` returns always reaches the run.
    fn begin_run(&self) -> Option<CancellationToken> {
        let mut slot = lock(&self.cancel);
        self.running
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()?;
        let token = CancellationToken::new();
        *slot = Some(token.clone());
        Some(token)
    }

    /// Mark the active run finished
    fn finish_run(&self) {
        let mut slot = lock(&self.cancel);
        *slot = None;
        self.running.store(false, Ordering::Release);
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

/// Worker body: run jobs until the sender is dropped
fn worker_loop(mut backend: Box<dyn AudioBackend>, jobs: Receiver<Job>, shared: Arc<Shared>) {
    let mut cached: Option<ChirpTemplate> = None;

    for job in jobs.iter() {
        let Job {
            config,
            callback,
            recorder,
            cancel,
        } = job;

        let template = match &cached {
            Some(t) if t.matches(&config) => t.clone(),
            _ => {
                let t = ChirpTemplate::from_config(&config);
                tracing::debug!(
                    samples = t.len(),
                    min_freq = t.min_freq(),
                    max_freq = t.max_freq(),
                    "Chirp template generated"
                );
                cached = Some(t.clone());
                t
            }
        };

        let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
            run_duplex(
                backend.as_mut(),
                &config,
                &template,
                &cancel,
                callback.as_ref(),
                recorder,
            )
        }));

        let outcome = match outcome {
            Ok(Ok(report)) => Ok(report),
            Ok(Err(e)) => {
                tracing::error!("Echo test run failed: {}", e);
                Err(EngineError::Device(e).to_string())
            }
            Err(payload) => {
                let e = EngineError::Panicked(panic_message(payload.as_ref()));
                tracing::error!("{}", e);
                Err(e.to_string())
            }
        };

        shared.finish_run();

        let delivered = panic::catch_unwind(AssertUnwindSafe(|| match outcome {
            Ok(report) => {
                tracing::info!(
                    echo_detected = report.result.echo_detected,
                    quality = %report.result.quality,
                    snr_db = report.result.snr_db,
                    echo_count = report.result.echo_count,
                    "Echo test complete"
                );
                callback.on_complete(report.result);
            }
            Err(message) => callback.on_error(message),
        }));
        if delivered.is_err() {
            tracing::error!("Terminal callback panicked");
        }
    }

    tracing::debug!("Echo test worker exiting");
}

/// Speaker/microphone echo self-test engine
///
/// # Example
/// ```no_run
/// use echotester_core::audio::simulated::SimulatedBackend;
/// use echotester_core::{ChannelCallback, EchoTester, RunConfig, TestEvent};
///
/// let tester = EchoTester::new(SimulatedBackend::default()).unwrap();
/// let (callback, events) = ChannelCallback::new();
/// tester.start(RunConfig::default(), callback).unwrap();
/// for event in events.iter() {
///     if let TestEvent::Complete(result) = event {
///         println!("{}", result);
///         break;
///     }
/// }
/// ```
pub struct EchoTester {
    shared: Arc<Shared>,
    jobs: Mutex<Option<Sender<Job>>>,
    worker: Mutex<Option<JoinHandle<()>>>,
    backend_name: String,
}

impl EchoTester {
    /// Create an engine and spawn its worker
    ///
    /// No device is opened until a run starts.
    pub fn new(backend: impl AudioBackend) -> Result<Self, EngineError> {
        let backend_name = backend.name().to_string();
        let shared = Arc::new(Shared::default());
        let (tx, rx) = crossbeam_channel::unbounded::<Job>();

        let worker_shared = Arc::clone(&shared);
        let backend: Box<dyn AudioBackend> = Box::new(backend);
        let worker = std::thread::Builder::new()
            .name("echo-test-worker".into())
            .spawn(move || worker_loop(backend, rx, worker_shared))
            .map_err(EngineError::Worker)?;

        tracing::info!(backend = %backend_name, "Echo tester created");

        Ok(Self {
            shared,
            jobs: Mutex::new(Some(tx)),
            worker: Mutex::new(Some(worker)),
            backend_name,
        })
    }

    /// Name of the audio backend
    pub fn backend_name(&self) -> &str {
        &self.backend_name
    }

    /// Whether a run is active
    pub fn is_running(&self) -> bool {
        self.shared.running.load(Ordering::Acquire)
    }

    /// Start a run
    ///
    /// Returns immediately. On `Ok`, exactly one of `on_complete` and
    /// `on_error` will be called. On `Err` no callback is called.
    pub fn start(
        &self,
        config: RunConfig,
        callback: impl EchoTestCallback + 'static,
    ) -> Result<(), EngineError> {
        self.submit(config, Box::new(callback), None)
    }

    /// Start a run whose artifacts are handed to `recorder`
    pub fn start_recorded(
        &self,
        config: RunConfig,
        callback: impl EchoTestCallback + 'static,
        recorder: impl SessionRecorder + 'static,
    ) -> Result<(), EngineError> {
        self.submit(config, Box::new(callback), Some(Box::new(recorder)))
    }

    fn submit(
        &self,
        config: RunConfig,
        callback: Box<dyn EchoTestCallback>,
        recorder: Option<Box<dyn SessionRecorder>>,
    ) -> Result<(), EngineError> {
        if self.shared.released.load(Ordering::Acquire) {
            return Err(EngineError::Released);
        }
        config.validate()?;

        let cancel = self.shared.begin_run().ok_or(EngineError::Busy)?;

        let job = Job {
            config,
            callback,
            recorder,
            cancel,
        };
        let sent = match lock(&self.jobs).as_ref() {
            Some(tx) => tx.send(job).is_ok(),
            None => false,
        };
        if !sent {
            self.shared.finish_run();
            return Err(EngineError::Released);
        }

        tracing::debug!("Echo test run queued");
        Ok(())
    }

    /// Request cooperative cancellation of the active run, if any
    ///
    /// The run still completes through `on_complete` with whatever was
    /// captured.
    pub fn stop(&self) {
        if let Some(token) = lock(&self.shared.cancel).as_ref() {
            tracing::info!("Stop requested");
            token.cancel();
        }
    }

    /// Stop any run, close the devices and terminate the worker
    ///
    /// Idempotent. Blocks until the worker has exited unless called from a
    /// callback on the worker itself.
    pub fn release(&self) {
        if self.shared.released.swap(true, Ordering::AcqRel) {
            return;
        }
        self.stop();
        drop(lock(&self.jobs).take());

        if let Some(handle) = lock(&self.worker).take() {
            if handle.thread().id() == std::thread::current().id() {
                tracing::debug!("Released from worker thread, not joining");
            } else if handle.join().is_err() {
                tracing::error!("Echo test worker panicked");
            }
        }

        tracing::info!("Echo tester released");
    }
}

impl Drop for EchoTester {
    fn drop(&mut self) {
        self.release();
    }
}
