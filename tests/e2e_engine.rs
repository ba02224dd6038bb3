//! E2E tests for the echo test engine
//!
//! Runs the full start -> duplex loop -> analysis -> callback path against
//! the simulated room, plus the busy/stop/release contract.

use crossbeam_channel::Receiver;
use echotester::audio::device::{
    AudioBackend, CaptureDevice, DeviceError, PlaybackDevice, StreamFormat,
};
use echotester::audio::simulated::{RoomModel, SimulatedBackend};
use echotester::{
    ChannelCallback, EchoTestCallback, EchoTester, EngineError, QualityTier, RunConfig, TestEvent,
    TestResult,
};
use echotester::audio::analyzer::AnalysisReport;
use echotester::audio::recorder::{RecorderError, SessionRecorder};
use echotester::{ChirpEvent, ChirpTemplate};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

fn config(duration_ms: u32) -> RunConfig {
    RunConfig {
        run_duration_ms: duration_ms,
        ..RunConfig::default()
    }
}

/// Collect events until the terminal one; returns (progress, terminal)
fn drain(events: &Receiver<TestEvent>) -> (Vec<u8>, TestEvent) {
    let mut progress = Vec::new();
    loop {
        match events
            .recv_timeout(Duration::from_secs(15))
            .expect("run produced no terminal event")
        {
            TestEvent::Progress(p) => progress.push(p),
            terminal => return (progress, terminal),
        }
    }
}

/// Backend whose first `failures` opens fail, then behaves like the simulated room
struct FlakyBackend {
    failures: usize,
    inner: SimulatedBackend,
}

impl AudioBackend for FlakyBackend {
    fn name(&self) -> &str {
        "flaky"
    }

    fn open_capture(&mut self, format: StreamFormat) -> Result<Box<dyn CaptureDevice>, DeviceError> {
        if self.failures > 0 {
            self.failures -= 1;
            return Err(DeviceError::Open("microphone busy".into()));
        }
        self.inner.open_capture(format)
    }

    fn open_playback(
        &mut self,
        format: StreamFormat,
    ) -> Result<Box<dyn PlaybackDevice>, DeviceError> {
        self.inner.open_playback(format)
    }
}

/// Test a full run in a reflective room
#[test]
fn test_simulated_run_detects_echo() {
    let tester = EchoTester::new(SimulatedBackend::new(RoomModel::default())).unwrap();
    let (callback, events) = ChannelCallback::new();
    tester.start(config(1500), callback).unwrap();
    assert!(tester.is_running());

    let (progress, terminal) = drain(&events);
    let result = match terminal {
        TestEvent::Complete(result) => result,
        other => panic!("expected completion, got {:?}", other),
    };

    assert!(result.echo_detected, "{}", result);
    assert!(result.echo_count >= 1);
    assert!(matches!(
        result.quality,
        QualityTier::Fair | QualityTier::Good | QualityTier::Excellent
    ));
    assert!(!progress.is_empty());
    assert!(progress.windows(2).all(|w| w[0] <= w[1]));
    assert!(progress.iter().all(|&p| p <= 100));
    assert!(!tester.is_running());
}

/// Test that exactly one terminal event is delivered per run
#[test]
fn test_single_terminal_event() {
    let tester = EchoTester::new(SimulatedBackend::default()).unwrap();
    let (callback, events) = ChannelCallback::new();
    tester.start(config(300), callback).unwrap();

    let (_, terminal) = drain(&events);
    assert!(matches!(terminal, TestEvent::Complete(_)));

    std::thread::sleep(Duration::from_millis(200));
    assert!(events.try_iter().all(|e| !e.is_terminal()));
}

/// Test that stop() completes the run promptly, not with an error
#[test]
fn test_stop_mid_run_completes() {
    let tester = EchoTester::new(SimulatedBackend::default()).unwrap();
    let (callback, events) = ChannelCallback::new();
    tester.start(config(10_000), callback).unwrap();

    // Let at least one chirp go out
    std::thread::sleep(Duration::from_millis(300));
    let stopped_at = Instant::now();
    tester.stop();

    let (_, terminal) = drain(&events);
    let latency = stopped_at.elapsed();
    assert!(
        matches!(terminal, TestEvent::Complete(_)),
        "expected completion, got {:?}",
        terminal
    );
    // One 100ms capture read plus the 10ms yield, with scheduling slack
    assert!(latency < Duration::from_millis(600), "stop took {:?}", latency);
    assert!(!tester.is_running());
}

/// Test that a second start during a run is rejected
#[test]
fn test_second_start_is_busy() {
    let tester = EchoTester::new(SimulatedBackend::default()).unwrap();
    let (first, first_events) = ChannelCallback::new();
    let (second, second_events) = ChannelCallback::new();

    tester.start(config(1000), first).unwrap();
    assert!(matches!(
        tester.start(config(1000), second),
        Err(EngineError::Busy)
    ));

    let (_, terminal) = drain(&first_events);
    assert!(matches!(terminal, TestEvent::Complete(_)));
    assert!(second_events.try_recv().is_err());
}

/// Test concurrent start calls from several threads
#[test]
fn test_concurrent_starts_accept_one() {
    let tester = Arc::new(EchoTester::new(SimulatedBackend::default()).unwrap());
    let accepted = Arc::new(AtomicUsize::new(0));
    let receivers = Arc::new(Mutex::new(Vec::new()));

    let handles: Vec<_> = (0..4)
        .map(|_| {
            let tester = Arc::clone(&tester);
            let accepted = Arc::clone(&accepted);
            let receivers = Arc::clone(&receivers);
            std::thread::spawn(move || {
                let (callback, events) = ChannelCallback::new();
                if tester.start(config(5000), callback).is_ok() {
                    accepted.fetch_add(1, Ordering::SeqCst);
                    receivers.lock().unwrap().push(events);
                }
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }

    assert_eq!(accepted.load(Ordering::SeqCst), 1);
    tester.stop();
    let receivers = receivers.lock().unwrap();
    let (_, terminal) = drain(&receivers[0]);
    assert!(matches!(terminal, TestEvent::Complete(_)));
}

/// Test that a device failure is reported once and the engine stays usable
#[test]
fn test_device_failure_reports_error_then_recovers() {
    let backend = FlakyBackend {
        failures: 1,
        inner: SimulatedBackend::default(),
    };
    let tester = EchoTester::new(backend).unwrap();

    let (callback, events) = ChannelCallback::new();
    tester.start(config(300), callback).unwrap();
    let (progress, terminal) = drain(&events);
    match terminal {
        TestEvent::Error(message) => assert!(message.contains("microphone busy"), "{}", message),
        other => panic!("expected error, got {:?}", other),
    }
    assert!(progress.is_empty());
    assert!(!tester.is_running());

    let (callback, events) = ChannelCallback::new();
    tester.start(config(300), callback).unwrap();
    let (_, terminal) = drain(&events);
    assert!(matches!(terminal, TestEvent::Complete(_)));
}

/// Test release semantics
#[test]
fn test_release_stops_run_and_is_idempotent() {
    let tester = EchoTester::new(SimulatedBackend::default()).unwrap();
    let (callback, events) = ChannelCallback::new();
    tester.start(config(10_000), callback).unwrap();
    std::thread::sleep(Duration::from_millis(150));

    tester.release();
    assert!(!tester.is_running());
    let (_, terminal) = drain(&events);
    assert!(matches!(terminal, TestEvent::Complete(_)));

    tester.release();
    let (callback, _events) = ChannelCallback::new();
    assert!(matches!(
        tester.start(config(300), callback),
        Err(EngineError::Released)
    ));
}

/// Callback that starts a follow-up run from inside on_complete
struct Chained {
    tester: Arc<Mutex<Option<Arc<EchoTester>>>>,
    done: crossbeam_channel::Sender<Result<(), String>>,
    follow_up: crossbeam_channel::Sender<TestEvent>,
}

impl EchoTestCallback for Chained {
    fn on_progress(&self, _: u8) {}

    fn on_complete(&self, _: TestResult) {
        let tester = self.tester.lock().unwrap().clone();
        let outcome = match tester {
            Some(tester) => {
                let follow_up = ForwardTerminal(self.follow_up.clone());
                tester.start(config(200), follow_up).map_err(|e| e.to_string())
            }
            None => Err("tester missing".into()),
        };
        let _ = self.done.send(outcome);
    }

    fn on_error(&self, message: String) {
        let _ = self.done.send(Err(message));
    }
}

struct ForwardTerminal(crossbeam_channel::Sender<TestEvent>);

impl EchoTestCallback for ForwardTerminal {
    fn on_progress(&self, _: u8) {}

    fn on_complete(&self, result: TestResult) {
        let _ = self.0.send(TestEvent::Complete(result));
    }

    fn on_error(&self, message: String) {
        let _ = self.0.send(TestEvent::Error(message));
    }
}

/// Test that a new run can be started from the completion callback
#[test]
fn test_restart_from_completion_callback() {
    let tester = Arc::new(EchoTester::new(SimulatedBackend::default()).unwrap());
    let slot = Arc::new(Mutex::new(Some(Arc::clone(&tester))));
    let (done_tx, done_rx) = crossbeam_channel::unbounded();
    let (follow_tx, follow_rx) = crossbeam_channel::unbounded();

    tester
        .start(
            config(200),
            Chained {
                tester: Arc::clone(&slot),
                done: done_tx,
                follow_up: follow_tx,
            },
        )
        .unwrap();

    let restarted = done_rx.recv_timeout(Duration::from_secs(10)).unwrap();
    assert_eq!(restarted, Ok(()));
    let follow = follow_rx.recv_timeout(Duration::from_secs(10)).unwrap();
    assert!(matches!(follow, TestEvent::Complete(_)));

    // Break the reference cycle before the tester is dropped
    slot.lock().unwrap().take();
}

/// Fault injected into otherwise simulated devices
#[derive(Debug, Clone, Copy)]
enum Fault {
    /// Every n-th capture read returns an error
    FailEveryNthRead(usize),
    /// The first playback write returns an error
    FailFirstWrite,
    /// The first capture read panics; later runs are unaffected
    PanicOnFirstRead,
}

/// Counters shared between a test and its faulty devices
#[derive(Debug, Default)]
struct FaultLog {
    reads: AtomicUsize,
    read_failures: AtomicUsize,
    writes: AtomicUsize,
    write_failures: AtomicUsize,
    panicked: AtomicBool,
}

struct FaultyBackend {
    fault: Fault,
    log: Arc<FaultLog>,
    inner: SimulatedBackend,
}

impl FaultyBackend {
    fn new(fault: Fault) -> (Self, Arc<FaultLog>) {
        let log = Arc::new(FaultLog::default());
        let backend = Self {
            fault,
            log: Arc::clone(&log),
            inner: SimulatedBackend::new(RoomModel::default()),
        };
        (backend, log)
    }
}

impl AudioBackend for FaultyBackend {
    fn name(&self) -> &str {
        "faulty"
    }

    fn open_capture(&mut self, format: StreamFormat) -> Result<Box<dyn CaptureDevice>, DeviceError> {
        Ok(Box::new(FaultyCapture {
            inner: self.inner.open_capture(format)?,
            fault: self.fault,
            log: Arc::clone(&self.log),
        }))
    }

    fn open_playback(
        &mut self,
        format: StreamFormat,
    ) -> Result<Box<dyn PlaybackDevice>, DeviceError> {
        Ok(Box::new(FaultyPlayback {
            inner: self.inner.open_playback(format)?,
            fault: self.fault,
            log: Arc::clone(&self.log),
        }))
    }
}

struct FaultyCapture {
    inner: Box<dyn CaptureDevice>,
    fault: Fault,
    log: Arc<FaultLog>,
}

impl CaptureDevice for FaultyCapture {
    fn start(&mut self) -> Result<(), DeviceError> {
        self.inner.start()
    }

    fn read(&mut self, buffer: &mut [i16]) -> Result<usize, DeviceError> {
        let n = self.log.reads.fetch_add(1, Ordering::SeqCst) + 1;
        match self.fault {
            Fault::FailEveryNthRead(every) if n % every == 0 => {
                self.log.read_failures.fetch_add(1, Ordering::SeqCst);
                return Err(DeviceError::Read("buffer overrun".into()));
            }
            Fault::PanicOnFirstRead if !self.log.panicked.swap(true, Ordering::SeqCst) => {
                panic!("driver fault");
            }
            _ => {}
        }
        self.inner.read(buffer)
    }

    fn stop(&mut self) -> Result<(), DeviceError> {
        self.inner.stop()
    }
}

struct FaultyPlayback {
    inner: Box<dyn PlaybackDevice>,
    fault: Fault,
    log: Arc<FaultLog>,
}

impl PlaybackDevice for FaultyPlayback {
    fn start(&mut self) -> Result<(), DeviceError> {
        self.inner.start()
    }

    fn write(&mut self, samples: &[i16]) -> Result<(), DeviceError> {
        let n = self.log.writes.fetch_add(1, Ordering::SeqCst) + 1;
        if matches!(self.fault, Fault::FailFirstWrite) && n == 1 {
            self.log.write_failures.fetch_add(1, Ordering::SeqCst);
            return Err(DeviceError::Write("speaker unplugged".into()));
        }
        self.inner.write(samples)
    }

    fn stop(&mut self) -> Result<(), DeviceError> {
        self.inner.stop()
    }
}

/// Recorder keeping only the chirp log
struct ChirpLog(Arc<Mutex<Vec<ChirpEvent>>>);

impl SessionRecorder for ChirpLog {
    fn begin(&mut self, _: &RunConfig, _: &ChirpTemplate) -> Result<(), RecorderError> {
        Ok(())
    }

    fn record_chirp(&mut self, event: &ChirpEvent) -> Result<(), RecorderError> {
        self.0.lock().unwrap().push(*event);
        Ok(())
    }

    fn record_chunk(&mut self, _: &[i16]) -> Result<(), RecorderError> {
        Ok(())
    }

    fn finish(&mut self, _: &AnalysisReport) -> Result<(), RecorderError> {
        Ok(())
    }
}

/// Test that failed capture reads are skipped and the run still completes
#[test]
fn test_capture_read_errors_do_not_abort_run() {
    let (backend, log) = FaultyBackend::new(Fault::FailEveryNthRead(3));
    let tester = EchoTester::new(backend).unwrap();
    let (callback, events) = ChannelCallback::new();
    tester.start(config(1500), callback).unwrap();

    let (progress, terminal) = drain(&events);
    assert!(
        matches!(terminal, TestEvent::Complete(_)),
        "expected completion, got {:?}",
        terminal
    );
    assert_eq!(progress.last(), Some(&100));
    assert!(log.read_failures.load(Ordering::SeqCst) >= 2);
    assert!(log.reads.load(Ordering::SeqCst) > log.read_failures.load(Ordering::SeqCst));
}

/// Test that a failed chirp write logs no chirp and keeps the schedule
#[test]
fn test_failed_chirp_write_is_skipped_and_rescheduled() {
    let (backend, log) = FaultyBackend::new(Fault::FailFirstWrite);
    let tester = EchoTester::new(backend).unwrap();
    let chirps = Arc::new(Mutex::new(Vec::new()));
    let (callback, events) = ChannelCallback::new();
    let run = config(1300);
    let gap = run.chirp_gap_ms as u64;
    tester
        .start_recorded(run, callback, ChirpLog(Arc::clone(&chirps)))
        .unwrap();

    let (_, terminal) = drain(&events);
    assert!(matches!(terminal, TestEvent::Complete(_)));
    assert_eq!(log.write_failures.load(Ordering::SeqCst), 1);

    let chirps = chirps.lock().unwrap();
    // The write at ~0ms failed; the survivors go out at ~500 and ~1000ms
    assert!(!chirps.is_empty(), "no chirp was emitted");
    assert_eq!(chirps[0].index, 0);
    assert!(chirps[0].timestamp_ms >= gap, "{:?}", chirps[0]);
    for (i, pair) in chirps.windows(2).enumerate() {
        assert_eq!(pair[1].index, i + 1);
        assert!(pair[1].timestamp_ms - pair[0].timestamp_ms >= gap);
    }
    assert_eq!(chirps.len() + 1, log.writes.load(Ordering::SeqCst));
}

/// Test that a panic inside a run is reported once and the engine recovers
#[test]
fn test_panic_during_run_reports_error_once_then_recovers() {
    let (backend, log) = FaultyBackend::new(Fault::PanicOnFirstRead);
    let tester = EchoTester::new(backend).unwrap();

    let (callback, events) = ChannelCallback::new();
    tester.start(config(300), callback).unwrap();
    let (_, terminal) = drain(&events);
    match terminal {
        TestEvent::Error(message) => assert!(message.contains("driver fault"), "{}", message),
        other => panic!("expected error, got {:?}", other),
    }
    assert!(log.panicked.load(Ordering::SeqCst));
    assert!(!tester.is_running());

    std::thread::sleep(Duration::from_millis(200));
    assert!(events.try_iter().all(|e| !e.is_terminal()));

    let (callback, events) = ChannelCallback::new();
    tester.start(config(300), callback).unwrap();
    let (_, terminal) = drain(&events);
    assert!(matches!(terminal, TestEvent::Complete(_)));
}
