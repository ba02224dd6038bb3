//! E2E tests for session recording and config persistence

use echotester::audio::analyzer::AnalysisReport;
use echotester::audio::recorder::{DirectoryRecorder, RecorderError, SessionRecorder};
use echotester::audio::simulated::SimulatedBackend;
use echotester::{
    ChannelCallback, ChirpAlignment, ChirpEvent, ChirpTemplate, EchoTester, RunConfig, TestEvent,
};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

fn wait_complete(events: &crossbeam_channel::Receiver<TestEvent>) -> echotester::TestResult {
    loop {
        match events.recv_timeout(Duration::from_secs(15)).unwrap() {
            TestEvent::Progress(_) => continue,
            TestEvent::Complete(result) => return result,
            TestEvent::Error(message) => panic!("run failed: {}", message),
        }
    }
}

fn only_session_dir(root: &Path) -> PathBuf {
    let dirs: Vec<PathBuf> = fs::read_dir(root)
        .unwrap()
        .map(|e| e.unwrap().path())
        .filter(|p| p.is_dir())
        .collect();
    assert_eq!(dirs.len(), 1, "expected one session dir, got {:?}", dirs);
    dirs.into_iter().next().unwrap()
}

/// Test that a recorded run leaves a complete session directory
#[test]
fn test_recorded_run_writes_session() {
    let root = tempfile::tempdir().unwrap();
    let tester = EchoTester::new(SimulatedBackend::default()).unwrap();
    let (callback, events) = ChannelCallback::new();
    let config = RunConfig {
        run_duration_ms: 1200,
        ..RunConfig::default()
    };

    let recorder = DirectoryRecorder::new(root.path());
    let dir_handle = recorder.dir_handle();
    tester
        .start_recorded(config.clone(), callback, recorder)
        .unwrap();
    let result = wait_complete(&events);

    let session = only_session_dir(root.path());
    assert_eq!(dir_handle.get().as_deref(), Some(session.as_path()));
    let name = session.file_name().unwrap().to_string_lossy().to_string();
    assert!(name.starts_with("session_"), "{}", name);
    assert_eq!(name.len(), "session_YYYYMMDD_HHMMSS".len());

    // PCM and WAV hold the same samples
    let pcm = fs::read(session.join("raw_recording.pcm")).unwrap();
    assert!(!pcm.is_empty());
    let reader = hound::WavReader::open(session.join("recording.wav")).unwrap();
    assert_eq!(reader.spec().channels, 1);
    assert_eq!(reader.spec().sample_rate, 48000);
    assert_eq!(reader.len() as usize * 2, pcm.len());

    let chirp = fs::read(session.join("chirp_template.raw")).unwrap();
    assert_eq!(chirp.len(), config.chirp_samples() * 2);

    let timing = fs::read_to_string(session.join("chirp_timing.csv")).unwrap();
    let mut lines = timing.lines();
    assert_eq!(lines.next(), Some("chirp_index,timestamp_ms"));
    // Chirps at ~0, 500 and 1000ms
    assert!(lines.count() >= 2);

    let metadata: serde_json::Value =
        serde_json::from_str(&fs::read_to_string(session.join("session_metadata.json")).unwrap())
            .unwrap();
    assert_eq!(metadata["config"]["run_duration_ms"], 1200);
    assert_eq!(metadata["chirp_samples"], 960);

    let results: serde_json::Value =
        serde_json::from_str(&fs::read_to_string(session.join("analysis_results.json")).unwrap())
            .unwrap();
    assert_eq!(results["echo_detected"], result.echo_detected);
    assert_eq!(results["echo_count"], result.echo_count);

    let detail = fs::read_to_string(session.join("detailed_analysis.csv")).unwrap();
    assert!(detail.starts_with("chirp_index,start_sample,"));
    assert_eq!(detail.lines().count() - 1, result.echo_count);
}

/// Recorder that fails on the first captured chunk and logs every call
struct BrokenRecorder {
    calls: Arc<Mutex<Vec<&'static str>>>,
}

impl SessionRecorder for BrokenRecorder {
    fn begin(&mut self, _: &RunConfig, _: &ChirpTemplate) -> Result<(), RecorderError> {
        self.calls.lock().unwrap().push("begin");
        Ok(())
    }

    fn record_chirp(&mut self, _: &ChirpEvent) -> Result<(), RecorderError> {
        self.calls.lock().unwrap().push("chirp");
        Ok(())
    }

    fn record_chunk(&mut self, _: &[i16]) -> Result<(), RecorderError> {
        self.calls.lock().unwrap().push("chunk");
        Err(RecorderError::Io(std::io::Error::new(
            std::io::ErrorKind::Other,
            "disk full",
        )))
    }

    fn finish(&mut self, _: &AnalysisReport) -> Result<(), RecorderError> {
        self.calls.lock().unwrap().push("finish");
        Ok(())
    }
}

/// Test that a failing recorder is dropped without affecting the run
#[test]
fn test_recorder_failure_does_not_abort_run() {
    let calls = Arc::new(Mutex::new(Vec::new()));
    let tester = EchoTester::new(SimulatedBackend::default()).unwrap();
    let (callback, events) = ChannelCallback::new();
    let config = RunConfig {
        run_duration_ms: 1200,
        ..RunConfig::default()
    };

    tester
        .start_recorded(
            config,
            callback,
            BrokenRecorder {
                calls: Arc::clone(&calls),
            },
        )
        .unwrap();
    let result = wait_complete(&events);
    assert!(result.echo_detected, "{}", result);

    let calls = calls.lock().unwrap();
    assert_eq!(calls.first(), Some(&"begin"));
    assert_eq!(calls.iter().filter(|&&c| c == "chunk").count(), 1);
    assert!(!calls.contains(&"finish"));
}

/// Test that configs survive a save/load cycle, including missing fields
#[test]
fn test_config_file_round_trip() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("nested").join("echotester.json");

    let config = RunConfig {
        run_duration_ms: 12_000,
        chirp_gap_ms: 250,
        alignment: ChirpAlignment::FirstChirp,
        ..RunConfig::default()
    };
    config.save(&path).unwrap();
    assert_eq!(RunConfig::load(&path).unwrap(), config);

    let partial = dir.path().join("partial.json");
    fs::write(&partial, r#"{ "run_duration_ms": 3000 }"#).unwrap();
    let loaded = RunConfig::load(&partial).unwrap();
    assert_eq!(loaded.run_duration_ms, 3000);
    assert_eq!(loaded.chirp_min_freq, 18000);
    assert_eq!(loaded.alignment, ChirpAlignment::CaptureStart);
}
