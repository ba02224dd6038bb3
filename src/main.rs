//! Echotester - speaker/microphone ultrasonic echo self-test
//!
//! Command line entry point: runs one test and prints the result.

use anyhow::{anyhow, bail, Context, Result};
use echotester::audio::recorder::DirectoryRecorder;
use echotester::audio::simulated::{RoomModel, SimulatedBackend};
use echotester::{ChannelCallback, EchoTester, RunConfig, TestEvent};
use std::io::{self, Write};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info};

/// Parsed command line
#[derive(Debug, Default)]
struct Options {
    simulate: bool,
    device: Option<String>,
    duration_ms: Option<u32>,
    config: Option<PathBuf>,
    save_config: Option<PathBuf>,
    record: Option<PathBuf>,
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("echotester=info,echotester_core=info")),
        )
        .init();

    let args: Vec<String> = std::env::args().collect();
    let mut opts = Options::default();
    let mut i = 1;

    while i < args.len() {
        match args[i].as_str() {
            "--list" | "-l" => return list_devices(),
            "--version" | "-v" => {
                println!("echotester {} ({})", echotester::VERSION, echotester::BUILD_DATE);
                return Ok(());
            }
            "--help" | "-h" => {
                print_help();
                return Ok(());
            }
            "--simulate" | "-s" => opts.simulate = true,
            "--device" | "-d" => {
                opts.device = Some(value(&args, i, "a device name")?.to_string());
                i += 1;
            }
            "--duration" | "-t" => {
                let raw = value(&args, i, "a duration in milliseconds")?;
                opts.duration_ms = Some(
                    raw.parse()
                        .map_err(|_| anyhow!("Invalid duration: {}", raw))?,
                );
                i += 1;
            }
            "--config" | "-c" => {
                opts.config = Some(PathBuf::from(value(&args, i, "a file path")?));
                i += 1;
            }
            "--save-config" => {
                opts.save_config = Some(PathBuf::from(value(&args, i, "a file path")?));
                i += 1;
            }
            "--record" | "-r" => {
                opts.record = Some(PathBuf::from(value(&args, i, "a directory")?));
                i += 1;
            }
            arg => {
                eprintln!("Unknown argument: {}", arg);
                print_help();
                bail!("unknown argument {}", arg);
            }
        }
        i += 1;
    }

    run(opts)
}

/// Value following the flag at `i`
fn value<'a>(args: &'a [String], i: usize, what: &str) -> Result<&'a str> {
    args.get(i + 1)
        .map(String::as_str)
        .ok_or_else(|| anyhow!("{} requires {}", args[i], what))
}

fn print_help() {
    println!("Usage: echotester [OPTIONS]");
    println!();
    println!("Emits 18-22kHz chirps through the speaker and checks that the");
    println!("microphone picks up their reflection.");
    println!();
    println!("Options:");
    println!("  -s, --simulate          Use a simulated room instead of audio hardware");
    println!("  -d, --device NAME       Use the named input/output device");
    println!("  -t, --duration MS       Run duration in milliseconds (default: 5000)");
    println!("  -c, --config FILE       Load run configuration from JSON");
    println!("      --save-config FILE  Write the effective configuration to JSON");
    println!("  -r, --record DIR        Save raw capture and analysis under DIR");
    println!("  -l, --list              List available audio devices");
    println!("  -v, --version           Show version");
    println!("  -h, --help              Show this help");
    println!();
    println!("Examples:");
    println!("  echotester --simulate --duration 3000");
    println!("  echotester -d \"USB Audio\" --record sessions");
}

#[cfg(feature = "cpal-backend")]
fn list_devices() -> Result<()> {
    use echotester::audio::cpal_backend::CpalBackend;

    let devices = CpalBackend::list_devices()?;
    if devices.is_empty() {
        println!("No audio devices found.");
        return Ok(());
    }

    println!("Found {} device(s):", devices.len());
    println!();
    for (i, device) in devices.iter().enumerate() {
        let default_marker = if device.is_default { " [DEFAULT]" } else { "" };
        println!("  {}. {}{}", i + 1, device.name, default_marker);
        println!(
            "     Channels: {} in, {} out",
            device.input_channels, device.output_channels
        );
        if !device.sample_rates.is_empty() {
            println!("     Sample rates: {:?}", device.sample_rates);
        }
        println!();
    }
    Ok(())
}

#[cfg(not(feature = "cpal-backend"))]
fn list_devices() -> Result<()> {
    bail!("built without audio hardware support (enable the cpal-backend feature)")
}

#[cfg(feature = "cpal-backend")]
fn hardware_tester(device: Option<&str>) -> Result<EchoTester> {
    use echotester::audio::cpal_backend::CpalBackend;

    let backend = match device {
        Some(name) => CpalBackend::with_device(name),
        None => CpalBackend::new(),
    };
    Ok(EchoTester::new(backend)?)
}

#[cfg(not(feature = "cpal-backend"))]
fn hardware_tester(_device: Option<&str>) -> Result<EchoTester> {
    bail!("built without audio hardware support, use --simulate")
}

fn run(opts: Options) -> Result<()> {
    let mut config = match &opts.config {
        Some(path) => RunConfig::load(path)
            .with_context(|| format!("loading {}", path.display()))?,
        None => RunConfig::default(),
    };
    if let Some(duration) = opts.duration_ms {
        config.run_duration_ms = duration;
    }
    config.validate()?;

    if let Some(path) = &opts.save_config {
        config.save(path)?;
        println!("Configuration saved to {}", path.display());
    }

    let tester = Arc::new(if opts.simulate {
        EchoTester::new(SimulatedBackend::new(RoomModel::default()))?
    } else {
        hardware_tester(opts.device.as_deref())?
    });

    println!(
        "Echotester v{} - {} backend, {} ms, chirp {}-{} Hz every {} ms",
        echotester::VERSION,
        tester.backend_name(),
        config.run_duration_ms,
        config.chirp_min_freq,
        config.chirp_max_freq,
        config.chirp_gap_ms
    );
    println!("Press Ctrl+C to stop early.");
    println!();

    let stopper = Arc::clone(&tester);
    if let Err(e) = ctrlc::set_handler(move || stopper.stop()) {
        error!("Failed to install Ctrl+C handler: {}", e);
    }

    let (callback, events) = ChannelCallback::new();
    let session_dir = match &opts.record {
        Some(dir) => {
            let recorder = DirectoryRecorder::new(dir);
            let handle = recorder.dir_handle();
            tester.start_recorded(config, callback, recorder)?;
            Some(handle)
        }
        None => {
            tester.start(config, callback)?;
            None
        }
    };

    let mut last_percent = None;
    let outcome = loop {
        let event = events
            .recv()
            .map_err(|_| anyhow!("echo test worker exited without a result"))?;
        match event {
            TestEvent::Progress(percent) => {
                if last_percent != Some(percent) {
                    last_percent = Some(percent);
                    render_progress(percent)?;
                }
            }
            TestEvent::Complete(result) => {
                println!();
                println!();
                println!("{}", result);
                break Ok(());
            }
            TestEvent::Error(message) => {
                println!();
                error!("Echo test failed: {}", message);
                break Err(anyhow!("echo test failed: {}", message));
            }
        }
    };

    tester.release();
    match (session_dir.and_then(|h| h.get()), &opts.record) {
        (Some(dir), _) => info!("Session artifacts written to {}", dir.display()),
        (None, Some(root)) => error!("No session was recorded under {}", root.display()),
        (None, None) => {}
    }
    outcome
}

fn render_progress(percent: u8) -> Result<()> {
    const WIDTH: usize = 40;
    let filled = WIDTH * percent as usize / 100;
    print!(
        "\rProgress: [{}{}] {:>3}%",
        "#".repeat(filled),
        " ".repeat(WIDTH - filled),
        percent
    );
    io::stdout().flush()?;
    Ok(())
}
