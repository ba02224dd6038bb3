//! Hardware backend on top of cpal
//!
//! The engine wants blocking mono i16 `read`/`write`; cpal delivers audio in
//! callbacks on its own thread, in whatever sample format and channel count
//! the device prefers. Each direction is bridged with a lock-free SPSC ring
//! buffer:
//!
//! - input callback: channel 0 of every frame, converted to i16, pushed into
//!   the capture ring; [`CaptureDevice::read`] drains it
//! - [`PlaybackDevice::write`] pushes into the playback ring; the output
//!   callback pops one sample per frame (written to every channel) and pads
//!   with silence when the ring runs dry

use super::device::{AudioBackend, CaptureDevice, DeviceError, PlaybackDevice, StreamFormat};
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{Device, Host, Sample, SampleFormat, SampleRate, SizedSample, Stream, StreamConfig};
use ringbuf::traits::{Consumer, Producer, Split};
use ringbuf::{HeapCons, HeapProd, HeapRb};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Sleep between ring buffer polls while blocking
const POLL_INTERVAL: Duration = Duration::from_millis(1);

/// Longest `write` may wait for room in the playback ring
const WRITE_TIMEOUT: Duration = Duration::from_secs(1);

/// Audio device information
#[derive(Debug, Clone)]
pub struct DeviceInfo {
    /// Device name
    pub name: String,
    /// Whether this is the default input or output device
    pub is_default: bool,
    /// Supported sample rates out of the common ones
    pub sample_rates: Vec<u32>,
    /// Number of input channels
    pub input_channels: u16,
    /// Number of output channels
    pub output_channels: u16,
}

/// Backend using the platform's default cpal host
#[derive(Debug, Clone, Default)]
pub struct CpalBackend {
    device_name: Option<String>,
}

impl CpalBackend {
    /// Use the default input and output devices
    pub fn new() -> Self {
        Self::default()
    }

    /// Use the input and output devices with the given name
    pub fn with_device(name: impl Into<String>) -> Self {
        Self {
            device_name: Some(name.into()),
        }
    }

    /// Selected device name, `None` for the defaults
    pub fn device_name(&self) -> Option<&str> {
        self.device_name.as_deref()
    }

    /// List available audio devices
    pub fn list_devices() -> Result<Vec<DeviceInfo>, DeviceError> {
        let host = cpal::default_host();
        let mut devices = Vec::new();

        let default_input = host.default_input_device().and_then(|d| d.name().ok());
        let default_output = host.default_output_device().and_then(|d| d.name().ok());

        let all = host
            .devices()
            .map_err(|e| DeviceError::Open(e.to_string()))?;
        for device in all {
            let name = device.name().unwrap_or_else(|_| "Unknown".to_string());
            let is_default = default_input.as_deref() == Some(name.as_str())
                || default_output.as_deref() == Some(name.as_str());

            let input_channels = device
                .default_input_config()
                .map(|c| c.channels())
                .unwrap_or(0);
            let output_channels = device
                .default_output_config()
                .map(|c| c.channels())
                .unwrap_or(0);

            let common_rates = [44100, 48000, 88200, 96000, 176400, 192000];
            let mut sample_rates = Vec::new();
            let ranges = device
                .supported_input_configs()
                .into_iter()
                .flatten()
                .chain(device.supported_output_configs().into_iter().flatten());
            for range in ranges {
                for &rate in &common_rates {
                    if (range.min_sample_rate().0..=range.max_sample_rate().0).contains(&rate)
                        && !sample_rates.contains(&rate)
                    {
                        sample_rates.push(rate);
                    }
                }
            }
            sample_rates.sort_unstable();

            devices.push(DeviceInfo {
                name,
                is_default,
                sample_rates,
                input_channels,
                output_channels,
            });
        }

        Ok(devices)
    }

    fn find_device(&self, host: &Host, input: bool) -> Result<Device, DeviceError> {
        let kind = if input { "input" } else { "output" };
        let Some(name) = &self.device_name else {
            let default = if input {
                host.default_input_device()
            } else {
                host.default_output_device()
            };
            return default.ok_or(DeviceError::NoDevice(kind));
        };

        let has_direction = |d: &Device| {
            if input {
                d.default_input_config().is_ok()
            } else {
                d.default_output_config().is_ok()
            }
        };
        host.devices()
            .map_err(|e| DeviceError::Open(e.to_string()))?
            .find(|d| d.name().map(|n| &n == name).unwrap_or(false) && has_direction(d))
            .ok_or_else(|| DeviceError::DeviceNotFound(name.clone()))
    }
}

fn stream_config(channels: u16, format: StreamFormat) -> StreamConfig {
    StreamConfig {
        channels,
        sample_rate: SampleRate(format.sample_rate),
        buffer_size: cpal::BufferSize::Default,
    }
}

fn build_input<T>(
    device: &Device,
    config: &StreamConfig,
    mut producer: HeapProd<i16>,
    failed: Arc<AtomicBool>,
) -> Result<Stream, cpal::BuildStreamError>
where
    T: SizedSample,
    i16: cpal::FromSample<T>,
{
    let channels = config.channels.max(1) as usize;
    device.build_input_stream(
        config,
        move |data: &[T], _: &cpal::InputCallbackInfo| {
            for frame in data.chunks(channels) {
                if let Some(&sample) = frame.first() {
                    // Overrun: drop newest samples rather than block the callback
                    let _ = producer.try_push(i16::from_sample(sample));
                }
            }
        },
        move |err| {
            tracing::error!("Input stream error: {}", err);
            failed.store(true, Ordering::Release);
        },
        None,
    )
}

fn build_output<T>(
    device: &Device,
    config: &StreamConfig,
    mut consumer: HeapCons<i16>,
    failed: Arc<AtomicBool>,
) -> Result<Stream, cpal::BuildStreamError>
where
    T: SizedSample + cpal::FromSample<i16>,
{
    let channels = config.channels.max(1) as usize;
    device.build_output_stream(
        config,
        move |data: &mut [T], _: &cpal::OutputCallbackInfo| {
            for frame in data.chunks_mut(channels) {
                let value = T::from_sample(consumer.try_pop().unwrap_or(0));
                frame.fill(value);
            }
        },
        move |err| {
            tracing::error!("Output stream error: {}", err);
            failed.store(true, Ordering::Release);
        },
        None,
    )
}

impl AudioBackend for CpalBackend {
    fn name(&self) -> &str {
        "cpal"
    }

    fn open_capture(&mut self, format: StreamFormat) -> Result<Box<dyn CaptureDevice>, DeviceError> {
        let host = cpal::default_host();
        let device = self.find_device(&host, true)?;
        let default = device
            .default_input_config()
            .map_err(|e| DeviceError::Open(e.to_string()))?;
        let config = stream_config(default.channels(), format);

        // One second of headroom between callback and reader
        let (producer, consumer) = HeapRb::<i16>::new(format.sample_rate as usize).split();
        let failed = Arc::new(AtomicBool::new(false));

        let stream = match default.sample_format() {
            SampleFormat::F32 => build_input::<f32>(&device, &config, producer, Arc::clone(&failed)),
            SampleFormat::I16 => build_input::<i16>(&device, &config, producer, Arc::clone(&failed)),
            SampleFormat::U16 => build_input::<u16>(&device, &config, producer, Arc::clone(&failed)),
            other => return Err(DeviceError::UnsupportedFormat(format!("{:?}", other))),
        }
        .map_err(|e| DeviceError::Open(e.to_string()))?;

        tracing::info!(
            device = %device.name().unwrap_or_else(|_| "Unknown".to_string()),
            channels = config.channels,
            sample_rate = format.sample_rate,
            "Capture stream opened"
        );

        // Twice the nominal chunk duration, never below 20ms
        let chunk = Duration::from_secs_f64(format.chunk_size as f64 / format.sample_rate as f64);
        Ok(Box::new(CpalCapture {
            stream,
            consumer,
            failed,
            read_timeout: (chunk * 2).max(Duration::from_millis(20)),
        }))
    }

    fn open_playback(
        &mut self,
        format: StreamFormat,
    ) -> Result<Box<dyn PlaybackDevice>, DeviceError> {
        let host = cpal::default_host();
        let device = self.find_device(&host, false)?;
        let default = device
            .default_output_config()
            .map_err(|e| DeviceError::Open(e.to_string()))?;
        let config = stream_config(default.channels(), format);

        let (producer, consumer) = HeapRb::<i16>::new(format.sample_rate as usize / 2).split();
        let failed = Arc::new(AtomicBool::new(false));

        let stream = match default.sample_format() {
            SampleFormat::F32 => build_output::<f32>(&device, &config, consumer, Arc::clone(&failed)),
            SampleFormat::I16 => build_output::<i16>(&device, &config, consumer, Arc::clone(&failed)),
            SampleFormat::U16 => build_output::<u16>(&device, &config, consumer, Arc::clone(&failed)),
            other => return Err(DeviceError::UnsupportedFormat(format!("{:?}", other))),
        }
        .map_err(|e| DeviceError::Open(e.to_string()))?;

        tracing::info!(
            device = %device.name().unwrap_or_else(|_| "Unknown".to_string()),
            channels = config.channels,
            sample_rate = format.sample_rate,
            "Playback stream opened"
        );

        Ok(Box::new(CpalPlayback {
            stream,
            producer,
            failed,
        }))
    }
}

/// Microphone stream plus the reading end of its ring buffer
struct CpalCapture {
    stream: Stream,
    consumer: HeapCons<i16>,
    failed: Arc<AtomicBool>,
    read_timeout: Duration,
}

impl CaptureDevice for CpalCapture {
    fn start(&mut self) -> Result<(), DeviceError> {
        self.stream
            .play()
            .map_err(|e| DeviceError::Start(e.to_string()))
    }

    fn read(&mut self, buffer: &mut [i16]) -> Result<usize, DeviceError> {
        if self.failed.load(Ordering::Acquire) {
            return Err(DeviceError::Read("input stream reported an error".into()));
        }

        let deadline = Instant::now() + self.read_timeout;
        let mut filled = 0;
        while filled < buffer.len() {
            filled += self.consumer.pop_slice(&mut buffer[filled..]);
            if filled >= buffer.len() || Instant::now() >= deadline {
                break;
            }
            std::thread::sleep(POLL_INTERVAL);
        }
        Ok(filled)
    }

    fn stop(&mut self) -> Result<(), DeviceError> {
        self.stream
            .pause()
            .map_err(|e| DeviceError::Stop(e.to_string()))
    }
}

/// Speaker stream plus the writing end of its ring buffer
struct CpalPlayback {
    stream: Stream,
    producer: HeapProd<i16>,
    failed: Arc<AtomicBool>,
}

impl PlaybackDevice for CpalPlayback {
    fn start(&mut self) -> Result<(), DeviceError> {
        self.stream
            .play()
            .map_err(|e| DeviceError::Start(e.to_string()))
    }

    fn write(&mut self, samples: &[i16]) -> Result<(), DeviceError> {
        if self.failed.load(Ordering::Acquire) {
            return Err(DeviceError::Write("output stream reported an error".into()));
        }

        let deadline = Instant::now() + WRITE_TIMEOUT;
        let mut written = 0;
        while written < samples.len() {
            written += self.producer.push_slice(&samples[written..]);
            if written >= samples.len() {
                break;
            }
            if Instant::now() >= deadline {
                return Err(DeviceError::Write(format!(
                    "playback buffer full, {} of {} samples queued",
                    written,
                    samples.len()
                )));
            }
            std::thread::sleep(POLL_INTERVAL);
        }
        Ok(())
    }

    fn stop(&mut self) -> Result<(), DeviceError> {
        self.stream
            .pause()
            .map_err(|e| DeviceError::Stop(e.to_string()))
    }
}
