//! Simulated acoustic room
//!
//! A backend without hardware: capture returns pseudo-random noise paced to
//! real time, and every block written to playback reappears in the capture
//! stream twice, once as an attenuated direct path and once as a delayed,
//! further attenuated reflection. Lets the full engine run on machines without
//! a speaker/microphone pair and gives tests a deterministic-enough echo.

use super::device::{AudioBackend, CaptureDevice, DeviceError, PlaybackDevice, StreamFormat};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

/// Acoustic properties of the simulated room
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RoomModel {
    /// Delay from playback write to reflection start, in milliseconds
    pub echo_delay_ms: u32,
    /// Reflection gain relative to the played samples
    pub echo_gain: f32,
    /// Direct speaker-to-microphone gain
    pub direct_gain: f32,
    /// Peak amplitude of the background noise
    pub noise_amplitude: i16,
}

impl Default for RoomModel {
    fn default() -> Self {
        Self {
            echo_delay_ms: 40,
            echo_gain: 0.05,
            direct_gain: 0.3,
            noise_amplitude: 20,
        }
    }
}

impl RoomModel {
    /// A room with no reflecting surface: direct path and noise only
    pub fn anechoic() -> Self {
        Self {
            echo_gain: 0.0,
            ..Self::default()
        }
    }
}

/// Shared timeline between the simulated speaker and microphone
#[derive(Debug)]
struct Room {
    model: RoomModel,
    sample_rate: u32,
    /// Capture start; `None` until the microphone is started
    origin: Option<Instant>,
    /// Absolute index of the next sample the microphone will return
    read_pos: u64,
    /// Pending acoustic signal; `pending[0]` is at `read_pos`
    pending: VecDeque<i32>,
    /// LCG state for noise generation
    noise_seed: u32,
}

impl Room {
    fn new(model: RoomModel) -> Self {
        Self {
            model,
            sample_rate: crate::DEFAULT_SAMPLE_RATE,
            origin: None,
            read_pos: 0,
            pending: VecDeque::new(),
            noise_seed: 0xDEADBEEF,
        }
    }

    fn reset(&mut self, now: Instant) {
        self.origin = Some(now);
        self.read_pos = 0;
        self.pending.clear();
        self.noise_seed = 0xDEADBEEF;
    }

    /// Pseudo-random noise sample in -amplitude..amplitude (glibc LCG)
    fn next_noise(&mut self) -> i32 {
        self.noise_seed = self.noise_seed.wrapping_mul(1103515245).wrapping_add(12345);
        let bits = (self.noise_seed >> 16) & 0x7FFF;
        let unit = bits as f32 / 16384.0 - 1.0;
        (unit * self.model.noise_amplitude as f32) as i32
    }

    /// Add `samples * gain` to the timeline starting at absolute index `at`
    fn mix(&mut self, at: u64, samples: &[i16], gain: f32) {
        if gain == 0.0 {
            return;
        }
        for (i, &s) in samples.iter().enumerate() {
            let pos = at + i as u64;
            // Already delivered to the microphone
            if pos < self.read_pos {
                continue;
            }
            let offset = (pos - self.read_pos) as usize;
            if offset >= self.pending.len() {
                self.pending.resize(offset + 1, 0);
            }
            self.pending[offset] += (s as f32 * gain) as i32;
        }
    }

    fn position_at(&self, now: Instant) -> Option<u64> {
        self.origin.map(|origin| {
            (now.saturating_duration_since(origin).as_secs_f64() * self.sample_rate as f64) as u64
        })
    }
}

fn lock(room: &Mutex<Room>) -> MutexGuard<'_, Room> {
    // A panic while holding the lock leaves the timeline usable
    room.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Backend producing a simulated room instead of touching hardware
///
/// # Example
/// ```
/// use echotester_core::audio::simulated::{RoomModel, SimulatedBackend};
///
/// let backend = SimulatedBackend::new(RoomModel::default());
/// ```
#[derive(Debug, Clone)]
pub struct SimulatedBackend {
    room: Arc<Mutex<Room>>,
}

impl SimulatedBackend {
    /// Create a backend for the given room
    pub fn new(model: RoomModel) -> Self {
        Self {
            room: Arc::new(Mutex::new(Room::new(model))),
        }
    }

    /// Room model in use
    pub fn model(&self) -> RoomModel {
        lock(&self.room).model
    }
}

impl Default for SimulatedBackend {
    fn default() -> Self {
        Self::new(RoomModel::default())
    }
}

impl AudioBackend for SimulatedBackend {
    fn name(&self) -> &str {
        "simulated"
    }

    fn open_capture(&mut self, format: StreamFormat) -> Result<Box<dyn CaptureDevice>, DeviceError> {
        lock(&self.room).sample_rate = format.sample_rate;
        Ok(Box::new(SimulatedCapture {
            room: Arc::clone(&self.room),
            running: false,
        }))
    }

    fn open_playback(
        &mut self,
        format: StreamFormat,
    ) -> Result<Box<dyn PlaybackDevice>, DeviceError> {
        lock(&self.room).sample_rate = format.sample_rate;
        Ok(Box::new(SimulatedPlayback {
            room: Arc::clone(&self.room),
        }))
    }
}

/// Simulated microphone
struct SimulatedCapture {
    room: Arc<Mutex<Room>>,
    running: bool,
}

impl CaptureDevice for SimulatedCapture {
    fn start(&mut self) -> Result<(), DeviceError> {
        lock(&self.room).reset(Instant::now());
        self.running = true;
        Ok(())
    }

    fn read(&mut self, buffer: &mut [i16]) -> Result<usize, DeviceError> {
        if !self.running || buffer.is_empty() {
            return Ok(0);
        }

        // Block until the requested samples have "arrived" in real time
        let wait = {
            let room = lock(&self.room);
            let origin = room
                .origin
                .ok_or_else(|| DeviceError::Read("capture not started".into()))?;
            let target = room.read_pos + buffer.len() as u64;
            let due = origin + Duration::from_secs_f64(target as f64 / room.sample_rate as f64);
            due.saturating_duration_since(Instant::now())
        };
        if !wait.is_zero() {
            std::thread::sleep(wait);
        }

        let mut room = lock(&self.room);
        for slot in buffer.iter_mut() {
            let acoustic = room.pending.pop_front().unwrap_or(0);
            let value = acoustic + room.next_noise();
            *slot = value.clamp(i16::MIN as i32, i16::MAX as i32) as i16;
        }
        room.read_pos += buffer.len() as u64;
        Ok(buffer.len())
    }

    fn stop(&mut self) -> Result<(), DeviceError> {
        self.running = false;
        Ok(())
    }
}

/// Simulated speaker
struct SimulatedPlayback {
    room: Arc<Mutex<Room>>,
}

impl PlaybackDevice for SimulatedPlayback {
    fn start(&mut self) -> Result<(), DeviceError> {
        Ok(())
    }

    fn write(&mut self, samples: &[i16]) -> Result<(), DeviceError> {
        let mut room = lock(&self.room);
        let Some(pos) = room.position_at(Instant::now()) else {
            // Microphone not running: nothing can hear the speaker
            return Ok(());
        };
        let model = room.model;
        let echo_offset = model.echo_delay_ms as u64 * room.sample_rate as u64 / 1000;
        room.mix(pos, samples, model.direct_gain);
        room.mix(pos + echo_offset, samples, model.echo_gain);
        Ok(())
    }

    fn stop(&mut self) -> Result<(), DeviceError> {
        Ok(())
    }
}
