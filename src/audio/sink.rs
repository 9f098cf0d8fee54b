//! Audio output sink
//!
//! The pipeline only talks to the output device through [`AudioSink`].
//!
//! The cpal implementation keeps the `cpal::Stream` on its own thread (streams
//! are not `Send`) and feeds it through a lock-free SPSC ring buffer:
//! - writer side (`write`) decodes big-endian PCM and pushes whole frames,
//!   sleeping while the ring is full
//! - the output callback pops frames, applies the volume, and emits silence
//!   while the sink is stopped

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{FromSample, Sample, SizedSample};
use ringbuf::{
    traits::{Consumer, Observer, Producer, Split},
    HeapRb,
};
use thiserror::Error;

use super::buffer::{read_samples, CHANNELS, SAMPLE_BYTES};
use super::lock;
use crate::settings::NoiseConfig;

/// How long a blocked writer waits before retrying the ring
const WRITE_POLL: Duration = Duration::from_millis(5);

/// How long `drain` waits between checks
const DRAIN_POLL: Duration = Duration::from_millis(10);

/// Errors reported by an output sink
#[derive(Error, Debug, Clone, PartialEq)]
pub enum SinkError {
    #[error("Audio device unavailable: {0}")]
    DeviceUnavailable(String),

    #[error("Sink is closed")]
    Closed,
}

/// An open output device accepting 16-bit big-endian interleaved stereo PCM.
///
/// All methods take `&self`: the command loop and the streaming worker share
/// the same handle.
pub trait AudioSink: Send + Sync {
    /// Apply a normalized volume in `[0, 1]`
    fn set_volume(&self, volume: f32);

    /// Queue `bytes` for playback, blocking until the device accepted all of them
    fn write(&self, bytes: &[u8]) -> Result<(), SinkError>;

    /// Resume device output
    fn start(&self) -> Result<(), SinkError>;

    /// Pause device output without releasing anything
    fn stop(&self) -> Result<(), SinkError>;

    /// Wait until queued audio has been played.
    ///
    /// While stopped this keeps waiting until the sink is started again or
    /// closed.
    fn drain(&self);

    /// Release the device. Blocked and future writes fail with [`SinkError::Closed`].
    fn close(&self);

    fn is_active(&self) -> bool;

    /// Frames handed to the device since open
    fn frame_position(&self) -> u64;

    /// Device-side buffer capacity in bytes
    fn buffer_size(&self) -> usize;

    /// Bytes that can be written without blocking
    fn available_bytes(&self) -> usize;
}

/// Opens sinks for a configuration
pub trait AudioBackend: Send + Sync {
    fn open(&self, config: &NoiseConfig) -> Result<Arc<dyn AudioSink>, SinkError>;
}

/// Backend using the default cpal output device
pub struct CpalBackend;

impl AudioBackend for CpalBackend {
    fn open(&self, config: &NoiseConfig) -> Result<Arc<dyn AudioSink>, SinkError> {
        let sink = CpalSink::open(config.sample_rate, config.volume)?;
        Ok(Arc::new(sink))
    }
}

/// Messages for the thread owning the cpal stream
enum DeviceControl {
    Play,
    Pause,
    Close,
}

/// State shared with the output callback
struct SinkShared {
    active: AtomicBool,
    closed: AtomicBool,
    /// f32 bits
    volume: AtomicU32,
    samples_queued: AtomicU64,
    samples_played: AtomicU64,
}

impl SinkShared {
    fn queued(&self) -> u64 {
        self.samples_queued
            .load(Ordering::Acquire)
            .saturating_sub(self.samples_played.load(Ordering::Acquire))
    }
}

/// cpal output stream fed through a ring buffer
pub struct CpalSink {
    producer: Mutex<ringbuf::HeapProd<i16>>,
    shared: Arc<SinkShared>,
    control: Mutex<Sender<DeviceControl>>,
    /// Ring capacity in samples
    capacity: usize,
}

impl CpalSink {
    /// Open the default output device at `sample_rate`, stereo.
    ///
    /// The sink starts stopped; call [`AudioSink::start`] to hear it.
    pub fn open(sample_rate: u32, volume: f32) -> Result<Self, SinkError> {
        // ~1 second of stereo audio, whole frames only
        let capacity = (sample_rate as usize * CHANNELS).max(CHANNELS);
        let rb = HeapRb::<i16>::new(capacity);
        let (producer, consumer) = rb.split();

        let shared = Arc::new(SinkShared {
            active: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            volume: AtomicU32::new(volume.to_bits()),
            samples_queued: AtomicU64::new(0),
            samples_played: AtomicU64::new(0),
        });

        let (control_tx, control_rx) = mpsc::channel();
        let (ready_tx, ready_rx) = mpsc::channel();
        let thread_shared = Arc::clone(&shared);

        thread::Builder::new()
            .name("audio-device".to_string())
            .spawn(move || {
                device_thread(sample_rate, consumer, thread_shared, control_rx, ready_tx)
            })
            .map_err(|e| SinkError::DeviceUnavailable(e.to_string()))?;

        match ready_rx.recv() {
            Ok(Ok(())) => {}
            Ok(Err(e)) => return Err(e),
            Err(_) => {
                return Err(SinkError::DeviceUnavailable(
                    "Audio device thread exited".to_string(),
                ))
            }
        }

        Ok(Self {
            producer: Mutex::new(producer),
            shared,
            control: Mutex::new(control_tx),
            capacity,
        })
    }

    fn send(&self, message: DeviceControl) -> Result<(), SinkError> {
        lock(&self.control)
            .send(message)
            .map_err(|_| SinkError::Closed)
    }

    fn is_closed(&self) -> bool {
        self.shared.closed.load(Ordering::Acquire)
    }
}

impl AudioSink for CpalSink {
    fn set_volume(&self, volume: f32) {
        self.shared.volume.store(volume.to_bits(), Ordering::Relaxed);
    }

    fn write(&self, bytes: &[u8]) -> Result<(), SinkError> {
        let samples: Vec<i16> = read_samples(bytes).collect();
        let mut producer = lock(&self.producer);
        let mut pending = &samples[..];

        while !pending.is_empty() {
            if self.is_closed() {
                return Err(SinkError::Closed);
            }

            // Push whole frames so the callback never splits a frame
            let room = producer.vacant_len() / CHANNELS * CHANNELS;
            let take = room.min(pending.len());
            if take > 0 {
                let pushed = producer.push_slice(&pending[..take]);
                self.shared
                    .samples_queued
                    .fetch_add(pushed as u64, Ordering::Release);
                pending = &pending[pushed..];
            }

            // Back-pressure: wait for the device to make room
            if !pending.is_empty() {
                thread::sleep(WRITE_POLL);
            }
        }

        Ok(())
    }

    fn start(&self) -> Result<(), SinkError> {
        if self.is_closed() {
            return Err(SinkError::Closed);
        }
        self.shared.active.store(true, Ordering::Release);
        self.send(DeviceControl::Play)
    }

    fn stop(&self) -> Result<(), SinkError> {
        if self.is_closed() {
            return Err(SinkError::Closed);
        }
        self.shared.active.store(false, Ordering::Release);
        self.send(DeviceControl::Pause)
    }

    fn drain(&self) {
        // A stopped stream consumes nothing, so this waits for start or close
        while self.shared.queued() > 0 {
            if self.is_closed() {
                log::debug!("Drain skipped {} queued samples", self.shared.queued());
                return;
            }
            thread::sleep(DRAIN_POLL);
        }
    }

    fn close(&self) {
        if self.shared.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.shared.active.store(false, Ordering::Release);
        // The device thread may already be gone
        let _ = self.send(DeviceControl::Close);
        log::info!("Audio output closed");
    }

    fn is_active(&self) -> bool {
        self.shared.active.load(Ordering::Acquire)
    }

    fn frame_position(&self) -> u64 {
        self.shared.samples_played.load(Ordering::Relaxed) / CHANNELS as u64
    }

    fn buffer_size(&self) -> usize {
        self.capacity * SAMPLE_BYTES
    }

    fn available_bytes(&self) -> usize {
        let queued = usize::try_from(self.shared.queued()).unwrap_or(usize::MAX);
        self.capacity.saturating_sub(queued) * SAMPLE_BYTES
    }
}

impl Drop for CpalSink {
    fn drop(&mut self) {
        self.close();
    }
}

/// Owns the cpal stream for its whole life
fn device_thread(
    sample_rate: u32,
    consumer: ringbuf::HeapCons<i16>,
    shared: Arc<SinkShared>,
    control: Receiver<DeviceControl>,
    ready: Sender<Result<(), SinkError>>,
) {
    let stream = match open_stream(sample_rate, consumer, shared) {
        Ok(stream) => stream,
        Err(e) => {
            let _ = ready.send(Err(e));
            return;
        }
    };

    if ready.send(Ok(())).is_err() {
        return;
    }

    for message in control {
        let result = match message {
            DeviceControl::Play => stream.play().map_err(|e| e.to_string()),
            DeviceControl::Pause => stream.pause().map_err(|e| e.to_string()),
            DeviceControl::Close => break,
        };

        // Pausing is not supported everywhere; the callback is silent while
        // stopped regardless
        if let Err(e) = result {
            log::warn!("Audio stream control failed: {}", e);
        }
    }

    drop(stream);
    log::debug!("Audio device thread exiting");
}

/// Open the default output device as stereo at `sample_rate`
fn open_stream(
    sample_rate: u32,
    consumer: ringbuf::HeapCons<i16>,
    shared: Arc<SinkShared>,
) -> Result<cpal::Stream, SinkError> {
    let host = cpal::default_host();
    let device = host
        .default_output_device()
        .ok_or_else(|| SinkError::DeviceUnavailable("No output device found".to_string()))?;

    let device_name = device.name().unwrap_or_else(|_| "Unknown".to_string());
    log::info!("Using output device: {}", device_name);

    let candidates: Vec<_> = device
        .supported_output_configs()
        .map_err(|e| SinkError::DeviceUnavailable(e.to_string()))?
        .filter(|c| c.channels() as usize == CHANNELS)
        .filter(|c| {
            c.min_sample_rate().0 <= sample_rate && sample_rate <= c.max_sample_rate().0
        })
        .collect();

    // Prefer float output, fall back to 16-bit
    let supported = candidates
        .iter()
        .find(|c| c.sample_format() == cpal::SampleFormat::F32)
        .or_else(|| {
            candidates
                .iter()
                .find(|c| c.sample_format() == cpal::SampleFormat::I16)
        })
        .cloned()
        .ok_or_else(|| {
            SinkError::DeviceUnavailable(format!(
                "{} has no stereo output at {} Hz",
                device_name, sample_rate
            ))
        })?
        .with_sample_rate(cpal::SampleRate(sample_rate));

    log::info!("Audio config: {:?}", supported);

    let format = supported.sample_format();
    let config: cpal::StreamConfig = supported.into();

    match format {
        cpal::SampleFormat::F32 => build_stream::<f32>(&device, &config, consumer, shared),
        cpal::SampleFormat::I16 => build_stream::<i16>(&device, &config, consumer, shared),
        format => Err(SinkError::DeviceUnavailable(format!(
            "Unsupported format: {:?}",
            format
        ))),
    }
}

fn build_stream<T>(
    device: &cpal::Device,
    config: &cpal::StreamConfig,
    mut consumer: ringbuf::HeapCons<i16>,
    shared: Arc<SinkShared>,
) -> Result<cpal::Stream, SinkError>
where
    T: SizedSample + FromSample<f32>,
{
    let channels = config.channels as usize;

    device
        .build_output_stream(
            config,
            move |data: &mut [T], _: &cpal::OutputCallbackInfo| {
                let playing = shared.active.load(Ordering::Acquire);
                let volume = f32::from_bits(shared.volume.load(Ordering::Relaxed));
                let mut played = 0u64;

                for frame in data.chunks_mut(channels) {
                    let (left, right) = match playing.then(|| consumer.try_pop()).flatten() {
                        Some(left) => {
                            played += CHANNELS as u64;
                            (left, consumer.try_pop().unwrap_or(0))
                        }
                        None => (0, 0),
                    };

                    let left = left as f32 / 32768.0 * volume;
                    let right = right as f32 / 32768.0 * volume;

                    frame[0] = T::from_sample(left);
                    if channels >= 2 {
                        frame[1] = T::from_sample(right);
                    }
                    for ch in frame.iter_mut().skip(2) {
                        *ch = T::EQUILIBRIUM;
                    }
                }

                shared.samples_played.fetch_add(played, Ordering::Release);
            },
            |err| log::error!("Audio output error: {}", err),
            None,
        )
        .map_err(|e| SinkError::DeviceUnavailable(e.to_string()))
}
