//! Playback pipeline
//!
//! Owns the output sink and the streaming worker that feeds it:
//!
//! ```text
//! NoiseSynth -> SampleBuffer -> AudioSink
//! ```
//!
//! The command loop drives the lifecycle (`validate`, `start`, `stop`,
//! `kill`) while the worker loops on its own thread. Both share one mutex.
//!
//! Every `validate` or `kill` bumps a generation counter. A worker remembers
//! the generation it was spawned with and exits as soon as it sees a newer
//! one, so a retired worker never keeps writing to a replaced sink. Closing
//! the old sink unblocks a worker stuck in `write`.

use std::fmt;
use std::io;
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::{self, JoinHandle};

use thiserror::Error;

use crate::audio::{self, AudioBackend, AudioSink, NoiseSynth, SampleBuffer, Session, SinkError};
use crate::settings::{volume_in_range, ConfigError, NoiseConfig};

/// Lifecycle of the pipeline
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PipelineState {
    #[default]
    Uninitialized,
    /// Sink open with no worker feeding it (after `halt_worker`)
    Ready,
    Playing,
    Stopped,
    /// Sink released; `validate` is required to play again
    Killed,
}

impl PipelineState {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Uninitialized => "UNINITIALIZED",
            Self::Ready => "READY",
            Self::Playing => "PLAYING",
            Self::Stopped => "STOPPED",
            Self::Killed => "KILLED",
        }
    }
}

/// Errors from pipeline control operations
#[derive(Error, Debug)]
pub enum PipelineError {
    #[error(transparent)]
    Sink(#[from] SinkError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("Volume must be a value between 0 and 1 (got {0})")]
    VolumeOutOfRange(f32),

    #[error("Failed to spawn the streaming worker: {0}")]
    Worker(#[from] io::Error),
}

/// Read-only view of the open sink
#[derive(Debug, Clone, PartialEq)]
pub struct SinkStatus {
    pub active: bool,
    pub frame_position: u64,
    pub buffer_size: usize,
    pub available_bytes: usize,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PipelineStatus {
    pub state: PipelineState,
    pub sample_rate: u32,
    pub sink: Option<SinkStatus>,
}

impl fmt::Display for PipelineStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "State: {}", self.state.name())?;
        match &self.sink {
            Some(sink) => {
                writeln!(f)?;
                writeln!(f, "Active: {}", if sink.active { "YES" } else { "NO" })?;
                writeln!(f, "Pipeline frame pos.: {}", sink.frame_position)?;
                writeln!(f, "Buffer size: {}", sink.buffer_size)?;
                writeln!(f, "Bytes reachable: {}", sink.available_bytes)?;
                write!(f, "Audio Framerate: {}", self.sample_rate)
            }
            None => write!(f, "\nNo open audio pipeline"),
        }
    }
}

/// State shared between the command loop and the streaming worker
struct Shared {
    config: NoiseConfig,
    state: PipelineState,
    sink: Option<Arc<dyn AudioSink>>,
    generation: u64,
    worker: Option<JoinHandle<()>>,
}

/// Cloneable handle to one playback pipeline
#[derive(Clone)]
pub struct Pipeline {
    backend: Arc<dyn AudioBackend>,
    shared: Arc<Mutex<Shared>>,
}

impl Pipeline {
    /// Create an idle pipeline. Nothing is opened until [`Pipeline::validate`].
    pub fn new(config: NoiseConfig, backend: Arc<dyn AudioBackend>) -> Self {
        Self {
            backend,
            shared: Arc::new(Mutex::new(Shared {
                config,
                state: PipelineState::Uninitialized,
                sink: None,
                generation: 0,
                worker: None,
            })),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Shared> {
        audio::lock(&self.shared)
    }

    pub fn config(&self) -> NoiseConfig {
        self.lock().config.clone()
    }

    pub fn state(&self) -> PipelineState {
        self.lock().state
    }

    /// (Re)open the sink with the current configuration and start streaming.
    ///
    /// A previously open sink is stopped and closed, and its worker retired.
    /// If the new sink cannot be opened the pipeline is left as it was.
    pub fn validate(&self) -> Result<(), PipelineError> {
        let retired = {
            let mut shared = self.lock();
            let config = shared.config.clone();
            let session = config.session();
            let buffer_bytes =
                session
                    .buffer_bytes(config.sample_rate)
                    .ok_or(ConfigError::SessionTooLong {
                        seconds: config.duration,
                        sample_rate: config.sample_rate,
                    })?;

            let sink = self.backend.open(&config)?;
            sink.set_volume(config.volume);
            if let Err(e) = sink.start() {
                sink.close();
                return Err(e.into());
            }

            if let Some(old) = shared.sink.take() {
                log::info!("Replacing the open audio pipeline");
                if let Err(e) = old.stop() {
                    log::debug!("Old sink did not stop cleanly: {}", e);
                }
                old.close();
            }

            shared.generation += 1;

            let worker = StreamWorker {
                shared: Arc::clone(&self.shared),
                sink: Arc::clone(&sink),
                synth: NoiseSynth::new(config.color, config.speed, config.seed),
                generation: shared.generation,
            };
            let handle = match worker.spawn(session, buffer_bytes) {
                Ok(handle) => handle,
                Err(e) => {
                    sink.close();
                    shared.state = PipelineState::Uninitialized;
                    return Err(e.into());
                }
            };

            shared.sink = Some(sink);
            shared.state = PipelineState::Playing;
            log::info!(
                "Pipeline validated: {} noise at {} Hz for {}",
                config.color.name(),
                config.sample_rate,
                session
            );

            shared.worker.replace(handle)
        };

        join(retired);
        Ok(())
    }

    /// Resume device output. Returns `false` if no sink is open.
    pub fn start(&self) -> Result<bool, PipelineError> {
        let mut shared = self.lock();
        let Some(sink) = shared.sink.clone() else {
            return Ok(false);
        };

        sink.start()?;
        shared.state = PipelineState::Playing;
        log::info!("Pipeline resumed playback");
        Ok(true)
    }

    /// Pause device output. The worker keeps running and blocks on the next write.
    pub fn stop(&self) -> Result<bool, PipelineError> {
        let mut shared = self.lock();
        let Some(sink) = shared.sink.clone() else {
            return Ok(false);
        };

        sink.stop()?;
        shared.state = PipelineState::Stopped;
        log::info!("Pipeline stopped playback");
        Ok(true)
    }

    /// Stop, drain and close the sink. Returns `false` if it was already gone.
    pub fn kill(&self) -> bool {
        let retired = {
            let mut shared = self.lock();
            let Some(sink) = shared.sink.take() else {
                return false;
            };

            shared.generation += 1;
            // A paused sink would hold the drain until it is closed
            if sink.is_active() {
                sink.drain();
            }
            if let Err(e) = sink.stop() {
                log::debug!("Sink did not stop cleanly: {}", e);
            }
            sink.close();
            shared.state = PipelineState::Killed;
            log::info!("Pipeline killed");

            shared.worker.take()
        };

        join(retired);
        true
    }

    /// Set the volume, applied to the open sink right away.
    pub fn set_volume(&self, volume: f32) -> Result<(), PipelineError> {
        if !volume_in_range(volume) {
            return Err(PipelineError::VolumeOutOfRange(volume));
        }

        let mut shared = self.lock();
        shared.config.volume = volume;
        if let Some(sink) = &shared.sink {
            sink.set_volume(volume);
        }
        log::debug!("Volume set to {}", volume);
        Ok(())
    }

    pub fn status(&self) -> PipelineStatus {
        let shared = self.lock();
        PipelineStatus {
            state: shared.state,
            sample_rate: shared.config.sample_rate,
            sink: shared.sink.as_ref().map(|sink| SinkStatus {
                active: sink.is_active(),
                frame_position: sink.frame_position(),
                buffer_size: sink.buffer_size(),
                available_bytes: sink.available_bytes(),
            }),
        }
    }

    pub fn worker_running(&self) -> bool {
        self.lock()
            .worker
            .as_ref()
            .is_some_and(|handle| !handle.is_finished())
    }

    /// Retire the streaming worker but leave the sink open.
    ///
    /// The worker exits after its current write returns, so a stopped sink
    /// keeps it parked until playback resumes. The pipeline drops to `Ready`:
    /// the device stays open and plays silence, including when a one-shot
    /// session is cut short, until the next `validate` or `kill`.
    pub fn halt_worker(&self) -> bool {
        let mut shared = self.lock();
        let running = shared
            .worker
            .as_ref()
            .is_some_and(|handle| !handle.is_finished());
        if !running {
            return false;
        }

        shared.generation += 1;
        shared.worker = None;
        if shared.sink.is_some() {
            shared.state = PipelineState::Ready;
        }
        log::info!("Streaming worker halted");
        true
    }

    /// Block until the current worker finishes
    pub fn wait(&self) {
        let handle = self.lock().worker.take();
        join(handle);
    }
}

fn join(handle: Option<JoinHandle<()>>) {
    if let Some(handle) = handle {
        if handle.join().is_err() {
            log::error!("Streaming worker panicked");
        }
    }
}

/// Producer side of one streaming session
struct StreamWorker {
    shared: Arc<Mutex<Shared>>,
    sink: Arc<dyn AudioSink>,
    synth: NoiseSynth,
    generation: u64,
}

impl StreamWorker {
    fn spawn(self, session: Session, buffer_bytes: usize) -> io::Result<JoinHandle<()>> {
        thread::Builder::new()
            .name("noise-stream".to_string())
            .spawn(move || {
                log::info!("Playing for: {}", session);
                let result = match session {
                    Session::Bounded { .. } => self.run_bounded(buffer_bytes),
                    Session::Unbounded => self.run_unbounded(buffer_bytes),
                };
                if let Err(e) = result {
                    log::error!("Noise stream stopped: {}", e);
                }
            })
    }

    fn superseded(&self) -> bool {
        audio::lock(&self.shared).generation != self.generation
    }

    /// A failed write is expected once this worker has been retired
    fn settle(&self, error: SinkError) -> Result<(), SinkError> {
        if self.superseded() {
            log::debug!("Retired streaming worker exiting ({})", error);
            Ok(())
        } else {
            Err(error)
        }
    }

    /// One buffer covering the whole duration, then drain, stop and close
    fn run_bounded(mut self, buffer_bytes: usize) -> Result<(), SinkError> {
        let mut buffer = SampleBuffer::new(buffer_bytes);
        self.synth.fill(buffer.as_mut_slice());

        if let Err(e) = self.sink.write(buffer.as_slice()) {
            return self.settle(e);
        }

        self.sink.drain();

        let mut shared = audio::lock(&self.shared);
        if shared.generation != self.generation {
            return Ok(());
        }

        if let Err(e) = self.sink.stop() {
            log::debug!("Sink did not stop cleanly: {}", e);
        }
        self.sink.close();
        shared.sink = None;
        shared.state = PipelineState::Killed;
        log::info!("One-shot session finished");
        Ok(())
    }

    /// Refill and write the same window until retired
    fn run_unbounded(mut self, buffer_bytes: usize) -> Result<(), SinkError> {
        let mut buffer = SampleBuffer::new(buffer_bytes);

        loop {
            if self.superseded() {
                log::debug!("Streaming worker retired");
                return Ok(());
            }

            buffer.clear();
            self.synth.fill(buffer.as_mut_slice());

            if let Err(e) = self.sink.write(buffer.as_slice()) {
                return self.settle(e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::memory::{MemoryBackend, SinkEvent};
    use crate::audio::buffer::STREAM_CHUNK_BYTES;
    use crate::audio::NoiseColor;

    fn pipeline(config: NoiseConfig) -> (Pipeline, Arc<MemoryBackend>) {
        let backend = Arc::new(MemoryBackend::default());
        let pipeline = Pipeline::new(config, backend.clone());
        (pipeline, backend)
    }

    fn streaming() -> NoiseConfig {
        NoiseConfig {
            seed: Some(1),
            ..Default::default()
        }
    }

    #[test]
    fn test_new_pipeline_is_uninitialized() {
        let (pipeline, backend) = pipeline(streaming());

        assert_eq!(pipeline.state(), PipelineState::Uninitialized);
        assert_eq!(pipeline.status().sink, None);
        assert_eq!(backend.opened(), 0);
    }

    #[test]
    fn test_validate_starts_playing() {
        let (pipeline, backend) = pipeline(streaming());
        pipeline.validate().unwrap();

        assert_eq!(pipeline.state(), PipelineState::Playing);
        let status = pipeline.status();
        assert!(status.sink.unwrap().active);

        let sink = backend.last();
        sink.wait_for_writes(3);
        assert!(sink.snapshot(|s| s.writes().iter().all(|&w| w == STREAM_CHUNK_BYTES)));
        assert_eq!(sink.snapshot(|s| s.volume), 0.4);

        pipeline.kill();
    }

    #[test]
    fn test_one_shot_session() {
        let config = NoiseConfig {
            duration: 2,
            sample_rate: 44100,
            color: NoiseColor::Brown,
            seed: Some(2),
            ..Default::default()
        };
        let (pipeline, backend) = pipeline(config);

        pipeline.validate().unwrap();
        pipeline.wait();

        let sink = backend.last();
        assert_eq!(sink.snapshot(|s| s.writes()), vec![44100 * 2 * 2 * 2]);
        assert_eq!(
            sink.snapshot(|s| s.lifecycle()),
            vec![
                SinkEvent::Start,
                SinkEvent::Drain,
                SinkEvent::Stop,
                SinkEvent::Close
            ]
        );
        assert_eq!(pipeline.state(), PipelineState::Killed);
        assert_eq!(pipeline.status().sink, None);
    }

    #[test]
    fn test_stop_gates_writes_and_start_resumes() {
        let (pipeline, backend) = pipeline(streaming());
        pipeline.validate().unwrap();
        let sink = backend.last();
        sink.wait_for_writes(1);

        assert!(pipeline.stop().unwrap());
        assert_eq!(pipeline.state(), PipelineState::Stopped);
        assert!(!pipeline.status().sink.unwrap().active);

        // At most one write was already in flight
        let paused_at = sink.snapshot(|s| s.writes().len());
        thread::sleep(std::time::Duration::from_millis(30));
        assert!(sink.snapshot(|s| s.writes().len()) <= paused_at + 1);

        assert!(pipeline.start().unwrap());
        assert_eq!(pipeline.state(), PipelineState::Playing);
        sink.wait_for_writes(paused_at + 3);
        assert!(sink.snapshot(|s| s.writes().len()) >= paused_at + 3);

        pipeline.kill();
    }

    #[test]
    fn test_start_and_stop_without_sink_are_noops() {
        let (pipeline, _backend) = pipeline(streaming());

        assert!(!pipeline.start().unwrap());
        assert!(!pipeline.stop().unwrap());
        assert_eq!(pipeline.state(), PipelineState::Uninitialized);
    }

    #[test]
    fn test_kill_twice_is_safe() {
        let (pipeline, backend) = pipeline(streaming());
        pipeline.validate().unwrap();
        backend.last().wait_for_writes(1);

        assert!(pipeline.kill());
        assert!(!pipeline.kill());
        assert_eq!(pipeline.state(), PipelineState::Killed);

        let sink = backend.last();
        assert!(sink.snapshot(|s| s.closed));
        let lifecycle = sink.snapshot(|s| s.lifecycle());
        assert_eq!(
            &lifecycle[lifecycle.len() - 3..],
            &[SinkEvent::Drain, SinkEvent::Stop, SinkEvent::Close]
        );
        assert!(!pipeline.worker_running());
    }

    #[test]
    fn test_validate_after_kill_reopens() {
        let (pipeline, backend) = pipeline(streaming());
        pipeline.validate().unwrap();
        pipeline.kill();

        pipeline.validate().unwrap();
        assert_eq!(pipeline.state(), PipelineState::Playing);
        assert_eq!(backend.opened(), 2);
        backend.last().wait_for_writes(1);

        pipeline.kill();
    }

    #[test]
    fn test_revalidate_replaces_sink() {
        let (pipeline, backend) = pipeline(streaming());
        pipeline.validate().unwrap();
        backend.sink(0).wait_for_writes(2);

        pipeline.validate().unwrap();
        let old = backend.sink(0);
        let new = backend.sink(1);

        assert!(old.snapshot(|s| s.closed));
        let frozen = old.snapshot(|s| s.writes().len());
        new.wait_for_writes(3);
        assert_eq!(old.snapshot(|s| s.writes().len()), frozen);
        assert_eq!(pipeline.state(), PipelineState::Playing);

        pipeline.kill();
    }

    #[test]
    fn test_revalidate_while_stopped_retires_blocked_worker() {
        let (pipeline, backend) = pipeline(streaming());
        pipeline.validate().unwrap();
        backend.sink(0).wait_for_writes(1);
        pipeline.stop().unwrap();

        // The old worker is parked in write; closing must release it
        pipeline.validate().unwrap();
        assert!(backend.sink(0).snapshot(|s| s.closed));
        backend.sink(1).wait_for_writes(1);

        pipeline.kill();
    }

    #[test]
    fn test_device_unavailable_keeps_previous_state() {
        let (pipeline, backend) = pipeline(streaming());
        pipeline.validate().unwrap();
        backend.set_unavailable(true);

        let err = pipeline.validate().unwrap_err();
        assert!(matches!(
            err,
            PipelineError::Sink(SinkError::DeviceUnavailable(_))
        ));
        assert_eq!(pipeline.state(), PipelineState::Playing);
        assert!(!backend.last().snapshot(|s| s.closed));

        pipeline.kill();
    }

    #[test]
    fn test_device_unavailable_at_first_validate() {
        let (pipeline, backend) = pipeline(streaming());
        backend.set_unavailable(true);

        assert!(pipeline.validate().is_err());
        assert_eq!(pipeline.state(), PipelineState::Uninitialized);

        backend.set_unavailable(false);
        pipeline.validate().unwrap();
        assert_eq!(pipeline.state(), PipelineState::Playing);
        pipeline.kill();
    }

    #[test]
    fn test_set_volume_out_of_range_is_rejected() {
        let (pipeline, backend) = pipeline(streaming());
        pipeline.validate().unwrap();
        pipeline.set_volume(0.7).unwrap();

        for volume in [-0.5, 1.5, f32::NAN] {
            assert!(matches!(
                pipeline.set_volume(volume),
                Err(PipelineError::VolumeOutOfRange(_))
            ));
        }

        assert_eq!(pipeline.config().volume, 0.7);
        assert_eq!(backend.last().snapshot(|s| s.volume), 0.7);
        pipeline.kill();
    }

    #[test]
    fn test_set_volume_applies_while_stopped() {
        let (pipeline, backend) = pipeline(streaming());
        pipeline.validate().unwrap();
        pipeline.stop().unwrap();

        pipeline.set_volume(0.1).unwrap();
        assert_eq!(backend.last().snapshot(|s| s.volume), 0.1);
        pipeline.kill();
    }

    #[test]
    fn test_volume_survives_revalidate() {
        let (pipeline, backend) = pipeline(streaming());
        pipeline.set_volume(0.9).unwrap();
        pipeline.validate().unwrap();

        assert_eq!(backend.last().snapshot(|s| s.volume), 0.9);
        pipeline.kill();
    }

    #[test]
    fn test_halt_worker_keeps_sink_open() {
        let (pipeline, backend) = pipeline(streaming());
        pipeline.validate().unwrap();
        backend.last().wait_for_writes(1);

        assert!(pipeline.worker_running());
        assert!(pipeline.halt_worker());
        assert!(!pipeline.halt_worker());
        assert!(!pipeline.worker_running());
        assert!(!backend.last().snapshot(|s| s.closed));
        assert_eq!(pipeline.state(), PipelineState::Ready);
        assert!(pipeline.status().sink.is_some());

        pipeline.kill();
    }

    fn one_shot(seconds: i64) -> NoiseConfig {
        NoiseConfig {
            duration: seconds,
            sample_rate: 8000,
            seed: Some(4),
            ..Default::default()
        }
    }

    fn slow_pipeline(config: NoiseConfig) -> (Pipeline, Arc<MemoryBackend>) {
        let backend = Arc::new(MemoryBackend::with_write_delay(
            std::time::Duration::from_millis(50),
        ));
        let pipeline = Pipeline::new(config, backend.clone());
        (pipeline, backend)
    }

    #[test]
    fn test_stop_during_one_shot_holds_the_drain() {
        let (pipeline, backend) = slow_pipeline(one_shot(1));
        pipeline.validate().unwrap();

        // The single write is accepted; stop before the worker reaches drain
        let sink = backend.last();
        sink.wait_for_writes(1);
        pipeline.stop().unwrap();

        thread::sleep(std::time::Duration::from_millis(100));
        assert_eq!(pipeline.state(), PipelineState::Stopped);
        assert!(!sink.snapshot(|s| s.closed));
        assert!(!sink.snapshot(|s| s.lifecycle()).contains(&SinkEvent::Drain));

        assert!(pipeline.start().unwrap());
        pipeline.wait();

        assert_eq!(pipeline.state(), PipelineState::Killed);
        assert!(sink.snapshot(|s| s.closed));
        assert!(sink.snapshot(|s| s.lifecycle()).contains(&SinkEvent::Drain));
    }

    #[test]
    fn test_kill_releases_a_paused_drain() {
        let (pipeline, backend) = slow_pipeline(one_shot(1));
        pipeline.validate().unwrap();

        let sink = backend.last();
        sink.wait_for_writes(1);
        pipeline.stop().unwrap();

        assert!(pipeline.kill());
        assert!(!pipeline.worker_running());
        assert_eq!(pipeline.state(), PipelineState::Killed);
        assert_eq!(
            sink.snapshot(|s| s.lifecycle()),
            vec![
                SinkEvent::Start,
                SinkEvent::Stop,
                SinkEvent::Stop,
                SinkEvent::Close
            ]
        );
    }

    #[test]
    fn test_halt_worker_during_one_shot_leaves_idle_sink() {
        let (pipeline, backend) = slow_pipeline(one_shot(1));
        pipeline.validate().unwrap();
        let sink = backend.last();
        sink.wait_for_writes(1);

        assert!(pipeline.halt_worker());
        thread::sleep(std::time::Duration::from_millis(100));

        // The retired worker drained but left closing to the pipeline
        assert_eq!(pipeline.state(), PipelineState::Ready);
        assert!(!sink.snapshot(|s| s.closed));
        assert!(pipeline.status().sink.unwrap().active);

        assert!(pipeline.kill());
        assert!(sink.snapshot(|s| s.closed));
    }

    #[test]
    fn test_status_display() {
        let status = PipelineStatus {
            state: PipelineState::Playing,
            sample_rate: 44100,
            sink: Some(SinkStatus {
                active: true,
                frame_position: 10,
                buffer_size: 4096,
                available_bytes: 1024,
            }),
        };

        let text = status.to_string();
        assert!(text.contains("State: PLAYING"));
        assert!(text.contains("Active: YES"));
        assert!(text.contains("Bytes reachable: 1024"));
    }
}
