//! In-memory sink for tests
//!
//! Behaves like a paused/playing device line: writes block while stopped and
//! fail once closed.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::thread;
use std::time::Duration;

use super::buffer::{FRAME_BYTES, STREAM_CHUNK_BYTES};
use super::lock;
use super::sink::{AudioBackend, AudioSink, SinkError};
use crate::settings::NoiseConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SinkEvent {
    Start,
    Stop,
    Write(usize),
    Drain,
    Close,
}

#[derive(Debug, Default)]
pub struct MemoryState {
    pub active: bool,
    pub closed: bool,
    pub volume: f32,
    pub bytes_written: usize,
    pub events: Vec<SinkEvent>,
}

impl MemoryState {
    pub fn writes(&self) -> Vec<usize> {
        self.events
            .iter()
            .filter_map(|e| match e {
                SinkEvent::Write(len) => Some(*len),
                _ => None,
            })
            .collect()
    }

    /// Events other than writes, in order
    pub fn lifecycle(&self) -> Vec<SinkEvent> {
        self.events
            .iter()
            .copied()
            .filter(|e| !matches!(e, SinkEvent::Write(_)))
            .collect()
    }
}

pub struct MemorySink {
    state: Mutex<MemoryState>,
    changed: Condvar,
    /// How long each accepted write takes
    write_delay: Duration,
}

impl MemorySink {
    pub fn new(write_delay: Duration) -> Self {
        Self {
            state: Mutex::new(MemoryState::default()),
            changed: Condvar::new(),
            write_delay,
        }
    }

    /// Block until the sink is playing or closed
    fn wait_until_released(&self) -> MutexGuard<'_, MemoryState> {
        let mut state = lock(&self.state);
        while !state.active && !state.closed {
            state = self
                .changed
                .wait(state)
                .unwrap_or_else(|e| e.into_inner());
        }
        state
    }

    pub fn snapshot<R>(&self, f: impl FnOnce(&MemoryState) -> R) -> R {
        f(&lock(&self.state))
    }

    /// Block until at least `count` writes happened
    pub fn wait_for_writes(&self, count: usize) {
        let mut state = lock(&self.state);
        while state.writes().len() < count && !state.closed {
            state = self
                .changed
                .wait_timeout(state, Duration::from_millis(10))
                .map(|(guard, _)| guard)
                .unwrap_or_else(|e| e.into_inner().0);
        }
    }
}

impl AudioSink for MemorySink {
    fn set_volume(&self, volume: f32) {
        lock(&self.state).volume = volume;
    }

    fn write(&self, bytes: &[u8]) -> Result<(), SinkError> {
        {
            let mut state = self.wait_until_released();
            if state.closed {
                return Err(SinkError::Closed);
            }
            state.bytes_written += bytes.len();
            state.events.push(SinkEvent::Write(bytes.len()));
        }
        self.changed.notify_all();

        // Pretend the device takes a moment
        thread::sleep(self.write_delay);
        Ok(())
    }

    fn start(&self) -> Result<(), SinkError> {
        let mut state = lock(&self.state);
        if state.closed {
            return Err(SinkError::Closed);
        }
        state.active = true;
        state.events.push(SinkEvent::Start);
        self.changed.notify_all();
        Ok(())
    }

    fn stop(&self) -> Result<(), SinkError> {
        let mut state = lock(&self.state);
        if state.closed {
            return Err(SinkError::Closed);
        }
        state.active = false;
        state.events.push(SinkEvent::Stop);
        Ok(())
    }

    fn drain(&self) {
        // Nothing is queued once a write returns, but a paused line still
        // holds the drain until it is started or closed
        let mut state = self.wait_until_released();
        if !state.closed {
            state.events.push(SinkEvent::Drain);
        }
    }

    fn close(&self) {
        let mut state = lock(&self.state);
        state.closed = true;
        state.active = false;
        state.events.push(SinkEvent::Close);
        self.changed.notify_all();
    }

    fn is_active(&self) -> bool {
        lock(&self.state).active
    }

    fn frame_position(&self) -> u64 {
        (lock(&self.state).bytes_written / FRAME_BYTES) as u64
    }

    fn buffer_size(&self) -> usize {
        STREAM_CHUNK_BYTES * 4
    }

    fn available_bytes(&self) -> usize {
        self.buffer_size()
    }
}

/// Backend handing out [`MemorySink`]s
pub struct MemoryBackend {
    sinks: Mutex<Vec<Arc<MemorySink>>>,
    unavailable: AtomicBool,
    write_delay: Duration,
}

impl Default for MemoryBackend {
    fn default() -> Self {
        Self::with_write_delay(Duration::from_millis(1))
    }
}

impl MemoryBackend {
    /// Backend whose sinks take `write_delay` per accepted write
    pub fn with_write_delay(write_delay: Duration) -> Self {
        Self {
            sinks: Mutex::new(Vec::new()),
            unavailable: AtomicBool::new(false),
            write_delay,
        }
    }

    /// Make every following `open` fail
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::Relaxed);
    }

    pub fn opened(&self) -> usize {
        lock(&self.sinks).len()
    }

    pub fn sink(&self, index: usize) -> Arc<MemorySink> {
        Arc::clone(&lock(&self.sinks)[index])
    }

    pub fn last(&self) -> Arc<MemorySink> {
        let sinks = lock(&self.sinks);
        Arc::clone(sinks.last().expect("no sink opened"))
    }
}

impl AudioBackend for MemoryBackend {
    fn open(&self, config: &NoiseConfig) -> Result<Arc<dyn AudioSink>, SinkError> {
        if self.unavailable.load(Ordering::Relaxed) {
            return Err(SinkError::DeviceUnavailable(
                "memory device disabled".to_string(),
            ));
        }

        let sink = Arc::new(MemorySink::new(self.write_delay));
        sink.set_volume(config.volume);
        lock(&self.sinks).push(Arc::clone(&sink));
        Ok(sink)
    }
}
