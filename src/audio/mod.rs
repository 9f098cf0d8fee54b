//! Audio module - noise synthesis and device output
//!
//! This module provides:
//! - White and brown noise synthesis into PCM byte buffers
//! - Buffer framing and session sizing
//! - The output sink contract and its cpal implementation

use std::sync::{Mutex, MutexGuard, PoisonError};

pub mod buffer;
#[cfg(test)]
pub mod memory;
mod noise;
mod sink;

pub use buffer::{SampleBuffer, Session};
pub use noise::{NoiseColor, NoiseSynth};
pub use sink::{AudioBackend, AudioSink, CpalBackend, SinkError};

/// Lock a mutex, recovering the data if another thread panicked while holding it
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
