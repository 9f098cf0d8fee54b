//! PCM sample buffers
//!
//! Samples travel between the synthesizer and the sink as raw bytes:
//! 16-bit signed, big-endian, interleaved stereo (L R L R ...).
//!
//! How much is synthesized per write depends on the session:
//! - a bounded session fills one buffer covering the whole duration
//! - an unbounded session reuses a small window forever

use std::fmt;

use byteorder::{BigEndian, ByteOrder};

/// Interleaved channels
pub const CHANNELS: usize = 2;

/// Bytes per 16-bit sample
pub const SAMPLE_BYTES: usize = 2;

/// Bytes per stereo frame
pub const FRAME_BYTES: usize = CHANNELS * SAMPLE_BYTES;

/// Window size for unbounded sessions
pub const STREAM_CHUNK_BYTES: usize = 4096;

/// How long a streaming session runs
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Session {
    /// Play one precomputed buffer, then drain and close
    Bounded { seconds: u64 },
    /// Loop until the pipeline is killed or replaced
    Unbounded,
}

impl Session {
    /// Negative durations play forever.
    pub fn from_duration(duration: i64) -> Self {
        if duration < 0 {
            Session::Unbounded
        } else {
            Session::Bounded {
                seconds: duration as u64,
            }
        }
    }

    /// Size of the buffer this session writes per iteration.
    ///
    /// Returns `None` if a bounded session would not fit in memory.
    pub fn buffer_bytes(&self, sample_rate: u32) -> Option<usize> {
        match self {
            Session::Bounded { seconds } => (sample_rate as u64)
                .checked_mul(*seconds)?
                .checked_mul(FRAME_BYTES as u64)
                .and_then(|bytes| usize::try_from(bytes).ok())
                .filter(|&bytes| bytes <= isize::MAX as usize),
            Session::Unbounded => Some(STREAM_CHUNK_BYTES),
        }
    }
}

impl fmt::Display for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Session::Bounded { seconds } => write!(f, "{}s", seconds),
            Session::Unbounded => write!(f, "INF"),
        }
    }
}

/// Fixed-capacity byte region owned by the streaming worker
pub struct SampleBuffer {
    bytes: Vec<u8>,
}

impl SampleBuffer {
    pub fn new(len: usize) -> Self {
        Self {
            bytes: vec![0; len],
        }
    }

    /// Zero the buffer before the next fill
    pub fn clear(&mut self) {
        self.bytes.fill(0);
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.bytes
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        &mut self.bytes
    }
}

/// Decode big-endian 16-bit samples. A trailing odd byte is ignored.
pub fn read_samples(bytes: &[u8]) -> impl Iterator<Item = i16> + '_ {
    bytes.chunks_exact(SAMPLE_BYTES).map(BigEndian::read_i16)
}
