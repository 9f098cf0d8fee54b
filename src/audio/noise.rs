//! Noise synthesis
//!
//! Fills byte buffers with 16-bit signed, big-endian, interleaved stereo noise.
//! Left and right channels are drawn independently.

use byteorder::{BigEndian, ByteOrder};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rand_distr::StandardNormal;
use serde::{Deserialize, Serialize};

use super::buffer::{FRAME_BYTES, SAMPLE_BYTES};

/// Statistical character of the generated signal
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum NoiseColor {
    /// Independent gaussian samples (flat spectrum)
    #[default]
    White,
    /// Integrated uniform increments (random walk)
    Brown,
}

impl NoiseColor {
    pub fn name(&self) -> &'static str {
        match self {
            Self::White => "WHITE",
            Self::Brown => "BROWN",
        }
    }
}

/// Running per-channel sums for brown noise.
///
/// Lives for one streaming session and is never clamped or leaked, so the
/// walk drifts without bound.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct BrownAccumulator {
    pub left: f64,
    pub right: f64,
}

/// Noise generator for a single streaming session
pub struct NoiseSynth {
    color: NoiseColor,
    /// `1 / speed`
    gain: f64,
    rng: StdRng,
    accumulator: BrownAccumulator,
}

impl NoiseSynth {
    /// Create a generator. A `seed` makes the output reproducible.
    pub fn new(color: NoiseColor, speed: f64, seed: Option<u64>) -> Self {
        let rng = match seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_os_rng(),
        };

        Self {
            color,
            gain: 1.0 / speed,
            rng,
            accumulator: BrownAccumulator::default(),
        }
    }

    /// Fill every whole stereo frame that fits in `buffer`.
    ///
    /// Returns the number of 16-bit samples written.
    pub fn fill(&mut self, buffer: &mut [u8]) -> usize {
        match self.color {
            NoiseColor::White => fill_white(buffer, self.gain, &mut self.rng),
            NoiseColor::Brown => {
                fill_brown(buffer, self.gain, &mut self.rng, &mut self.accumulator)
            }
        }
    }
}

/// Gaussian white noise scaled by `gain` times full scale.
pub fn fill_white<R: Rng + ?Sized>(buffer: &mut [u8], gain: f64, rng: &mut R) -> usize {
    let mut written = 0;

    for frame in buffer.chunks_exact_mut(FRAME_BYTES) {
        let left: f64 = rng.sample(StandardNormal);
        let right: f64 = rng.sample(StandardNormal);

        BigEndian::write_i16(&mut frame[..SAMPLE_BYTES], to_sample(gain * left));
        BigEndian::write_i16(&mut frame[SAMPLE_BYTES..], to_sample(gain * right));
        written += 2;
    }

    written
}

/// Brown noise: each channel adds a uniform step in `[-gain, gain]` to its
/// accumulator and emits the accumulator at full scale.
pub fn fill_brown<R: Rng + ?Sized>(
    buffer: &mut [u8],
    gain: f64,
    rng: &mut R,
    accumulator: &mut BrownAccumulator,
) -> usize {
    let mut written = 0;

    for frame in buffer.chunks_exact_mut(FRAME_BYTES) {
        accumulator.left += gain * rng.random_range(-1.0..=1.0);
        accumulator.right += gain * rng.random_range(-1.0..=1.0);

        BigEndian::write_i16(&mut frame[..SAMPLE_BYTES], to_sample(accumulator.left));
        BigEndian::write_i16(&mut frame[SAMPLE_BYTES..], to_sample(accumulator.right));
        written += 2;
    }

    written
}

/// Convert a unit-scale value to a 16-bit sample.
///
/// Out-of-range values wrap rather than saturate: the scaled value is
/// truncated to 32 bits, then narrowed to 16.
#[inline]
pub fn to_sample(value: f64) -> i16 {
    ((value * i16::MAX as f64) as i32) as i16
}
