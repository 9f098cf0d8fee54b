use std::fmt;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::audio::{NoiseColor, Session};

/// Returns the path to the settings file: `~/.config/sfx-noise/settings.json`
pub fn settings_path() -> PathBuf {
    let mut path = dirs::config_dir().unwrap_or_else(|| PathBuf::from("."));
    path.push("sfx-noise");
    path.push("settings.json");
    path
}

/// Startup configuration that cannot be played
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ConfigError {
    #[error(
        "volume {0} is outside 0..=1. Choose a value between 0 and 1 where 1 is loudest and 0 is silence"
    )]
    VolumeOutOfRange(f32),

    #[error("speed {0} must be a positive number (it divides the noise amplitude)")]
    SpeedNotPositive(f64),

    #[error("sample rate must be greater than 0 Hz")]
    ZeroSampleRate,

    #[error("a {seconds}s session at {sample_rate} Hz does not fit in one buffer")]
    SessionTooLong { seconds: i64, sample_rate: u32 },
}

/// Failure while persisting settings
#[derive(Error, Debug)]
pub enum SettingsError {
    #[error("Failed to write settings: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to serialize settings: {0}")]
    Json(#[from] serde_json::Error),
}

/// Noise generator configuration.
///
/// Serialized as JSON to the platform config directory.
/// Fields use `#[serde(default)]` so that partial files still load.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NoiseConfig {
    /// Output sample rate in Hz
    pub sample_rate: u32,
    pub color: NoiseColor,
    /// Seconds to play; negative plays until killed
    pub duration: i64,
    /// Inverse gain multiplier
    pub speed: f64,
    /// Normalized output volume
    pub volume: f32,
    /// Fixed RNG seed for reproducible output
    pub seed: Option<u64>,
}

impl Default for NoiseConfig {
    fn default() -> Self {
        Self {
            sample_rate: 44100,
            color: NoiseColor::White,
            duration: -1,
            speed: 0.4,
            volume: 0.4,
            seed: None,
        }
    }
}

/// Whether `volume` is a valid normalized volume
pub fn volume_in_range(volume: f32) -> bool {
    (0.0..=1.0).contains(&volume)
}

impl NoiseConfig {
    pub fn session(&self) -> Session {
        Session::from_duration(self.duration)
    }

    /// Check the values that make playback impossible.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !volume_in_range(self.volume) {
            return Err(ConfigError::VolumeOutOfRange(self.volume));
        }

        if !(self.speed > 0.0 && self.speed.is_finite()) {
            return Err(ConfigError::SpeedNotPositive(self.speed));
        }

        if self.sample_rate == 0 {
            return Err(ConfigError::ZeroSampleRate);
        }

        if self.session().buffer_bytes(self.sample_rate).is_none() {
            return Err(ConfigError::SessionTooLong {
                seconds: self.duration,
                sample_rate: self.sample_rate,
            });
        }

        Ok(())
    }

    /// Load settings from disk, falling back to defaults on any error.
    pub fn load(path: &Path) -> Self {
        match std::fs::read_to_string(path) {
            Ok(contents) => match serde_json::from_str(&contents) {
                Ok(settings) => {
                    log::info!("Loaded settings from {}", path.display());
                    settings
                }
                Err(e) => {
                    log::warn!("Failed to parse settings ({}), using defaults", e);
                    Self::default()
                }
            },
            Err(e) => {
                log::info!("No settings file found ({}), using defaults", e);
                Self::default()
            }
        }
    }

    /// Save settings to disk as pretty JSON.
    pub fn save(&self, path: &Path) -> Result<(), SettingsError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(path, json)?;
        log::info!("Saved settings to {}", path.display());
        Ok(())
    }
}

impl fmt::Display for NoiseConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "SAMPLERATE = {} [Hz] (0-INF)", self.sample_rate)?;
        writeln!(f, "DURATION   = {} [s] (-INF-INF)", self.duration)?;
        writeln!(f, "SPEED      = {:.6} [x] (0-1)", self.speed)?;
        writeln!(f, "VOLUME     = {:.6} (0-1)", self.volume)?;
        write!(f, "NOISE      = {}", self.color.name())?;
        if let Some(seed) = self.seed {
            write!(f, "\nSEED       = {}", seed)?;
        }
        Ok(())
    }
}
