use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::{Result, VisualiserError};

/// Allowed export lengths, in seconds.
pub const MIN_DURATION_SECS: u32 = 5;
pub const MAX_DURATION_SECS: u32 = 30;
pub const DURATION_STEP_SECS: u32 = 5;

/// Top-level configuration structure for the application.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub audio: AudioConfig,
    pub analysis: AnalysisConfig,
    pub render: RenderConfig,
    pub capture: CaptureConfig,
    pub session: SessionConfig,
}

impl AppConfig {
    /// Reads a JSON configuration file. Missing sections keep their defaults.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)?;
        let config: Self = serde_json::from_str(&raw)?;
        config.validate()?;
        tracing::debug!(path = %path.display(), "loaded configuration");
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        self.session.validate()?;
        if !self.analysis.fft_size.is_power_of_two() || self.analysis.fft_size < 32 {
            return Err(VisualiserError::InvalidConfig(format!(
                "fft_size must be a power of two >= 32, got {}",
                self.analysis.fft_size
            )));
        }
        if !(0.0..1.0).contains(&self.analysis.smoothing) {
            return Err(VisualiserError::InvalidConfig(format!(
                "smoothing must be in [0, 1), got {}",
                self.analysis.smoothing
            )));
        }
        if self.render.refresh_hz == 0 || self.capture.fps == 0 {
            return Err(VisualiserError::InvalidConfig(
                "refresh rate and capture fps must be positive".into(),
            ));
        }
        Ok(())
    }
}

/// Configuration specific to the audio subsystem.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AudioConfig {
    /// Play through the default output device instead of the loop clock.
    pub use_output_device: bool,
    /// Loop interactive playback.
    pub looping: bool,
}

impl Default for AudioConfig {
    fn default() -> Self {
        Self {
            use_output_device: false,
            looping: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AnalysisConfig {
    pub fft_size: usize,
    /// Time constant applied between consecutive spectra, like an analyser
    /// node's `smoothingTimeConstant`.
    pub smoothing: f32,
    pub min_decibels: f32,
    pub max_decibels: f32,
    /// Rolling baseline length, in analysis frames.
    pub history_len: usize,
    pub refractory_ms: u64,
    pub bass_floor: f32,
}

impl Default for AnalysisConfig {
    fn default() -> Self {
        Self {
            fft_size: 2048,
            smoothing: 0.8,
            min_decibels: -100.0,
            max_decibels: -30.0,
            history_len: 60,
            refractory_ms: 200,
            bass_floor: 0.3,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RenderConfig {
    pub width: u32,
    pub height: u32,
    pub pixel_ratio: f32,
    pub refresh_hz: u32,
    pub bar_count: usize,
    pub stutter_probability: f64,
}

impl Default for RenderConfig {
    fn default() -> Self {
        Self {
            width: 720,
            height: 720,
            pixel_ratio: 1.0,
            refresh_hz: 60,
            bar_count: 32,
            stutter_probability: 0.1,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CaptureConfig {
    pub fps: u32,
    pub bitrate: u32,
    pub poll_interval_ms: u64,
    pub output_dir: PathBuf,
    pub file_prefix: String,
    pub ffmpeg_path: PathBuf,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            fps: 30,
            bitrate: 5_000_000,
            poll_interval_ms: 100,
            output_dir: PathBuf::from("."),
            file_prefix: "beatpose".to_string(),
            ffmpeg_path: PathBuf::from("ffmpeg"),
        }
    }
}

/// User-facing controls supplied alongside the pose set.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Reactivity slider, 0 (calm) to 100 (twitchy).
    pub reactivity: u8,
    /// Export length in seconds.
    pub duration_secs: u32,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            reactivity: 50,
            duration_secs: 10,
        }
    }
}

impl SessionConfig {
    pub fn validate(&self) -> Result<()> {
        if self.reactivity > 100 {
            return Err(VisualiserError::InvalidConfig(format!(
                "reactivity must be within 0..=100, got {}",
                self.reactivity
            )));
        }
        validate_duration(self.duration_secs)
    }
}

pub fn validate_duration(secs: u32) -> Result<()> {
    if !(MIN_DURATION_SECS..=MAX_DURATION_SECS).contains(&secs) || secs % DURATION_STEP_SECS != 0
    {
        return Err(VisualiserError::InvalidConfig(format!(
            "duration must be {MIN_DURATION_SECS}-{MAX_DURATION_SECS}s in steps of {DURATION_STEP_SECS}, got {secs}"
        )));
    }
    Ok(())
}
