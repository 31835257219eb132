// Engine settings management and persistence
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

use crate::audio::convert::ResamplerQuality;
use crate::state::{OutputConfig, EQ_BANDS};

/// Buffer sizing and resampler quality
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BufferSettings {
    /// Ring buffer length between the decode worker and the callback
    pub ring_buffer_ms: u32,
    /// Requested hardware period in frames (the device may pick another)
    pub period_frames: u32,
    pub resampler_quality: ResamplerQuality,
}

impl BufferSettings {
    pub fn ring_frames(&self, sample_rate: u32) -> usize {
        let ring = self.ring_buffer_ms as u64 * sample_rate as u64 / 1000;
        ring.max(self.period_frames as u64 * 2) as usize
    }
}

impl Default for BufferSettings {
    fn default() -> Self {
        Self {
            ring_buffer_ms: 250,
            period_frames: 480,
            resampler_quality: ResamplerQuality::Standard,
        }
    }
}

/// What the host knows about the current device
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DeviceProfile {
    pub use_headphones: bool,
    pub high_performance: bool,
}

impl DeviceProfile {
    pub fn buffer_settings(&self) -> BufferSettings {
        if self.high_performance {
            BufferSettings {
                ring_buffer_ms: 150,
                period_frames: 240,
                resampler_quality: ResamplerQuality::High,
            }
        } else {
            BufferSettings {
                ring_buffer_ms: 400,
                period_frames: 960,
                resampler_quality: ResamplerQuality::Low,
            }
        }
    }

    /// Mild compensation curve seeded for headphones when the EQ is flat
    pub fn headphone_curve() -> [f32; EQ_BANDS] {
        [1.5, 1.5, 0.0, 0.0, 0.0, 0.0, 0.0, 0.0, -1.0, -1.0]
    }
}

/// Persisted engine settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineSettings {
    pub version: i32, // Settings schema version for future migrations
    pub output: OutputConfig,
    pub buffer: BufferSettings,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            version: 1,
            output: OutputConfig::default(),
            buffer: BufferSettings::default(),
        }
    }
}

impl EngineSettings {
    /// Get the settings file path
    pub fn get_settings_path(dir: &Path) -> PathBuf {
        dir.join("engine.json")
    }

    /// Load settings from file, or return defaults if file doesn't exist
    pub fn load(dir: &Path) -> Result<Self> {
        let path = Self::get_settings_path(dir);

        if !path.exists() {
            tracing::info!("No engine settings at {:?}, using defaults", path);
            return Ok(Self::default());
        }

        let content = fs::read_to_string(&path)
            .with_context(|| format!("Failed to read settings file {:?}", path))?;

        let settings: EngineSettings = serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse settings file {:?}", path))?;

        tracing::info!("Loaded engine settings from {:?}", path);
        Ok(settings)
    }

    /// Save settings to file
    pub fn save(&self, dir: &Path) -> Result<()> {
        fs::create_dir_all(dir).context("Failed to create settings directory")?;

        let path = Self::get_settings_path(dir);
        let content = serde_json::to_string_pretty(self).context("Failed to serialize settings")?;

        fs::write(&path, content)
            .with_context(|| format!("Failed to write settings file {:?}", path))?;

        tracing::info!("Saved engine settings to {:?}", path);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_file_gives_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let settings = EngineSettings::load(dir.path()).unwrap();
        assert_eq!(settings, EngineSettings::default());
    }

    #[test]
    fn test_save_then_load() {
        let dir = tempfile::tempdir().unwrap();
        let nested = dir.path().join("pancake");

        let mut settings = EngineSettings::default();
        settings.output.sample_rate = 96_000;
        settings.output.eq_gains_db[2] = 4.5;
        settings.buffer = DeviceProfile {
            use_headphones: false,
            high_performance: true,
        }
        .buffer_settings();
        settings.save(&nested).unwrap();

        assert_eq!(EngineSettings::load(&nested).unwrap(), settings);
    }

    #[test]
    fn test_partial_file_fills_defaults() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(
            EngineSettings::get_settings_path(dir.path()),
            r#"{ "output": { "target_lufs": -18.0 }, "buffer": { "resampler_quality": "hq" } }"#,
        )
        .unwrap();

        let settings = EngineSettings::load(dir.path()).unwrap();
        assert_eq!(settings.output.target_lufs, -18.0);
        assert_eq!(settings.output.sample_rate, 44_100);
        assert_eq!(settings.buffer.resampler_quality, ResamplerQuality::High);
        assert_eq!(settings.buffer.ring_buffer_ms, 250);
    }

    #[test]
    fn test_garbage_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(EngineSettings::get_settings_path(dir.path()), "not json").unwrap();
        let err = EngineSettings::load(dir.path()).unwrap_err();
        assert!(err.to_string().contains("Failed to parse settings"));
    }
}
