// Shared engine state
// The live output configuration is written by the transport (control side)
// and read by the decode worker and the real-time callback, so every field
// is its own atomic and readers never block.

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, AtomicU16, AtomicU32, AtomicU64, Ordering};

/// Number of graphic EQ bands
pub const EQ_BANDS: usize = 10;

/// Number of bins in the visualization snapshot
pub const VISUALIZATION_BINS: usize = 20;

/// EQ gain limits in dB
pub const MAX_EQ_GAIN_DB: f32 = 12.0;

/// Target loudness range accepted by the normalizer
pub const MIN_TARGET_LUFS: f32 = -23.0;
pub const MAX_TARGET_LUFS: f32 = -9.0;

pub const MIN_SAMPLE_RATE: u32 = 8_000;
pub const MAX_SAMPLE_RATE: u32 = 384_000;

pub fn is_supported_sample_rate(rate: u32) -> bool {
    (MIN_SAMPLE_RATE..=MAX_SAMPLE_RATE).contains(&rate)
}

pub fn is_supported_bit_depth(bits: u32) -> bool {
    matches!(bits, 16 | 24 | 32)
}

pub fn is_supported_channels(channels: u16) -> bool {
    matches!(channels, 1 | 2)
}

/// f32 stored as raw bits in an `AtomicU32`
#[derive(Debug, Default)]
pub struct AtomicF32(AtomicU32);

impl AtomicF32 {
    pub fn new(value: f32) -> Self {
        Self(AtomicU32::new(value.to_bits()))
    }

    #[inline]
    pub fn load(&self, order: Ordering) -> f32 {
        f32::from_bits(self.0.load(order))
    }

    #[inline]
    pub fn store(&self, value: f32, order: Ordering) {
        self.0.store(value.to_bits(), order)
    }
}

/// Plain snapshot of the output configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OutputConfig {
    pub sample_rate: u32,
    pub bit_depth: u32,
    pub channels: u16,
    pub volume: f32,
    pub eq_enabled: bool,
    pub eq_gains_db: [f32; EQ_BANDS],
    pub normalization_enabled: bool,
    pub target_lufs: f32,
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            sample_rate: 44_100,
            bit_depth: 16,
            channels: 2,
            volume: 1.0,
            eq_enabled: false,
            eq_gains_db: [0.0; EQ_BANDS],
            normalization_enabled: false,
            target_lufs: -14.0,
        }
    }
}

/// Output format the device is actually running at
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutputFormat {
    pub sample_rate: u32,
    pub channels: u16,
}

impl OutputFormat {
    pub fn frames_to_ms(&self, frames: u64) -> i64 {
        if self.sample_rate == 0 {
            return 0;
        }
        (frames as u128 * 1000 / self.sample_rate as u128) as i64
    }

    pub fn ms_to_frames(&self, ms: i64) -> u64 {
        (ms.max(0) as u128 * self.sample_rate as u128 / 1000) as u64
    }
}

/// Live output configuration shared between threads
#[derive(Debug)]
pub struct SharedConfig {
    sample_rate: AtomicU32,
    bit_depth: AtomicU32,
    channels: AtomicU16,
    volume: AtomicF32,
    eq_enabled: AtomicBool,
    eq_gains_db: [AtomicF32; EQ_BANDS],
    /// Bumped on every EQ change so the worker knows to recompute filters
    eq_generation: AtomicU64,
    normalization_enabled: AtomicBool,
    target_lufs: AtomicF32,
}

impl SharedConfig {
    pub fn new(config: &OutputConfig) -> Self {
        let shared = Self {
            sample_rate: AtomicU32::new(OutputConfig::default().sample_rate),
            bit_depth: AtomicU32::new(OutputConfig::default().bit_depth),
            channels: AtomicU16::new(OutputConfig::default().channels),
            volume: AtomicF32::new(1.0),
            eq_enabled: AtomicBool::new(false),
            eq_gains_db: std::array::from_fn(|_| AtomicF32::new(0.0)),
            eq_generation: AtomicU64::new(0),
            normalization_enabled: AtomicBool::new(false),
            target_lufs: AtomicF32::new(OutputConfig::default().target_lufs),
        };
        shared.apply(config);
        shared
    }

    /// Overwrite every field from a snapshot (values are validated)
    pub fn apply(&self, config: &OutputConfig) {
        self.set_sample_rate(config.sample_rate);
        self.set_bit_depth(config.bit_depth);
        self.set_channels(config.channels);
        self.set_volume(config.volume);
        self.set_eq_enabled(config.eq_enabled);
        for (band, gain) in config.eq_gains_db.iter().enumerate() {
            self.set_eq_band(band, *gain);
        }
        self.set_normalization_enabled(config.normalization_enabled);
        self.set_target_lufs(config.target_lufs);
    }

    pub fn snapshot(&self) -> OutputConfig {
        OutputConfig {
            sample_rate: self.sample_rate(),
            bit_depth: self.bit_depth(),
            channels: self.channels(),
            volume: self.volume(),
            eq_enabled: self.eq_enabled(),
            eq_gains_db: self.eq_gains_db(),
            normalization_enabled: self.normalization_enabled(),
            target_lufs: self.target_lufs(),
        }
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate.load(Ordering::Acquire)
    }

    /// Returns true if the value changed
    pub fn set_sample_rate(&self, rate: u32) -> bool {
        if !is_supported_sample_rate(rate) {
            tracing::warn!("Ignoring unsupported sample rate {}", rate);
            return false;
        }
        self.sample_rate.swap(rate, Ordering::AcqRel) != rate
    }

    pub fn bit_depth(&self) -> u32 {
        self.bit_depth.load(Ordering::Acquire)
    }

    pub fn set_bit_depth(&self, bits: u32) -> bool {
        if !is_supported_bit_depth(bits) {
            tracing::warn!("Ignoring unsupported bit depth {}", bits);
            return false;
        }
        self.bit_depth.swap(bits, Ordering::AcqRel) != bits
    }

    pub fn channels(&self) -> u16 {
        self.channels.load(Ordering::Acquire)
    }

    pub fn set_channels(&self, channels: u16) -> bool {
        if !is_supported_channels(channels) {
            tracing::warn!("Ignoring unsupported channel count {}", channels);
            return false;
        }
        self.channels.swap(channels, Ordering::AcqRel) != channels
    }

    pub fn volume(&self) -> f32 {
        self.volume.load(Ordering::Relaxed)
    }

    pub fn set_volume(&self, volume: f32) {
        let volume = if volume.is_finite() { volume.clamp(0.0, 1.0) } else { 1.0 };
        self.volume.store(volume, Ordering::Relaxed);
    }

    pub fn eq_enabled(&self) -> bool {
        self.eq_enabled.load(Ordering::Acquire)
    }

    pub fn set_eq_enabled(&self, enabled: bool) {
        if self.eq_enabled.swap(enabled, Ordering::AcqRel) != enabled {
            self.eq_generation.fetch_add(1, Ordering::Release);
        }
    }

    pub fn eq_band(&self, band: usize) -> Option<f32> {
        self.eq_gains_db.get(band).map(|g| g.load(Ordering::Acquire))
    }

    pub fn eq_gains_db(&self) -> [f32; EQ_BANDS] {
        std::array::from_fn(|band| self.eq_gains_db[band].load(Ordering::Acquire))
    }

    /// Returns false for an out-of-range band index
    pub fn set_eq_band(&self, band: usize, gain_db: f32) -> bool {
        let Some(slot) = self.eq_gains_db.get(band) else {
            tracing::warn!("Ignoring EQ band index {}", band);
            return false;
        };
        let gain_db = if gain_db.is_finite() {
            gain_db.clamp(-MAX_EQ_GAIN_DB, MAX_EQ_GAIN_DB)
        } else {
            0.0
        };
        slot.store(gain_db, Ordering::Release);
        self.eq_generation.fetch_add(1, Ordering::Release);
        true
    }

    pub fn eq_generation(&self) -> u64 {
        self.eq_generation.load(Ordering::Acquire)
    }

    pub fn normalization_enabled(&self) -> bool {
        self.normalization_enabled.load(Ordering::Acquire)
    }

    pub fn set_normalization_enabled(&self, enabled: bool) {
        self.normalization_enabled.store(enabled, Ordering::Release);
    }

    pub fn target_lufs(&self) -> f32 {
        self.target_lufs.load(Ordering::Acquire)
    }

    pub fn set_target_lufs(&self, lufs: f32) {
        let lufs = if lufs.is_finite() {
            lufs.clamp(MIN_TARGET_LUFS, MAX_TARGET_LUFS)
        } else {
            OutputConfig::default().target_lufs
        };
        self.target_lufs.store(lufs, Ordering::Release);
    }
}

impl Default for SharedConfig {
    fn default() -> Self {
        Self::new(&OutputConfig::default())
    }
}
