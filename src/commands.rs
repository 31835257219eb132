// Host command handlers
// Flat boundary over the engine for the managed layer: every call returns a
// plain value, never an error or a panic. When the engine failed to come up,
// every call is a no-op that returns the default.
use parking_lot::Mutex;
use std::path::Path;
use std::sync::Arc;

use crate::audio::{AudioBackend, AudioPlayer, CpalBackend, EngineEvent, EventListener};
use crate::error::{EngineError, EngineResult};
use crate::settings::EngineSettings;
use crate::state::VISUALIZATION_BINS;

pub struct PlayerBridge {
    player: Option<AudioPlayer>,
    last_error: Mutex<Option<EngineError>>,
}

impl PlayerBridge {
    /// Build the engine on `backend`. A failure is kept and reported through
    /// `last_error_code`, never returned.
    pub fn new(
        backend: Arc<dyn AudioBackend>,
        settings: EngineSettings,
        listener: Option<EventListener>,
    ) -> Self {
        match AudioPlayer::new(backend, settings, listener) {
            Ok(player) => Self {
                player: Some(player),
                last_error: Mutex::new(None),
            },
            Err(e) => {
                tracing::error!("Audio engine failed to initialize: {}", e);
                Self {
                    player: None,
                    last_error: Mutex::new(Some(e)),
                }
            }
        }
    }

    /// Engine on the system's default output device
    pub fn with_default_device(settings: EngineSettings, listener: Option<EventListener>) -> Self {
        Self::new(Arc::new(CpalBackend::new()), settings, listener)
    }

    pub fn is_initialized(&self) -> bool {
        self.player.is_some()
    }

    pub fn player(&self) -> Option<&AudioPlayer> {
        self.player.as_ref()
    }

    /// Code of the most recent failure, 0 when the last fallible call
    /// succeeded
    pub fn last_error_code(&self) -> i32 {
        if self.player.is_none() {
            return EngineError::EngineNotInitialized.code();
        }
        self.last_error.lock().as_ref().map_or(0, EngineError::code)
    }

    pub fn last_error(&self) -> Option<EngineError> {
        if self.player.is_none() {
            return Some(EngineError::EngineNotInitialized);
        }
        self.last_error.lock().clone()
    }

    fn with_player<T>(&self, op: &str, default: T, f: impl FnOnce(&AudioPlayer) -> T) -> T {
        match &self.player {
            Some(player) => f(player),
            None => {
                tracing::debug!("{} ignored: {}", op, EngineError::EngineNotInitialized);
                default
            }
        }
    }

    fn run(&self, op: &str, f: impl FnOnce(&AudioPlayer) -> EngineResult<()>) -> bool {
        self.with_player(op, false, |player| match f(player) {
            Ok(()) => {
                *self.last_error.lock() = None;
                true
            }
            Err(e) => {
                tracing::warn!("{} failed: {} (code {})", op, e, e.code());
                *self.last_error.lock() = Some(e);
                false
            }
        })
    }

    // ===== Transport Commands =====

    pub fn load_file(&self, file_path: &str) -> bool {
        self.run("load_file", |player| player.load(Path::new(file_path)))
    }

    pub fn play(&self) -> bool {
        self.run("play", AudioPlayer::play)
    }

    pub fn pause(&self) -> bool {
        self.run("pause", AudioPlayer::pause)
    }

    pub fn stop(&self) -> bool {
        self.run("stop", |player| {
            player.stop();
            Ok(())
        })
    }

    pub fn seek_to(&self, position_ms: i64) -> bool {
        self.run("seek_to", |player| player.seek_ms(position_ms))
    }

    // ===== Telemetry =====

    pub fn is_playing(&self) -> bool {
        self.with_player("is_playing", false, AudioPlayer::is_playing)
    }

    pub fn get_current_position(&self) -> i64 {
        self.with_player("get_current_position", 0, AudioPlayer::position_ms)
    }

    pub fn get_duration(&self) -> i64 {
        self.with_player("get_duration", 0, AudioPlayer::duration_ms)
    }

    pub fn get_visualization_data(&self) -> [f32; VISUALIZATION_BINS] {
        self.with_player(
            "get_visualization_data",
            [0.0; VISUALIZATION_BINS],
            AudioPlayer::visualization_data,
        )
    }

    pub fn get_underrun_count(&self) -> u64 {
        self.with_player("get_underrun_count", 0, AudioPlayer::underrun_count)
    }

    pub fn get_buffered_ms(&self) -> i64 {
        self.with_player("get_buffered_ms", 0, AudioPlayer::buffered_ms)
    }

    pub fn poll_events(&self) -> Vec<EngineEvent> {
        self.with_player("poll_events", Vec::new(), AudioPlayer::poll_events)
    }

    // ===== Output Format =====

    pub fn set_sample_rate(&self, sample_rate: i32) -> bool {
        let Ok(rate) = u32::try_from(sample_rate) else {
            tracing::warn!("Ignoring sample rate {}", sample_rate);
            return false;
        };
        self.run("set_sample_rate", |player| player.set_sample_rate(rate))
    }

    pub fn set_bit_depth(&self, bit_depth: i32) -> bool {
        let Ok(bits) = u32::try_from(bit_depth) else {
            tracing::warn!("Ignoring bit depth {}", bit_depth);
            return false;
        };
        self.run("set_bit_depth", |player| player.set_bit_depth(bits))
    }

    pub fn set_channel_count(&self, channels: i32) -> bool {
        let Ok(count) = u16::try_from(channels) else {
            tracing::warn!("Ignoring channel count {}", channels);
            return false;
        };
        self.run("set_channel_count", |player| player.set_channels(count))
    }

    pub fn set_audio_quality(&self, sample_rate: i32, bit_depth: i32, channels: i32) -> bool {
        let (Ok(rate), Ok(bits), Ok(count)) = (
            u32::try_from(sample_rate),
            u32::try_from(bit_depth),
            u16::try_from(channels),
        ) else {
            tracing::warn!(
                "Ignoring audio quality {} Hz / {} bit / {} ch",
                sample_rate,
                bit_depth,
                channels
            );
            return false;
        };
        self.run("set_audio_quality", |player| player.set_audio_quality(rate, bits, count))
    }

    // ===== DSP =====

    pub fn set_volume(&self, volume: f32) {
        self.with_player("set_volume", (), |player| player.set_volume(volume))
    }

    pub fn enable_eq(&self, enabled: bool) {
        self.with_player("enable_eq", (), |player| player.enable_eq(enabled))
    }

    pub fn set_eq_band(&self, band: i32, gain_db: f32) -> bool {
        let Ok(index) = usize::try_from(band) else {
            tracing::warn!("Ignoring EQ band {}", band);
            return false;
        };
        self.with_player("set_eq_band", false, |player| player.set_eq_band(index, gain_db))
    }

    pub fn enable_volume_normalization(&self, enabled: bool) {
        self.with_player("enable_volume_normalization", (), |player| {
            player.enable_volume_normalization(enabled)
        })
    }

    pub fn set_target_lufs(&self, lufs: f32) {
        self.with_player("set_target_lufs", (), |player| player.set_target_lufs(lufs))
    }

    pub fn optimize_for_device(&self, use_headphones: bool, high_performance: bool) {
        self.with_player("optimize_for_device", (), |player| {
            player.optimize_for_device(use_headphones, high_performance)
        })
    }

    // ===== Settings =====

    /// Persist the current configuration under `dir`
    pub fn save_settings(&self, dir: &str) -> bool {
        self.with_player("save_settings", false, |player| {
            match player.settings().save(Path::new(dir)) {
                Ok(()) => true,
                Err(e) => {
                    tracing::warn!("Failed to save settings: {:#}", e);
                    false
                }
            }
        })
    }
}
