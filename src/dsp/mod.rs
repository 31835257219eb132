// DSP chain
// Fixed order: equalizer, loudness normalizer, limiter. Runs on the decode
// worker, never on the real-time callback.

pub mod equalizer;
pub mod limiter;
pub mod loudness;

pub use equalizer::Equalizer;
pub use limiter::Limiter;
pub use loudness::LoudnessNormalizer;

use crate::state::SharedConfig;

pub struct DspChain {
    equalizer: Equalizer,
    normalizer: Option<LoudnessNormalizer>,
    limiter: Limiter,
    eq_generation: Option<u64>,
    eq_enabled: bool,
    normalization_enabled: bool,
}

impl DspChain {
    pub fn new(sample_rate: u32, channels: usize) -> Self {
        let normalizer = match LoudnessNormalizer::new(sample_rate, channels) {
            Ok(normalizer) => Some(normalizer),
            Err(e) => {
                tracing::warn!("Volume normalization unavailable: {}", e);
                None
            }
        };

        Self {
            equalizer: Equalizer::new(sample_rate, channels),
            normalizer,
            limiter: Limiter::new(sample_rate, channels),
            eq_generation: None,
            eq_enabled: false,
            normalization_enabled: false,
        }
    }

    /// Process interleaved frames in place with the configuration as it is
    /// right now. Length and layout never change.
    pub fn process(&mut self, buffer: &mut [f32], config: &SharedConfig) {
        self.sync_equalizer(config);
        if self.eq_enabled {
            self.equalizer.process(buffer);
        }

        let normalize = config.normalization_enabled();
        if normalize != self.normalization_enabled {
            self.normalization_enabled = normalize;
            if let Some(normalizer) = self.normalizer.as_mut() {
                normalizer.reset();
            }
        }
        if normalize {
            if let Some(normalizer) = self.normalizer.as_mut() {
                normalizer.process(buffer, config.target_lufs());
            }
        }

        self.limiter.process(buffer);
    }

    /// Drop all filter and meter history (after a seek)
    pub fn reset(&mut self) {
        self.equalizer.reset();
        if let Some(normalizer) = self.normalizer.as_mut() {
            normalizer.reset();
        }
        self.limiter.reset();
    }

    pub fn normalization_gain_db(&self) -> f32 {
        self.normalizer.as_ref().map_or(0.0, |n| n.gain_db())
    }

    fn sync_equalizer(&mut self, config: &SharedConfig) {
        let generation = config.eq_generation();
        if self.eq_generation == Some(generation) {
            return;
        }
        self.eq_generation = Some(generation);

        let enabled = config.eq_enabled();
        if enabled && !self.eq_enabled {
            self.equalizer.reset();
        }
        self.eq_enabled = enabled;
        self.equalizer.set_gains(&config.eq_gains_db());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn program(frames: usize) -> Vec<f32> {
        (0..frames * 2)
            .map(|n| 0.6 * ((n as f32) * 0.013).sin() + 0.2 * ((n as f32) * 0.31).cos())
            .collect()
    }

    #[test]
    fn test_bypass_is_bit_exact() {
        let config = SharedConfig::default();
        config.set_eq_band(0, 6.0);
        config.set_eq_band(7, -4.0);
        // Bands are set but the EQ is off

        let mut chain = DspChain::new(44_100, 2);
        let original = program(4096);
        let mut buffer = original.clone();
        chain.process(&mut buffer, &config);
        assert_eq!(buffer, original);
    }

    #[test]
    fn test_bypass_is_bit_exact_after_limiting() {
        let config = SharedConfig::default();
        let mut chain = DspChain::new(48_000, 2);

        let mut over = vec![1.2, -1.1];
        chain.process(&mut over, &config);
        assert!(over.iter().all(|s| s.abs() <= 1.0));

        // Let the limiter release fully, then the chain is transparent again
        for _ in 0..(3 * 48_000 / 1024) {
            let mut quiet = vec![0.5f32; 1024 * 2];
            chain.process(&mut quiet, &config);
        }
        let original = program(4096);
        let mut buffer = original.clone();
        chain.process(&mut buffer, &config);
        assert_eq!(buffer, original);
    }

    #[test]
    fn test_eq_change_applies_to_next_buffer() {
        let config = SharedConfig::default();
        config.set_eq_enabled(true);

        let mut chain = DspChain::new(44_100, 2);
        let original = program(1024);

        let mut first = original.clone();
        chain.process(&mut first, &config);
        assert_eq!(first, original);

        config.set_eq_band(0, 6.0);
        let mut second = original.clone();
        chain.process(&mut second, &config);
        assert_ne!(second, original);
        assert_eq!(second.len(), original.len());
    }

    #[test]
    fn test_output_never_exceeds_full_scale() {
        let config = SharedConfig::default();
        config.set_eq_enabled(true);
        for band in 0..crate::state::EQ_BANDS {
            config.set_eq_band(band, 12.0);
        }
        config.set_normalization_enabled(true);
        config.set_target_lufs(-9.0);

        let mut chain = DspChain::new(48_000, 2);
        for _ in 0..50 {
            let mut buffer = program(1024);
            chain.process(&mut buffer, &config);
            assert!(buffer.iter().all(|s| s.abs() <= 1.0 && !s.is_nan()));
        }
    }
}
