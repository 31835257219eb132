// Live loudness normalization
// Measures short-term loudness (EBU R128, 3 s window) of the signal it is
// fed and walks a gain toward the configured target.

use ebur128::{EbuR128, Mode};

use crate::error::{EngineError, EngineResult};

/// Largest correction in either direction
pub const MAX_NORMALIZATION_GAIN_DB: f32 = 12.0;

/// Below this the program is treated as silence and the gain is held
const GATE_LUFS: f64 = -70.0;

/// Gain slew rates in dB per second
const CUT_RATE_DB_PER_SEC: f32 = 6.0;
const BOOST_RATE_DB_PER_SEC: f32 = 3.0;

/// Hard cap on the gain change across one buffer
pub const MAX_STEP_DB: f32 = 0.5;

pub struct LoudnessNormalizer {
    meter: EbuR128,
    sample_rate: u32,
    channels: usize,
    gain_db: f32,
}

impl LoudnessNormalizer {
    pub fn new(sample_rate: u32, channels: usize) -> EngineResult<Self> {
        let meter = EbuR128::new(channels as u32, sample_rate, Mode::S)
            .map_err(|e| {
                EngineError::UnsupportedFormat(format!("Failed to create EBU R128 meter: {}", e))
            })?;

        Ok(Self {
            meter,
            sample_rate,
            channels: channels.max(1),
            gain_db: 0.0,
        })
    }

    /// Gain currently applied, in dB
    pub fn gain_db(&self) -> f32 {
        self.gain_db
    }

    /// Measured short-term loudness, if the meter has seen any signal
    pub fn measured_lufs(&self) -> Option<f64> {
        self.meter
            .loudness_shortterm()
            .ok()
            .filter(|lufs| lufs.is_finite() && *lufs > GATE_LUFS)
    }

    pub fn reset(&mut self) {
        self.meter.reset();
        self.gain_db = 0.0;
    }

    /// Measure the buffer, then apply a gain ramp toward `target_lufs`
    pub fn process(&mut self, buffer: &mut [f32], target_lufs: f32) {
        let frames = buffer.len() / self.channels;
        if frames == 0 {
            return;
        }

        if let Err(e) = self.meter.add_frames_f32(&buffer[..frames * self.channels]) {
            tracing::debug!("Loudness meter rejected frames: {}", e);
        }

        let start_db = self.gain_db;
        if let Some(measured) = self.measured_lufs() {
            let desired = ((target_lufs as f64 - measured) as f32)
                .clamp(-MAX_NORMALIZATION_GAIN_DB, MAX_NORMALIZATION_GAIN_DB);

            let seconds = frames as f32 / self.sample_rate as f32;
            let rate = if desired < start_db {
                CUT_RATE_DB_PER_SEC
            } else {
                BOOST_RATE_DB_PER_SEC
            };
            let max_step = (rate * seconds).min(MAX_STEP_DB);
            self.gain_db = start_db + (desired - start_db).clamp(-max_step, max_step);
        }

        apply_ramp(buffer, self.channels, db_to_linear(start_db), db_to_linear(self.gain_db));
    }
}

pub fn db_to_linear(db: f32) -> f32 {
    10.0_f32.powf(db / 20.0)
}

/// Linear gain ramp from `from` to `to` over the buffer
fn apply_ramp(buffer: &mut [f32], channels: usize, from: f32, to: f32) {
    let frames = buffer.len() / channels;
    if from == to {
        if from != 1.0 {
            buffer.iter_mut().for_each(|s| *s *= from);
        }
        return;
    }

    let step = (to - from) / frames as f32;
    for (i, frame) in buffer.chunks_exact_mut(channels).enumerate() {
        let gain = from + step * (i + 1) as f32;
        frame.iter_mut().for_each(|s| *s *= gain);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    const RATE: u32 = 48_000;
    const BLOCK: usize = 1024;

    fn stereo_tone(amplitude: f32, frames: usize, phase: &mut usize) -> Vec<f32> {
        let mut out = Vec::with_capacity(frames * 2);
        for _ in 0..frames {
            let t = *phase as f32 / RATE as f32;
            let v = amplitude * (2.0 * std::f32::consts::PI * 1_000.0 * t).sin();
            out.push(v);
            out.push(v);
            *phase += 1;
        }
        out
    }

    #[test]
    fn test_converges_to_target_without_jumps() {
        let mut normalizer = LoudnessNormalizer::new(RATE, 2).unwrap();
        let mut output_meter = EbuR128::new(2, RATE, Mode::S).unwrap();
        let mut phase = 0;
        let mut previous_gain = 0.0;

        // 20 seconds of a steady tone well below target
        for _ in 0..(20 * RATE as usize / BLOCK) {
            let mut block = stereo_tone(0.1, BLOCK, &mut phase);
            normalizer.process(&mut block, -14.0);
            output_meter.add_frames_f32(&block).unwrap();

            let gain = normalizer.gain_db();
            assert!((gain - previous_gain).abs() <= MAX_STEP_DB + 1e-4);
            previous_gain = gain;
        }

        let lufs = output_meter.loudness_shortterm().unwrap();
        assert!((lufs + 14.0).abs() <= 1.0, "ended at {} LUFS", lufs);
    }

    #[test]
    fn test_loud_input_is_cut() {
        let mut normalizer = LoudnessNormalizer::new(RATE, 2).unwrap();
        let mut phase = 0;
        for _ in 0..(10 * RATE as usize / BLOCK) {
            let mut block = stereo_tone(0.9, BLOCK, &mut phase);
            normalizer.process(&mut block, -23.0);
        }
        assert!(normalizer.gain_db() < -5.0);
        assert!(normalizer.gain_db() >= -MAX_NORMALIZATION_GAIN_DB);
    }

    #[test]
    fn test_silence_holds_gain() {
        let mut normalizer = LoudnessNormalizer::new(RATE, 1).unwrap();
        for _ in 0..100 {
            let mut block = vec![0.0f32; BLOCK];
            normalizer.process(&mut block, -14.0);
            assert!(block.iter().all(|&s| s == 0.0));
        }
        assert_abs_diff_eq!(normalizer.gain_db(), 0.0);
    }
}
