// Output safety limiter
// Instant attack, exponential release. While nothing exceeds the ceiling and
// the gain has fully recovered, samples pass through untouched.

/// Release time constant
const RELEASE_SECS: f64 = 0.1;

/// Gain this close to unity snaps back to exactly 1.0
const UNITY_SNAP: f64 = 1e-6;

pub struct Limiter {
    ceiling: f32,
    channels: usize,
    /// Kept in f64: in f32 the release step rounds away near unity and the
    /// gain stalls just below 1.0
    gain: f64,
    release_coeff: f64,
}

impl Limiter {
    pub fn new(sample_rate: u32, channels: usize) -> Self {
        Self::with_ceiling(sample_rate, channels, 1.0)
    }

    pub fn with_ceiling(sample_rate: u32, channels: usize, ceiling: f32) -> Self {
        let release_coeff = (-1.0 / (RELEASE_SECS * sample_rate.max(1) as f64)).exp();
        Self {
            ceiling,
            channels: channels.max(1),
            gain: 1.0,
            release_coeff,
        }
    }

    /// Current gain reduction as a linear factor (1.0 = none)
    pub fn gain(&self) -> f32 {
        self.gain as f32
    }

    pub fn reset(&mut self) {
        self.gain = 1.0;
    }

    pub fn process(&mut self, buffer: &mut [f32]) {
        for frame in buffer.chunks_exact_mut(self.channels) {
            // NaN never compares greater, so it cannot drive the gain
            let peak = frame.iter().fold(0.0f32, |m, s| if s.abs() > m { s.abs() } else { m });
            let target = if peak > self.ceiling {
                (self.ceiling / peak) as f64
            } else {
                1.0
            };

            if target < self.gain {
                self.gain = target;
            } else if self.gain < 1.0 {
                let released = 1.0 - (1.0 - self.gain) * self.release_coeff;
                self.gain = if 1.0 - released < UNITY_SNAP {
                    1.0
                } else {
                    released.min(target)
                };
            }

            let gain = self.gain as f32;
            for sample in frame.iter_mut() {
                if self.gain < 1.0 {
                    *sample *= gain;
                }
                *sample = if sample.is_nan() {
                    0.0
                } else {
                    sample.clamp(-self.ceiling, self.ceiling)
                };
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_in_range_signal_is_bit_exact() {
        let mut limiter = Limiter::new(48_000, 2);
        let original: Vec<f32> = (0..512).map(|n| ((n as f32) * 0.01).sin() * 0.99).collect();
        let mut buffer = original.clone();
        limiter.process(&mut buffer);
        assert_eq!(buffer, original);
    }

    #[test]
    fn test_overs_are_pulled_under_ceiling() {
        let mut limiter = Limiter::new(48_000, 2);
        let mut buffer = vec![0.5, 2.0, -3.0, 0.1, f32::INFINITY, 0.0];
        limiter.process(&mut buffer);
        assert!(buffer.iter().all(|s| s.abs() <= 1.0));
        // Instant attack keeps the stereo image of the first loud frame
        assert!((buffer[1] - 1.0).abs() < 1e-6);
        assert!((buffer[0] - 0.25).abs() < 1e-6);
        assert!(limiter.gain() < 1.0);
    }

    #[test]
    fn test_nan_becomes_silence() {
        let mut limiter = Limiter::new(44_100, 1);
        let mut buffer = vec![f32::NAN, 0.5];
        limiter.process(&mut buffer);
        assert_eq!(buffer, vec![0.0, 0.5]);
    }

    #[test]
    fn test_gain_recovers_after_release() {
        let mut limiter = Limiter::new(1_000, 1);
        let mut burst = vec![4.0];
        limiter.process(&mut burst);
        assert!(limiter.gain() <= 0.25);

        // 2 s of quiet at 1 kHz is 20 release time constants
        let mut quiet = vec![0.1f32; 2_000];
        limiter.process(&mut quiet);
        assert_eq!(limiter.gain(), 1.0);
    }

    #[test]
    fn test_release_reaches_unity_at_audio_rates() {
        for rate in [44_100, 48_000, 96_000] {
            let mut limiter = Limiter::new(rate, 2);
            let mut over = vec![1.2, -1.1];
            limiter.process(&mut over);
            assert!(limiter.gain() < 1.0);

            // 3 s of quiet is 30 release time constants
            let mut quiet = vec![0.5f32; rate as usize * 3 * 2];
            limiter.process(&mut quiet);
            assert_eq!(limiter.gain(), 1.0, "gain stuck at {} Hz", rate);

            let mut after = vec![0.5f32; 64];
            limiter.process(&mut after);
            assert!(after.iter().all(|&s| s == 0.5));
        }
    }
}
