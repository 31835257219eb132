// 10-band graphic equalizer
// RBJ peaking biquads in transposed direct form II, one filter state per
// band and channel. Flat bands cost nothing.

use std::f64::consts::PI;

use crate::state::EQ_BANDS;

/// Center frequency of each band in Hz
pub const EQ_FREQUENCIES_HZ: [f64; EQ_BANDS] = [
    31.0, 62.0, 125.0, 250.0, 500.0, 1_000.0, 2_000.0, 4_000.0, 8_000.0, 16_000.0,
];

/// Roughly one octave wide
pub const EQ_Q: f64 = 1.41;

/// Bands this close to Nyquist cannot be realized and are skipped
const MAX_BAND_FRACTION: f64 = 0.45;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BiquadCoeffs {
    pub b0: f64,
    pub b1: f64,
    pub b2: f64,
    pub a1: f64,
    pub a2: f64,
}

impl BiquadCoeffs {
    pub const IDENTITY: Self = Self {
        b0: 1.0,
        b1: 0.0,
        b2: 0.0,
        a1: 0.0,
        a2: 0.0,
    };

    /// Peaking EQ coefficients, normalized by a0
    pub fn peaking(freq: f64, q: f64, gain_db: f64, sample_rate: f64) -> Self {
        let a = 10.0_f64.powf(gain_db / 40.0);
        let omega = 2.0 * PI * freq / sample_rate;
        let sin_omega = omega.sin();
        let cos_omega = omega.cos();
        let alpha = sin_omega / (2.0 * q);

        let b0 = 1.0 + alpha * a;
        let b1 = -2.0 * cos_omega;
        let b2 = 1.0 - alpha * a;
        let a0 = 1.0 + alpha / a;
        let a1 = -2.0 * cos_omega;
        let a2 = 1.0 - alpha / a;

        Self {
            b0: b0 / a0,
            b1: b1 / a0,
            b2: b2 / a0,
            a1: a1 / a0,
            a2: a2 / a0,
        }
    }

    /// Magnitude response in dB at `freq`
    pub fn magnitude_db(&self, freq: f64, sample_rate: f64) -> f64 {
        let w = 2.0 * PI * freq / sample_rate;
        let (c1, s1) = (w.cos(), w.sin());
        let (c2, s2) = ((2.0 * w).cos(), (2.0 * w).sin());

        let num_re = self.b0 + self.b1 * c1 + self.b2 * c2;
        let num_im = -(self.b1 * s1 + self.b2 * s2);
        let den_re = 1.0 + self.a1 * c1 + self.a2 * c2;
        let den_im = -(self.a1 * s1 + self.a2 * s2);

        let num = (num_re * num_re + num_im * num_im).sqrt();
        let den = (den_re * den_re + den_im * den_im).sqrt();
        20.0 * (num / den).log10()
    }
}

#[derive(Debug, Clone)]
struct Band {
    coeffs: BiquadCoeffs,
    /// (z1, z2) per channel
    state: Vec<(f64, f64)>,
    active: bool,
}

impl Band {
    #[inline]
    fn tick(&mut self, channel: usize, input: f64) -> f64 {
        let c = &self.coeffs;
        let (z1, z2) = &mut self.state[channel];
        let output = c.b0 * input + *z1;
        *z1 = c.b1 * input - c.a1 * output + *z2;
        *z2 = c.b2 * input - c.a2 * output;
        output
    }
}

pub struct Equalizer {
    sample_rate: u32,
    channels: usize,
    gains_db: [f32; EQ_BANDS],
    bands: Vec<Band>,
}

impl Equalizer {
    pub fn new(sample_rate: u32, channels: usize) -> Self {
        let channels = channels.max(1);
        let bands = (0..EQ_BANDS)
            .map(|_| Band {
                coeffs: BiquadCoeffs::IDENTITY,
                state: vec![(0.0, 0.0); channels],
                active: false,
            })
            .collect();

        Self {
            sample_rate,
            channels,
            gains_db: [0.0; EQ_BANDS],
            bands,
        }
    }

    pub fn gains_db(&self) -> [f32; EQ_BANDS] {
        self.gains_db
    }

    pub fn is_flat(&self) -> bool {
        self.bands.iter().all(|b| !b.active)
    }

    /// Recompute coefficients. Filter state is kept so a gain change mid-stream
    /// does not restart the filters.
    pub fn set_gains(&mut self, gains_db: &[f32; EQ_BANDS]) {
        self.gains_db = *gains_db;
        let rate = self.sample_rate as f64;

        for ((band, &gain), &freq) in self.bands.iter_mut().zip(gains_db).zip(&EQ_FREQUENCIES_HZ) {
            let audible = gain.abs() > f32::EPSILON && freq < rate * MAX_BAND_FRACTION;
            if audible {
                band.coeffs = BiquadCoeffs::peaking(freq, EQ_Q, gain as f64, rate);
            } else {
                band.coeffs = BiquadCoeffs::IDENTITY;
                band.state.fill((0.0, 0.0));
            }
            band.active = audible;
        }
    }

    /// Clear filter memory
    pub fn reset(&mut self) {
        for band in &mut self.bands {
            band.state.fill((0.0, 0.0));
        }
    }

    /// Filter interleaved frames in place
    pub fn process(&mut self, buffer: &mut [f32]) {
        if self.is_flat() {
            return;
        }

        for frame in buffer.chunks_exact_mut(self.channels) {
            for (channel, sample) in frame.iter_mut().enumerate() {
                let mut value = *sample as f64;
                for band in self.bands.iter_mut().filter(|b| b.active) {
                    value = band.tick(channel, value);
                }
                *sample = value as f32;
            }
        }
    }

    /// Combined response of all active bands at `freq`
    pub fn response_db(&self, freq: f64) -> f64 {
        let rate = self.sample_rate as f64;
        self.bands
            .iter()
            .filter(|b| b.active)
            .map(|b| b.coeffs.magnitude_db(freq, rate))
            .sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    fn sine(rate: u32, freq: f32, frames: usize) -> Vec<f32> {
        (0..frames)
            .map(|n| 0.25 * (2.0 * std::f32::consts::PI * freq * n as f32 / rate as f32).sin())
            .collect()
    }

    fn peak(samples: &[f32]) -> f32 {
        samples.iter().fold(0.0f32, |m, s| m.max(s.abs()))
    }

    #[test]
    fn test_peaking_gain_at_center() {
        let coeffs = BiquadCoeffs::peaking(1_000.0, EQ_Q, 6.0, 48_000.0);
        assert_abs_diff_eq!(coeffs.magnitude_db(1_000.0, 48_000.0), 6.0, epsilon = 0.01);
        // Far away from the band the response is close to flat
        assert!(coeffs.magnitude_db(16_000.0, 48_000.0).abs() < 0.2);
    }

    #[test]
    fn test_flat_equalizer_is_identity() {
        let mut eq = Equalizer::new(44_100, 2);
        eq.set_gains(&[0.0; EQ_BANDS]);
        let original = sine(44_100, 440.0, 2048);
        let mut buffer = original.clone();
        eq.process(&mut buffer);
        assert_eq!(buffer, original);
    }

    #[test]
    fn test_band_boost_raises_tone_by_six_db() {
        let mut gains = [0.0; EQ_BANDS];
        gains[5] = 6.0;
        let mut eq = Equalizer::new(48_000, 1);
        eq.set_gains(&gains);

        let mut buffer = sine(48_000, 1_000.0, 48_000);
        eq.process(&mut buffer);

        // Ignore the filter's settling time
        let gain_db = 20.0 * (peak(&buffer[24_000..]) / 0.25).log10();
        assert_abs_diff_eq!(gain_db, 6.0, epsilon = 0.1);
    }

    #[test]
    fn test_bands_near_nyquist_are_skipped() {
        let mut gains = [0.0; EQ_BANDS];
        gains[9] = 12.0;
        let mut eq = Equalizer::new(22_050, 2);
        eq.set_gains(&gains);
        assert!(eq.is_flat());
        assert_eq!(eq.response_db(1_000.0), 0.0);
    }
}
