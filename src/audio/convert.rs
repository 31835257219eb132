// Resampler and format converter
// Brings decoded frames to the device's sample rate and channel count, and
// quantizes to the configured bit depth as the very last step.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rubato::{
    Resampler, SincFixedIn, SincInterpolationParameters, SincInterpolationType, WindowFunction,
};
use serde::{Deserialize, Serialize};

use crate::error::{EngineError, EngineResult};
use crate::state::OutputFormat;

/// Input frames handed to the sinc resampler per call
const RESAMPLER_CHUNK_FRAMES: usize = 1024;

const MINUS_3DB: f32 = std::f32::consts::FRAC_1_SQRT_2;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ResamplerQuality {
    Low,
    #[default]
    #[serde(alias = "std")]
    Standard,
    #[serde(alias = "hq")]
    High,
    Best,
}

fn sinc_params(quality: ResamplerQuality, ratio: f64) -> SincInterpolationParameters {
    let f_cutoff = if ratio < 1.0 { 0.90 } else { 0.95 };
    match quality {
        ResamplerQuality::Low => SincInterpolationParameters {
            sinc_len: 64,
            f_cutoff,
            interpolation: SincInterpolationType::Linear,
            oversampling_factor: 64,
            window: WindowFunction::Hann,
        },
        ResamplerQuality::Standard => SincInterpolationParameters {
            sinc_len: 128,
            f_cutoff,
            interpolation: SincInterpolationType::Linear,
            oversampling_factor: 128,
            window: WindowFunction::Blackman,
        },
        ResamplerQuality::High => SincInterpolationParameters {
            sinc_len: 256,
            f_cutoff,
            interpolation: SincInterpolationType::Linear,
            oversampling_factor: 256,
            window: WindowFunction::BlackmanHarris2,
        },
        ResamplerQuality::Best => SincInterpolationParameters {
            sinc_len: 512,
            f_cutoff,
            interpolation: SincInterpolationType::Cubic,
            oversampling_factor: 512,
            window: WindowFunction::BlackmanHarris2,
        },
    }
}

/// Streaming converter from a track's native format to the output format.
/// Interpolation history lives in the resampler, so chunk boundaries of the
/// input never show up in the output.
pub struct FormatConverter {
    in_channels: usize,
    out_channels: usize,
    in_rate: u32,
    out_rate: u32,
    resampler: Option<SincFixedIn<f32>>,
    /// Remixed input waiting for a full resampler chunk, one Vec per channel
    pending: Vec<Vec<f32>>,
    output: Vec<Vec<f32>>,
    remixed: Vec<f32>,
    frames_in: u64,
    frames_out: u64,
}

impl FormatConverter {
    pub fn new(
        in_rate: u32,
        in_channels: usize,
        out: OutputFormat,
        quality: ResamplerQuality,
    ) -> EngineResult<Self> {
        if in_rate == 0 || in_channels == 0 || out.sample_rate == 0 || out.channels == 0 {
            return Err(EngineError::UnsupportedFormat(format!(
                "Cannot convert {} Hz/{} ch to {} Hz/{} ch",
                in_rate, in_channels, out.sample_rate, out.channels
            )));
        }

        let out_channels = out.channels as usize;
        let ratio = out.sample_rate as f64 / in_rate as f64;
        let resampler = if in_rate == out.sample_rate {
            None
        } else {
            let params = sinc_params(quality, ratio);
            let resampler =
                SincFixedIn::<f32>::new(ratio, 2.0, params, RESAMPLER_CHUNK_FRAMES, out_channels)
                    .map_err(|e| {
                        EngineError::UnsupportedFormat(format!("Resampler init failed: {}", e))
                    })?;
            Some(resampler)
        };

        let output = match &resampler {
            Some(r) => vec![vec![0.0; r.output_frames_max()]; out_channels],
            None => Vec::new(),
        };

        Ok(Self {
            in_channels,
            out_channels,
            in_rate,
            out_rate: out.sample_rate,
            resampler,
            pending: vec![Vec::with_capacity(RESAMPLER_CHUNK_FRAMES * 2); out_channels],
            output,
            remixed: Vec::new(),
            frames_in: 0,
            frames_out: 0,
        })
    }

    pub fn is_passthrough(&self) -> bool {
        self.resampler.is_none() && self.in_channels == self.out_channels
    }

    /// Convert interleaved input frames, appending to `out`
    pub fn process(&mut self, input: &[f32], out: &mut Vec<f32>) -> EngineResult<()> {
        let frames = input.len() / self.in_channels;
        self.frames_in += frames as u64;

        if self.resampler.is_none() {
            let before = out.len();
            remix(&input[..frames * self.in_channels], self.in_channels, self.out_channels, out);
            self.frames_out += ((out.len() - before) / self.out_channels) as u64;
            return Ok(());
        }

        self.remixed.clear();
        remix(
            &input[..frames * self.in_channels],
            self.in_channels,
            self.out_channels,
            &mut self.remixed,
        );
        for frame in self.remixed.chunks_exact(self.out_channels) {
            for (ch, &sample) in frame.iter().enumerate() {
                self.pending[ch].push(sample);
            }
        }

        self.run_full_chunks(out)
    }

    /// Push out whatever is still inside the resampler (end of stream)
    pub fn flush(&mut self, out: &mut Vec<f32>) -> EngineResult<()> {
        let Some(resampler) = self.resampler.as_mut() else {
            return Ok(());
        };

        let mut tail: Vec<Vec<f32>> = Vec::new();
        if !self.pending[0].is_empty() {
            let partial = resampler
                .process_partial(Some(self.pending.as_slice()), None)
                .map_err(|e| EngineError::CorruptStream(format!("Resampler failed: {}", e)))?;
            tail.push(interleave(&partial));
            for channel in &mut self.pending {
                channel.clear();
            }
        }
        let drained = resampler
            .process_partial::<Vec<f32>>(None, None)
            .map_err(|e| EngineError::CorruptStream(format!("Resampler failed: {}", e)))?;
        tail.push(interleave(&drained));

        // Never emit more than the input length scaled by the ratio
        let expected = (self.frames_in * self.out_rate as u64).div_ceil(self.in_rate as u64);
        for block in tail {
            let room = expected.saturating_sub(self.frames_out) as usize;
            let frames = (block.len() / self.out_channels).min(room);
            out.extend_from_slice(&block[..frames * self.out_channels]);
            self.frames_out += frames as u64;
        }
        Ok(())
    }

    /// Forget all history (after a seek)
    pub fn reset(&mut self) {
        if let Some(resampler) = self.resampler.as_mut() {
            resampler.reset();
        }
        for channel in &mut self.pending {
            channel.clear();
        }
        self.frames_in = 0;
        self.frames_out = 0;
    }

    fn run_full_chunks(&mut self, out: &mut Vec<f32>) -> EngineResult<()> {
        let Some(resampler) = self.resampler.as_mut() else {
            return Ok(());
        };

        loop {
            let needed = resampler.input_frames_next();
            if self.pending[0].len() < needed {
                return Ok(());
            }

            let wave_in: Vec<&[f32]> = self.pending.iter().map(|c| &c[..needed]).collect();
            let (used, produced) = resampler
                .process_into_buffer(&wave_in[..], &mut self.output[..], None)
                .map_err(|e| EngineError::CorruptStream(format!("Resampler failed: {}", e)))?;

            for channel in &mut self.pending {
                channel.drain(..used);
            }

            out.reserve(produced * self.out_channels);
            for i in 0..produced {
                for channel in &self.output {
                    out.push(channel[i]);
                }
            }
            self.frames_out += produced as u64;
        }
    }
}

fn interleave(planar: &[Vec<f32>]) -> Vec<f32> {
    let frames = planar.first().map_or(0, |c| c.len());
    let mut out = Vec::with_capacity(frames * planar.len());
    for i in 0..frames {
        for channel in planar {
            out.push(channel[i]);
        }
    }
    out
}

/// Per-input-channel (left, right) weights for folding down to stereo
fn stereo_weights(channel: usize, in_channels: usize) -> (f32, f32) {
    match (in_channels, channel) {
        (_, 0) => (1.0, 0.0),
        (_, 1) => (0.0, 1.0),
        // quad: FL FR RL RR
        (4, 2) => (MINUS_3DB, 0.0),
        (4, 3) => (0.0, MINUS_3DB),
        // FL FR FC [LFE] RL RR ...
        (_, 2) => (MINUS_3DB, MINUS_3DB),
        (5, 3) => (MINUS_3DB, 0.0),
        (5, 4) => (0.0, MINUS_3DB),
        (_, 3) => (0.0, 0.0),
        (_, 4) => (MINUS_3DB, 0.0),
        (_, 5) => (0.0, MINUS_3DB),
        (_, n) if n % 2 == 0 => (0.5, 0.0),
        _ => (0.0, 0.5),
    }
}

/// Standard channel matrixing between any input layout and mono/stereo
pub fn remix(input: &[f32], in_channels: usize, out_channels: usize, out: &mut Vec<f32>) {
    if in_channels == out_channels {
        out.extend_from_slice(input);
        return;
    }

    let frames = input.len() / in_channels;
    out.reserve(frames * out_channels);

    for frame in input.chunks_exact(in_channels) {
        let (left, right) = if in_channels == 1 {
            (frame[0], frame[0])
        } else {
            frame.iter().enumerate().fold((0.0, 0.0), |(l, r), (ch, &s)| {
                let (wl, wr) = stereo_weights(ch, in_channels);
                (l + s * wl, r + s * wr)
            })
        };

        match out_channels {
            1 => out.push(0.5 * (left + right)),
            2 => {
                out.push(left);
                out.push(right);
            }
            n => {
                // Front pair carries the signal, remaining outputs stay silent
                out.push(left);
                out.push(right);
                out.extend(std::iter::repeat(0.0).take(n - 2));
            }
        }
    }
}

/// Bit-depth reduction with TPDF dither
pub struct Quantizer {
    rng: StdRng,
}

impl Quantizer {
    pub fn new() -> Self {
        Self {
            rng: StdRng::seed_from_u64(0x5eed_d17e),
        }
    }

    /// Quantize in place to `bits`; 32 bits is float output and is left alone
    pub fn process(&mut self, samples: &mut [f32], bits: u32) {
        if bits >= 32 || bits < 8 {
            return;
        }
        let lsb = 1.0 / (1u64 << (bits - 1)) as f32;
        let max = 1.0 - lsb;
        for sample in samples.iter_mut() {
            let noise = (self.rng.gen::<f32>() - self.rng.gen::<f32>()) * lsb;
            let dithered = (*sample + noise).clamp(-1.0, max);
            *sample = (dithered / lsb).round() * lsb;
        }
    }
}

impl Default for Quantizer {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    fn sine(frames: usize, rate: u32, freq: f32, channels: usize) -> Vec<f32> {
        let mut out = Vec::with_capacity(frames * channels);
        for n in 0..frames {
            let v = 0.5 * (2.0 * std::f32::consts::PI * freq * n as f32 / rate as f32).sin();
            out.extend(std::iter::repeat(v).take(channels));
        }
        out
    }

    #[test]
    fn test_mono_to_stereo_duplicates() {
        let mut out = Vec::new();
        remix(&[0.1, -0.2], 1, 2, &mut out);
        assert_eq!(out, vec![0.1, 0.1, -0.2, -0.2]);
    }

    #[test]
    fn test_stereo_to_mono_averages() {
        let mut out = Vec::new();
        remix(&[0.2, 0.4, -1.0, 1.0], 2, 1, &mut out);
        assert_abs_diff_eq!(out[0], 0.3, epsilon = 1e-6);
        assert_abs_diff_eq!(out[1], 0.0, epsilon = 1e-6);
    }

    #[test]
    fn test_surround_folds_center_into_both_sides() {
        let mut out = Vec::new();
        // FL FR FC LFE RL RR
        remix(&[0.0, 0.0, 1.0, 1.0, 0.0, 0.0], 6, 2, &mut out);
        assert_abs_diff_eq!(out[0], MINUS_3DB, epsilon = 1e-6);
        assert_abs_diff_eq!(out[1], MINUS_3DB, epsilon = 1e-6);
    }

    #[test]
    fn test_same_format_is_passthrough() {
        let out_format = OutputFormat { sample_rate: 48_000, channels: 2 };
        let mut converter =
            FormatConverter::new(48_000, 2, out_format, ResamplerQuality::Low).unwrap();
        assert!(converter.is_passthrough());

        let input = sine(300, 48_000, 440.0, 2);
        let mut out = Vec::new();
        converter.process(&input, &mut out).unwrap();
        assert_eq!(out, input);
    }

    #[test]
    fn test_resampled_length_tracks_ratio() {
        let out_format = OutputFormat { sample_rate: 48_000, channels: 2 };
        let mut converter =
            FormatConverter::new(44_100, 2, out_format, ResamplerQuality::Standard).unwrap();

        let input = sine(44_100, 44_100, 1000.0, 2);
        let mut out = Vec::new();
        for chunk in input.chunks(2 * 517) {
            converter.process(chunk, &mut out).unwrap();
        }
        converter.flush(&mut out).unwrap();

        assert_eq!(out.len() / 2, 48_000);
    }

    #[test]
    fn test_chunk_boundaries_are_click_free() {
        let out_format = OutputFormat { sample_rate: 48_000, channels: 1 };
        let mut converter =
            FormatConverter::new(44_100, 1, out_format, ResamplerQuality::High).unwrap();

        // Irregular input chunks
        let input = sine(44_100, 44_100, 1000.0, 1);
        let mut out = Vec::new();
        let mut offset = 0;
        for size in [1usize, 7, 1023, 1024, 1025, 300, 4096].iter().cycle() {
            if offset >= input.len() {
                break;
            }
            let end = (offset + size).min(input.len());
            converter.process(&input[offset..end], &mut out).unwrap();
            offset = end;
        }

        // A 1 kHz sine at 0.5 amplitude moves at most ~0.066 per sample at 48 kHz
        let max_step = 2.0 * std::f32::consts::PI * 1000.0 / 48_000.0 * 0.5;
        // Skip the resampler's ramp-in
        for pair in out[512..].windows(2) {
            assert!((pair[1] - pair[0]).abs() < max_step * 1.2);
        }
    }

    #[test]
    fn test_quantizer_hits_the_grid() {
        let mut quantizer = Quantizer::new();
        let mut samples = sine(1000, 44_100, 440.0, 1);
        quantizer.process(&mut samples, 16);

        let lsb = 1.0 / 32768.0;
        for &s in &samples {
            let steps = s / lsb;
            assert_abs_diff_eq!(steps, steps.round(), epsilon = 1e-3);
            assert!((-1.0..1.0).contains(&s));
        }
    }

    #[test]
    fn test_float_output_is_not_quantized() {
        let mut quantizer = Quantizer::new();
        let original = sine(100, 44_100, 440.0, 1);
        let mut samples = original.clone();
        quantizer.process(&mut samples, 32);
        assert_eq!(samples, original);
    }
}
