// Spectrum snapshot for the UI
// The renderer feeds every emitted buffer through `Visualizer`, which keeps
// the last FFT_SIZE mono samples and publishes 20 log-spaced band levels.
// Everything is allocated up front; `analyze` is safe on the audio thread.

use rustfft::num_complex::Complex;
use rustfft::{Fft, FftPlanner};
use std::ops::Range;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use crate::state::{AtomicF32, VISUALIZATION_BINS};

pub const FFT_SIZE: usize = 1024;

const MIN_FREQ_HZ: f32 = 20.0;
const FLOOR_DB: f32 = -90.0;

/// Latest band levels in [0, 1], readable from any thread
#[derive(Debug, Default)]
pub struct VisualizationSnapshot {
    bins: [AtomicF32; VISUALIZATION_BINS],
}

impl VisualizationSnapshot {
    pub fn load(&self) -> [f32; VISUALIZATION_BINS] {
        std::array::from_fn(|i| self.bins[i].load(Ordering::Relaxed))
    }

    pub fn clear(&self) {
        for bin in &self.bins {
            bin.store(0.0, Ordering::Relaxed);
        }
    }

    fn publish(&self, levels: &[f32; VISUALIZATION_BINS]) {
        for (bin, &level) in self.bins.iter().zip(levels) {
            bin.store(level, Ordering::Relaxed);
        }
    }
}

pub struct Visualizer {
    fft: Arc<dyn Fft<f32>>,
    window: Vec<f32>,
    /// Circular history of mono samples
    history: Vec<f32>,
    write_pos: usize,
    spectrum: Vec<Complex<f32>>,
    scratch: Vec<Complex<f32>>,
    /// FFT bins feeding each band; never empty unless the rate is below 40 Hz
    band_bins: [Range<usize>; VISUALIZATION_BINS],
    levels: [f32; VISUALIZATION_BINS],
    snapshot: Arc<VisualizationSnapshot>,
}

impl Visualizer {
    pub fn new(sample_rate: u32, snapshot: Arc<VisualizationSnapshot>) -> Self {
        let mut planner = FftPlanner::new();
        let fft = planner.plan_fft_forward(FFT_SIZE);
        let scratch = vec![Complex::new(0.0, 0.0); fft.get_inplace_scratch_len()];

        let window = (0..FFT_SIZE)
            .map(|i| 0.5 - 0.5 * (2.0 * std::f32::consts::PI * i as f32 / FFT_SIZE as f32).cos())
            .collect();

        Self {
            fft,
            window,
            history: vec![0.0; FFT_SIZE],
            write_pos: 0,
            spectrum: vec![Complex::new(0.0, 0.0); FFT_SIZE],
            scratch,
            band_bins: band_bins(sample_rate),
            levels: [0.0; VISUALIZATION_BINS],
            snapshot,
        }
    }

    pub fn snapshot(&self) -> Arc<VisualizationSnapshot> {
        self.snapshot.clone()
    }

    /// Take in the frames just emitted and publish a fresh snapshot
    pub fn analyze(&mut self, frames: &[f32], channels: usize) {
        let channels = channels.max(1);
        let scale = 1.0 / channels as f32;
        for frame in frames.chunks_exact(channels) {
            self.history[self.write_pos] = frame.iter().sum::<f32>() * scale;
            self.write_pos = (self.write_pos + 1) % FFT_SIZE;
        }

        // Oldest sample first
        for i in 0..FFT_SIZE {
            let sample = self.history[(self.write_pos + i) % FFT_SIZE];
            self.spectrum[i] = Complex::new(sample * self.window[i], 0.0);
        }
        self.fft.process_with_scratch(&mut self.spectrum, &mut self.scratch);

        self.levels.fill(0.0);
        // A full-scale sine through a Hann window peaks at FFT_SIZE / 4
        let norm = 4.0 / FFT_SIZE as f32;
        for (level, bins) in self.levels.iter_mut().zip(&self.band_bins) {
            *level = self.spectrum[bins.clone()]
                .iter()
                .fold(0.0f32, |peak, bin| peak.max(bin.norm() * norm));
        }
        for level in self.levels.iter_mut() {
            let db = 20.0 * (*level + 1e-9).log10();
            *level = ((db - FLOOR_DB) / -FLOOR_DB).clamp(0.0, 1.0);
        }

        self.snapshot.publish(&self.levels);
    }
}

/// Split 20 Hz..nyquist into log-spaced bands. Low bands narrower than one
/// FFT bin take the bin nearest their center, so several may share it.
fn band_bins(sample_rate: u32) -> [Range<usize>; VISUALIZATION_BINS] {
    let nyquist = sample_rate as f32 / 2.0;
    if nyquist <= MIN_FREQ_HZ {
        return std::array::from_fn(|_| 0..0);
    }

    let resolution = sample_rate as f32 / FFT_SIZE as f32;
    let last_bin = FFT_SIZE / 2 - 1;
    let log_min = MIN_FREQ_HZ.log10();
    let span = nyquist.log10() - log_min;
    let edge = |band: usize| 10f32.powf(log_min + span * band as f32 / VISUALIZATION_BINS as f32);

    std::array::from_fn(|band| {
        let (low, high) = (edge(band), edge(band + 1));
        let start = ((low / resolution).ceil() as usize).clamp(1, last_bin + 1);
        let end = ((high / resolution).ceil() as usize).clamp(1, last_bin + 1);
        if start < end {
            return start..end;
        }
        let nearest = ((low * high).sqrt() / resolution).round() as usize;
        let nearest = nearest.clamp(1, last_bin);
        nearest..nearest + 1
    })
}
