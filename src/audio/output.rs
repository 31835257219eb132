// Audio output callback engine
// `Renderer` is the only code that runs on the device's real-time thread:
// it drains the frame ring, applies volume, advances the playback position
// and refreshes the visualization snapshot. It never locks or allocates.
// `OutputEngine` owns the platform stream and its state machine.

use cpal::{FromSample, SizedSample};
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU16, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;

use super::backend::{AudioBackend, OutputStream};
use super::ring::{ReadStatus, RingConsumer};
use super::visualizer::{VisualizationSnapshot, Visualizer};
use crate::error::{EngineError, EngineResult};
use crate::state::{OutputFormat, SharedConfig};

/// Upper bound on samples converted per pass for non-float devices
const SCRATCH_SAMPLES: usize = 8192;

/// Counters shared by the renderer and the transport. One instance lives
/// for the whole player; every new stream renders into it.
#[derive(Debug)]
pub struct OutputTelemetry {
    position_frames: AtomicU64,
    duration_ms: AtomicI64,
    sample_rate: AtomicU32,
    channels: AtomicU16,
    /// Gate for the renderer; cleared means emit silence and consume nothing
    running: AtomicBool,
    completed: AtomicBool,
    device_error: AtomicBool,
    underruns: AtomicU64,
    visualization: Arc<VisualizationSnapshot>,
}

impl OutputTelemetry {
    pub fn new() -> Self {
        Self {
            position_frames: AtomicU64::new(0),
            duration_ms: AtomicI64::new(0),
            sample_rate: AtomicU32::new(0),
            channels: AtomicU16::new(0),
            running: AtomicBool::new(false),
            completed: AtomicBool::new(false),
            device_error: AtomicBool::new(false),
            underruns: AtomicU64::new(0),
            visualization: Arc::new(VisualizationSnapshot::default()),
        }
    }

    pub fn format(&self) -> OutputFormat {
        OutputFormat {
            sample_rate: self.sample_rate.load(Ordering::Acquire),
            channels: self.channels.load(Ordering::Acquire),
        }
    }

    pub fn set_format(&self, format: OutputFormat) {
        self.sample_rate.store(format.sample_rate, Ordering::Release);
        self.channels.store(format.channels, Ordering::Release);
    }

    /// Frames emitted to the device since the last load/seek
    pub fn position_frames(&self) -> u64 {
        self.position_frames.load(Ordering::Acquire)
    }

    pub fn set_position_frames(&self, frames: u64) {
        self.position_frames.store(frames, Ordering::Release);
    }

    /// Playback position in ms, never past the track duration when the
    /// duration is known
    pub fn position_ms(&self) -> i64 {
        let position = self.format().frames_to_ms(self.position_frames());
        match self.duration_ms() {
            duration if duration > 0 => position.min(duration),
            _ => position,
        }
    }

    pub fn duration_ms(&self) -> i64 {
        self.duration_ms.load(Ordering::Acquire)
    }

    pub fn set_duration_ms(&self, ms: i64) {
        self.duration_ms.store(ms.max(0), Ordering::Release);
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    pub fn set_running(&self, running: bool) {
        self.running.store(running, Ordering::Release);
    }

    /// True once after the renderer emitted the last frame of the track
    pub fn take_completed(&self) -> bool {
        self.completed.swap(false, Ordering::AcqRel)
    }

    pub fn clear_completed(&self) {
        self.completed.store(false, Ordering::Release);
    }

    pub fn report_device_error(&self) {
        self.device_error.store(true, Ordering::Release);
    }

    pub fn take_device_error(&self) -> bool {
        self.device_error.swap(false, Ordering::AcqRel)
    }

    pub fn underruns(&self) -> u64 {
        self.underruns.load(Ordering::Relaxed)
    }

    pub fn visualization(&self) -> Arc<VisualizationSnapshot> {
        self.visualization.clone()
    }

    /// Forget everything about the previous track
    pub fn reset(&self) {
        self.set_running(false);
        self.set_position_frames(0);
        self.set_duration_ms(0);
        self.completed.store(false, Ordering::Release);
        self.underruns.store(0, Ordering::Relaxed);
        self.visualization.clear();
    }
}

impl Default for OutputTelemetry {
    fn default() -> Self {
        Self::new()
    }
}

/// Real-time side of the output engine
pub struct Renderer {
    consumer: RingConsumer,
    telemetry: Arc<OutputTelemetry>,
    config: Arc<SharedConfig>,
    visualizer: Visualizer,
    scratch: Vec<f32>,
}

impl Renderer {
    pub fn new(
        consumer: RingConsumer,
        format: OutputFormat,
        telemetry: Arc<OutputTelemetry>,
        config: Arc<SharedConfig>,
    ) -> Self {
        let visualizer = Visualizer::new(format.sample_rate, telemetry.visualization());
        let channels = consumer.channels();
        Self {
            consumer,
            telemetry,
            config,
            visualizer,
            scratch: vec![0.0; (SCRATCH_SAMPLES / channels).max(1) * channels],
        }
    }

    pub fn channels(&self) -> usize {
        self.consumer.channels()
    }

    /// Fill a float device buffer
    pub fn render(&mut self, out: &mut [f32]) {
        self.render_chunk(out);
    }

    /// Fill a device buffer of any sample type through the scratch buffer
    pub fn render_into<T>(&mut self, out: &mut [T])
    where
        T: SizedSample + FromSample<f32>,
    {
        let mut scratch = std::mem::take(&mut self.scratch);
        let mut starved = false;

        for chunk in out.chunks_mut(scratch.len()) {
            let samples = &mut scratch[..chunk.len()];
            if starved {
                // One underrun per callback; the rest of this buffer is silence
                samples.fill(0.0);
            } else {
                starved = !self.render_chunk(samples);
            }
            for (dst, &src) in chunk.iter_mut().zip(samples.iter()) {
                *dst = T::from_sample(src);
            }
        }

        self.scratch = scratch;
    }

    /// Returns false when the ring could not fill the whole chunk
    fn render_chunk(&mut self, out: &mut [f32]) -> bool {
        if !self.telemetry.is_running() {
            out.fill(0.0);
            return false;
        }

        let channels = self.consumer.channels();
        let outcome = self.consumer.read(out);
        let emitted = &mut out[..outcome.frames_read * channels];

        let volume = self.config.volume();
        if volume != 1.0 {
            emitted.iter_mut().for_each(|s| *s *= volume);
        }

        self.telemetry
            .position_frames
            .fetch_add(outcome.frames_read as u64, Ordering::AcqRel);
        self.visualizer.analyze(emitted, channels);

        match outcome.status {
            ReadStatus::Full => true,
            ReadStatus::Underrun => {
                self.telemetry.underruns.fetch_add(1, Ordering::Relaxed);
                false
            }
            ReadStatus::Drained => {
                self.telemetry.set_running(false);
                self.telemetry.completed.store(true, Ordering::Release);
                false
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputState {
    Stopped,
    Starting,
    Running,
    Paused,
}

impl OutputState {
    pub fn as_str(&self) -> &'static str {
        match self {
            OutputState::Stopped => "stopped",
            OutputState::Starting => "starting",
            OutputState::Running => "running",
            OutputState::Paused => "paused",
        }
    }
}

/// Control side of one open output stream
pub struct OutputEngine {
    state: OutputState,
    stream: Option<Box<dyn OutputStream>>,
    telemetry: Arc<OutputTelemetry>,
    format: OutputFormat,
}

impl OutputEngine {
    /// Open the device stream. The stream comes up paused: the renderer
    /// emits silence until `start`.
    pub fn open(
        backend: &dyn AudioBackend,
        renderer: Renderer,
        format: OutputFormat,
        period_frames: u32,
        telemetry: Arc<OutputTelemetry>,
    ) -> EngineResult<Self> {
        let mut engine = Self {
            state: OutputState::Stopped,
            stream: None,
            telemetry,
            format,
        };

        engine.state = OutputState::Starting;
        engine.telemetry.set_running(false);
        match backend.open(format, period_frames, renderer, engine.telemetry.clone()) {
            Ok(stream) => {
                tracing::info!(
                    "Opened {} output: {} Hz, {} ch, period {} frames",
                    backend.name(),
                    format.sample_rate,
                    format.channels,
                    period_frames
                );
                engine.stream = Some(stream);
                engine.state = OutputState::Paused;
                Ok(engine)
            }
            Err(e) => {
                tracing::error!("Failed to open output stream: {}", e);
                engine.state = OutputState::Stopped;
                Err(match e {
                    err @ EngineError::DeviceUnavailable(_) => err,
                    other => EngineError::DeviceUnavailable(other.to_string()),
                })
            }
        }
    }

    pub fn state(&self) -> OutputState {
        self.state
    }

    pub fn format(&self) -> OutputFormat {
        self.format
    }

    pub fn start(&mut self) -> EngineResult<()> {
        let Some(stream) = self.stream.as_mut() else {
            return Err(EngineError::InvalidState {
                op: "start output",
                state: self.state.as_str(),
            });
        };
        if self.state == OutputState::Running {
            return Ok(());
        }

        self.telemetry.set_running(true);
        if let Err(e) = stream.play() {
            self.telemetry.set_running(false);
            return Err(e);
        }
        self.state = OutputState::Running;
        Ok(())
    }

    pub fn pause(&mut self) {
        self.telemetry.set_running(false);
        if let Some(stream) = self.stream.as_mut() {
            if self.state == OutputState::Running {
                if let Err(e) = stream.pause() {
                    // The renderer is gated, so the device just plays silence
                    tracing::warn!("Output stream did not pause: {}", e);
                }
            }
            self.state = OutputState::Paused;
        }
    }

    /// Close the device stream
    pub fn stop(&mut self) {
        self.telemetry.set_running(false);
        if self.stream.take().is_some() {
            tracing::debug!("Closed output stream");
        }
        self.state = OutputState::Stopped;
    }
}

impl Drop for OutputEngine {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::ring::frame_ring;

    type Harness = (
        crate::audio::ring::RingProducer,
        Renderer,
        Arc<OutputTelemetry>,
        Arc<SharedConfig>,
    );

    fn renderer(capacity: usize) -> Harness {
        let format = OutputFormat { sample_rate: 48_000, channels: 2 };
        let (producer, consumer) = frame_ring(capacity, 2);
        let telemetry = Arc::new(OutputTelemetry::new());
        telemetry.set_format(format);
        telemetry.set_duration_ms(60_000);
        let config = Arc::new(SharedConfig::default());
        let renderer = Renderer::new(consumer, format, telemetry.clone(), config.clone());
        (producer, renderer, telemetry, config)
    }

    #[test]
    fn test_paused_renderer_emits_silence_without_consuming() {
        let (mut producer, mut renderer, telemetry, _) = renderer(64);
        producer.try_write(&[0.5; 32]);

        let mut out = [1.0f32; 16];
        renderer.render(&mut out);
        assert!(out.iter().all(|&s| s == 0.0));
        assert_eq!(producer.buffered_frames(), 16);
        assert_eq!(telemetry.position_frames(), 0);
        assert_eq!(telemetry.underruns(), 0);
    }

    #[test]
    fn test_position_advances_by_emitted_frames() {
        let (mut producer, mut renderer, telemetry, config) = renderer(64);
        producer.try_write(&[0.5; 20]);
        config.set_volume(0.5);
        telemetry.set_running(true);

        let mut out = [0.0f32; 16];
        renderer.render(&mut out);
        assert_eq!(telemetry.position_frames(), 8);
        assert!(out.iter().all(|&s| s == 0.25));

        // Only 2 frames left: short read counts one underrun
        renderer.render(&mut out);
        assert_eq!(telemetry.position_frames(), 10);
        assert_eq!(telemetry.underruns(), 1);
        assert_eq!(&out[4..], &[0.0; 12]);
    }

    #[test]
    fn test_position_is_clamped_only_to_a_known_duration() {
        let telemetry = OutputTelemetry::new();
        telemetry.set_format(OutputFormat { sample_rate: 48_000, channels: 2 });
        telemetry.set_position_frames(96_000);

        // Streams without a length in the header still report progress
        assert_eq!(telemetry.position_ms(), 2_000);

        telemetry.set_duration_ms(1_500);
        assert_eq!(telemetry.position_ms(), 1_500);
    }

    #[test]
    fn test_starved_callbacks_count_once_each() {
        let (_producer, mut renderer, telemetry, _) = renderer(64);
        telemetry.set_running(true);

        // i16 device with a buffer far larger than one scratch pass
        let mut out = vec![7i16; SCRATCH_SAMPLES * 3];
        for expected in 1..=4 {
            renderer.render_into(&mut out);
            assert!(out.iter().all(|&s| s == 0));
            assert_eq!(telemetry.underruns(), expected);
        }
    }

    #[test]
    fn test_drained_ring_reports_completion() {
        let (mut producer, mut renderer, telemetry, _) = renderer(64);
        producer.try_write(&[0.1; 8]);
        producer.finish();
        telemetry.set_running(true);

        let mut out = [0.0f32; 16];
        renderer.render(&mut out);
        assert!(telemetry.take_completed());
        assert!(!telemetry.is_running());
        assert_eq!(telemetry.underruns(), 0);
        assert_eq!(telemetry.position_frames(), 4);
    }
}
