// Decode worker
// Pulls frames from the track, converts them to the output format, runs the
// DSP chain and pushes the result into the frame ring. Runs until the track
// ends, an error occurs, or the transport raises the cancel flag. The thread
// hands its pipeline back on exit so the transport can reuse the open track.

use crossbeam_channel::Sender;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use super::convert::{FormatConverter, Quantizer};
use super::decoder::TrackHandle;
use super::ring::RingProducer;
use crate::dsp::DspChain;
use crate::error::{EngineError, EngineResult};
use crate::state::SharedConfig;

/// Source frames decoded per iteration
const DECODE_CHUNK_FRAMES: usize = 1024;

/// Sleep while the ring is full
const BACKOFF: Duration = Duration::from_millis(2);

/// Everything between the track and the ring for one output format
pub struct Pipeline {
    pub track: TrackHandle,
    pub converter: FormatConverter,
    pub dsp: DspChain,
    pub quantizer: Quantizer,
    pub producer: RingProducer,
}

impl Pipeline {
    /// Reposition at `frame` (source frames) and drop all buffered state
    pub fn seek(&mut self, frame: u64) -> EngineResult<()> {
        self.producer.request_flush();
        self.track.seek(frame)?;
        self.converter.reset();
        self.dsp.reset();
        Ok(())
    }
}

/// What the worker thread returns when joined
pub struct WorkerExit {
    pub pipeline: Pipeline,
    /// Set when the loop stopped on a decode failure
    pub error: Option<EngineError>,
}

/// Handle to a running decode worker
pub struct Worker {
    handle: JoinHandle<WorkerExit>,
    cancel: Arc<AtomicBool>,
}

impl Worker {
    /// Start filling the ring. `primed` fires once when the ring holds
    /// `prime_frames` frames, the track ended, or the loop failed.
    pub fn spawn(
        pipeline: Pipeline,
        config: Arc<SharedConfig>,
        prime_frames: usize,
        primed: Option<Sender<()>>,
    ) -> EngineResult<Self> {
        let cancel = Arc::new(AtomicBool::new(false));
        let flag = cancel.clone();

        let handle = thread::Builder::new()
            .name("pancake-decode".to_string())
            .spawn(move || run(pipeline, &config, &flag, prime_frames, primed))
            .map_err(|e| {
                EngineError::DeviceUnavailable(format!("Failed to spawn decode thread: {}", e))
            })?;

        Ok(Self { handle, cancel })
    }

    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }

    /// Wait for the thread to exit on its own
    pub fn join(self) -> EngineResult<WorkerExit> {
        self.handle
            .join()
            .map_err(|_| EngineError::CorruptStream("Decode thread panicked".to_string()))
    }

    /// Ask the thread to abandon its work and wait for it
    pub fn stop(self) -> EngineResult<WorkerExit> {
        self.cancel.store(true, Ordering::Release);
        self.join()
    }
}

fn run(
    mut pipeline: Pipeline,
    config: &SharedConfig,
    cancel: &AtomicBool,
    prime_frames: usize,
    mut primed: Option<Sender<()>>,
) -> WorkerExit {
    let channels = pipeline.producer.channels();
    let mut decoded = Vec::with_capacity(DECODE_CHUNK_FRAMES * pipeline.track.channels());
    let mut pending: Vec<f32> = Vec::new();
    let mut offset = 0;
    let mut end_of_stream = false;

    tracing::debug!("Decode worker started at frame {}", pipeline.track.position());

    loop {
        if cancel.load(Ordering::Acquire) {
            tracing::debug!("Decode worker cancelled");
            break;
        }

        if offset >= pending.len() {
            if end_of_stream {
                pipeline.producer.finish();
                signal_primed(&mut primed);
                tracing::debug!("Decode worker reached end of track");
                break;
            }

            pending.clear();
            offset = 0;
            match fill(&mut pipeline, config, &mut decoded, &mut pending) {
                Ok(more) => end_of_stream = !more,
                Err(e) => {
                    tracing::error!("Decode failed: {}", e);
                    signal_primed(&mut primed);
                    return WorkerExit {
                        pipeline,
                        error: Some(e),
                    };
                }
            }
            continue;
        }

        let written = pipeline.producer.try_write(&pending[offset..]);
        offset += written * channels;

        if primed.is_some() && pipeline.producer.buffered_frames() >= prime_frames {
            signal_primed(&mut primed);
        }
        if written == 0 {
            signal_primed(&mut primed);
            thread::sleep(BACKOFF);
        }
    }

    WorkerExit { pipeline, error: None }
}

fn signal_primed(primed: &mut Option<Sender<()>>) {
    if let Some(tx) = primed.take() {
        let _ = tx.send(());
    }
}

/// Decode, convert and process one chunk into `out`.
/// Returns false once the track is exhausted (the tail is still in `out`).
fn fill(
    pipeline: &mut Pipeline,
    config: &SharedConfig,
    decoded: &mut Vec<f32>,
    out: &mut Vec<f32>,
) -> EngineResult<bool> {
    decoded.clear();
    let frames = pipeline.track.read_frames(DECODE_CHUNK_FRAMES, decoded)?;
    let more = frames > 0;

    if more {
        pipeline.converter.process(decoded, out)?;
    } else {
        pipeline.converter.flush(out)?;
    }

    if !out.is_empty() {
        pipeline.dsp.process(out, config);
        pipeline.quantizer.process(out, config.bit_depth());
    }
    Ok(more)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::convert::ResamplerQuality;
    use crate::audio::decoder::tests::write_ramp_wav;
    use crate::audio::ring::{frame_ring, ReadStatus};
    use crate::state::OutputFormat;
    use crossbeam_channel::bounded;

    fn pipeline(
        path: &std::path::Path,
        ring_frames: usize,
    ) -> (Pipeline, crate::audio::ring::RingConsumer) {
        let track = TrackHandle::open(path).unwrap();
        let format = OutputFormat { sample_rate: 44_100, channels: 2 };
        let converter = FormatConverter::new(44_100, 2, format, ResamplerQuality::Low).unwrap();
        let (producer, consumer) = frame_ring(ring_frames, 2);
        let pipeline = Pipeline {
            track,
            converter,
            dsp: DspChain::new(44_100, 2),
            quantizer: Quantizer::new(),
            producer,
        };
        (pipeline, consumer)
    }

    #[test]
    fn test_worker_delivers_whole_track_then_finishes() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_ramp_wav(dir.path(), "ramp.wav", 44_100, 2, 10_000);
        let (pipeline, mut consumer) = pipeline(&path, 2048);

        let config = Arc::new(SharedConfig::default());
        let worker = Worker::spawn(pipeline, config, 1024, None).unwrap();

        let mut out = vec![0.0f32; 512 * 2];
        let mut frames = 0;
        loop {
            let outcome = consumer.read(&mut out);
            frames += outcome.frames_read;
            if outcome.status == ReadStatus::Drained {
                break;
            }
            if outcome.frames_read == 0 {
                thread::sleep(Duration::from_millis(1));
            }
        }

        let exit = worker.join().unwrap();
        assert!(exit.error.is_none());
        assert_eq!(frames, 10_000);
    }

    #[test]
    fn test_float_output_without_eq_matches_decoded_track() {
        use crate::audio::output::{OutputTelemetry, Renderer};

        let dir = tempfile::tempdir().unwrap();
        let path = write_ramp_wav(dir.path(), "ramp.wav", 44_100, 2, 20_000);
        let mut expected = Vec::new();
        TrackHandle::open(&path).unwrap().read_frames(usize::MAX, &mut expected).unwrap();

        let (pipeline, consumer) = pipeline(&path, 4096);
        let config = Arc::new(SharedConfig::default());
        config.set_bit_depth(32);
        let format = OutputFormat { sample_rate: 44_100, channels: 2 };
        let telemetry = Arc::new(OutputTelemetry::new());
        telemetry.set_format(format);
        let mut renderer = Renderer::new(consumer, format, telemetry.clone(), config.clone());
        telemetry.set_running(true);

        let worker = Worker::spawn(pipeline, config, 1024, None).unwrap();
        let mut rendered = Vec::new();
        let mut buffer = vec![0.0f32; 480 * 2];
        while !telemetry.take_completed() {
            let before = telemetry.position_frames();
            renderer.render(&mut buffer);
            let emitted = (telemetry.position_frames() - before) as usize;
            rendered.extend_from_slice(&buffer[..emitted * 2]);
            if emitted == 0 {
                thread::sleep(Duration::from_millis(1));
            }
        }

        assert!(worker.join().unwrap().error.is_none());
        assert_eq!(rendered.len(), expected.len());
        assert_eq!(rendered, expected);
    }

    #[test]
    fn test_cancel_returns_pipeline_promptly() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_ramp_wav(dir.path(), "long.wav", 44_100, 2, 441_000);
        // Small ring: the worker spends its time backing off
        let (pipeline, _consumer) = pipeline(&path, 256);

        let (tx, rx) = bounded(1);
        let worker =
            Worker::spawn(pipeline, Arc::new(SharedConfig::default()), 256, Some(tx)).unwrap();
        rx.recv_timeout(Duration::from_secs(2)).unwrap();

        let exit = worker.stop().unwrap();
        assert!(exit.error.is_none());
        assert!(exit.pipeline.track.position() < 441_000);
        assert_eq!(exit.pipeline.producer.buffered_frames(), 256);
    }
}
