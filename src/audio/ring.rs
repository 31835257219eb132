// Frame ring buffer between the decode worker and the audio callback
// Wraps ringbuf's lock-free SPSC queue and adds whole-frame semantics,
// flush requests, end-of-stream marking and underrun accounting.

use ringbuf::traits::{Consumer, Observer, Producer, Split};
use ringbuf::{HeapCons, HeapProd, HeapRb};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

/// What a consumer read produced
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadStatus {
    /// The whole request was served from the ring
    Full,
    /// The ring ran dry before the producer finished; counted as an underrun
    Underrun,
    /// The producer finished and everything it wrote has been read
    Drained,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReadOutcome {
    pub frames_read: usize,
    pub status: ReadStatus,
}

/// Counters visible to both ends and to the control side
#[derive(Debug, Default)]
struct RingShared {
    /// Samples ever committed by the producer
    written: AtomicU64,
    /// Samples ever consumed (read or flushed) by the consumer
    consumed: AtomicU64,
    /// Consumer must discard everything written before this sample count
    flush_to: AtomicU64,
    finished: AtomicBool,
    underruns: AtomicU64,
}

/// Create a ring holding at least `min_frames` frames of `channels` samples.
/// The frame capacity is rounded up to a power of two.
pub fn frame_ring(min_frames: usize, channels: usize) -> (RingProducer, RingConsumer) {
    let channels = channels.max(1);
    let capacity_frames = min_frames.max(1).next_power_of_two();
    let rb = HeapRb::<f32>::new(capacity_frames * channels);
    let (producer, consumer) = rb.split();
    let shared = Arc::new(RingShared::default());

    (
        RingProducer {
            inner: producer,
            shared: shared.clone(),
            channels,
        },
        RingConsumer {
            inner: consumer,
            shared,
            channels,
            consumed: 0,
        },
    )
}

pub struct RingProducer {
    inner: HeapProd<f32>,
    shared: Arc<RingShared>,
    channels: usize,
}

impl RingProducer {
    /// Write as many whole frames as fit; returns frames written
    pub fn try_write(&mut self, samples: &[f32]) -> usize {
        let vacant_frames = self.inner.vacant_len() / self.channels;
        let offered_frames = samples.len() / self.channels;
        let frames = vacant_frames.min(offered_frames);
        if frames == 0 {
            return 0;
        }

        // push_slice publishes the write index once, after the copy
        let pushed = self.inner.push_slice(&samples[..frames * self.channels]);
        debug_assert_eq!(pushed, frames * self.channels);
        self.shared.written.fetch_add(pushed as u64, Ordering::Release);
        frames
    }

    /// Mark that no more frames will follow
    pub fn finish(&self) {
        self.shared.finished.store(true, Ordering::Release);
    }

    pub fn is_finished(&self) -> bool {
        self.shared.finished.load(Ordering::Acquire)
    }

    /// Ask the consumer to drop everything written so far.
    /// Only call while no producer activity is in flight; frames written
    /// afterwards survive the flush.
    pub fn request_flush(&self) {
        let written = self.shared.written.load(Ordering::Acquire);
        self.shared.flush_to.store(written, Ordering::Release);
        self.shared.finished.store(false, Ordering::Release);
    }

    pub fn channels(&self) -> usize {
        self.channels
    }

    pub fn capacity_frames(&self) -> usize {
        self.inner.capacity().get() / self.channels
    }

    pub fn buffered_frames(&self) -> usize {
        buffered_frames(&self.shared, self.channels)
    }

    pub fn underruns(&self) -> u64 {
        self.shared.underruns.load(Ordering::Relaxed)
    }

    /// Control-side view of the shared counters
    pub fn monitor(&self) -> RingMonitor {
        RingMonitor {
            shared: self.shared.clone(),
            channels: self.channels,
        }
    }
}

pub struct RingConsumer {
    inner: HeapCons<f32>,
    shared: Arc<RingShared>,
    channels: usize,
    consumed: u64,
}

impl RingConsumer {
    /// Fill `out` with whole frames. Any shortfall is silence.
    /// Never blocks and never allocates.
    pub fn read(&mut self, out: &mut [f32]) -> ReadOutcome {
        self.apply_flush();

        let wanted_frames = out.len() / self.channels;
        let available_frames = self.inner.occupied_len() / self.channels;
        let frames = wanted_frames.min(available_frames);
        let samples = frames * self.channels;

        let popped = self.inner.pop_slice(&mut out[..samples]);
        debug_assert_eq!(popped, samples);
        self.consumed += popped as u64;
        self.shared.consumed.store(self.consumed, Ordering::Release);

        out[samples..].fill(0.0);

        let status = if frames == wanted_frames {
            ReadStatus::Full
        } else if self.shared.finished.load(Ordering::Acquire) && self.inner.is_empty() {
            ReadStatus::Drained
        } else {
            self.shared.underruns.fetch_add(1, Ordering::Relaxed);
            ReadStatus::Underrun
        };

        ReadOutcome {
            frames_read: frames,
            status,
        }
    }

    fn apply_flush(&mut self) {
        let flush_to = self.shared.flush_to.load(Ordering::Acquire);
        if flush_to <= self.consumed {
            return;
        }
        let pending = (flush_to - self.consumed) as usize;
        let skipped = self.inner.skip(pending.min(self.inner.occupied_len()));
        self.consumed += skipped as u64;
        self.shared.consumed.store(self.consumed, Ordering::Release);
    }

    pub fn channels(&self) -> usize {
        self.channels
    }
}

/// Read-only handle for diagnostics on the control side
#[derive(Clone)]
pub struct RingMonitor {
    shared: Arc<RingShared>,
    channels: usize,
}

impl RingMonitor {
    pub fn buffered_frames(&self) -> usize {
        buffered_frames(&self.shared, self.channels)
    }

    pub fn underruns(&self) -> u64 {
        self.shared.underruns.load(Ordering::Relaxed)
    }

    pub fn is_finished(&self) -> bool {
        self.shared.finished.load(Ordering::Acquire)
    }
}

fn buffered_frames(shared: &RingShared, channels: usize) -> usize {
    let written = shared.written.load(Ordering::Acquire);
    let consumed = shared.consumed.load(Ordering::Acquire);
    let flush_to = shared.flush_to.load(Ordering::Acquire);
    let live_from = consumed.max(flush_to);
    (written.saturating_sub(live_from) as usize) / channels
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn test_capacity_rounds_to_power_of_two() {
        let (producer, _consumer) = frame_ring(1000, 2);
        assert_eq!(producer.capacity_frames(), 1024);
    }

    #[test]
    fn test_try_write_returns_short_count_when_full() {
        let (mut producer, _consumer) = frame_ring(4, 2);
        let samples = vec![0.5f32; 6 * 2];
        assert_eq!(producer.try_write(&samples), 4);
        assert_eq!(producer.try_write(&samples), 0);
        assert_eq!(producer.buffered_frames(), 4);
    }

    #[test]
    fn test_partial_frames_are_never_written() {
        let (mut producer, _consumer) = frame_ring(8, 2);
        // 3 samples = 1.5 frames
        assert_eq!(producer.try_write(&[1.0, 2.0, 3.0]), 1);
        assert_eq!(producer.buffered_frames(), 1);
    }

    #[test]
    fn test_empty_read_is_silence_and_one_underrun() {
        let (producer, mut consumer) = frame_ring(8, 2);
        let mut out = [1.0f32; 8];
        for expected in 1..=5 {
            let outcome = consumer.read(&mut out);
            assert_eq!(outcome.status, ReadStatus::Underrun);
            assert_eq!(outcome.frames_read, 0);
            assert!(out.iter().all(|&s| s == 0.0));
            assert_eq!(producer.underruns(), expected);
        }
    }

    #[test]
    fn test_short_read_pads_with_silence() {
        let (mut producer, mut consumer) = frame_ring(8, 2);
        producer.try_write(&[0.1, 0.2, 0.3, 0.4]);

        let mut out = [9.0f32; 8];
        let outcome = consumer.read(&mut out);
        assert_eq!(outcome.frames_read, 2);
        assert_eq!(outcome.status, ReadStatus::Underrun);
        assert_eq!(out, [0.1, 0.2, 0.3, 0.4, 0.0, 0.0, 0.0, 0.0]);
    }

    #[test]
    fn test_finished_producer_drains_without_underrun() {
        let (mut producer, mut consumer) = frame_ring(8, 1);
        producer.try_write(&[0.5, 0.5]);
        producer.finish();

        let mut out = [0.0f32; 4];
        let outcome = consumer.read(&mut out);
        assert_eq!(outcome.frames_read, 2);
        assert_eq!(outcome.status, ReadStatus::Drained);
        assert_eq!(producer.underruns(), 0);
    }

    #[test]
    fn test_flush_discards_only_earlier_frames() {
        let (mut producer, mut consumer) = frame_ring(16, 1);
        producer.try_write(&[1.0, 1.0, 1.0]);
        producer.request_flush();
        producer.try_write(&[2.0, 2.0]);

        let mut out = [0.0f32; 2];
        let outcome = consumer.read(&mut out);
        assert_eq!(outcome.frames_read, 2);
        assert_eq!(out, [2.0, 2.0]);
        assert_eq!(producer.buffered_frames(), 0);
    }

    #[test]
    fn test_concurrent_transfer_has_no_torn_frames() {
        const CHANNELS: usize = 4;
        const TOTAL_FRAMES: usize = 200_000;

        let (mut producer, mut consumer) = frame_ring(256, CHANNELS);
        let monitor = producer.monitor();

        let writer = thread::spawn(move || {
            let mut next = 0usize;
            let mut batch = Vec::with_capacity(97 * CHANNELS);
            while next < TOTAL_FRAMES {
                batch.clear();
                let end = (next + 97).min(TOTAL_FRAMES);
                for frame in next..end {
                    batch.extend(std::iter::repeat(frame as f32).take(CHANNELS));
                }
                let mut offset = 0;
                while offset < batch.len() {
                    let written = producer.try_write(&batch[offset..]);
                    if written == 0 {
                        thread::yield_now();
                    }
                    offset += written * CHANNELS;
                }
                next = end;
            }
            producer.finish();
            producer
        });

        let mut expected = 0usize;
        let mut out = vec![0.0f32; 61 * CHANNELS];
        loop {
            let outcome = consumer.read(&mut out);
            for frame in out[..outcome.frames_read * CHANNELS].chunks_exact(CHANNELS) {
                // Every channel of a frame came from the same write
                assert!(frame.iter().all(|&s| s == frame[0]));
                assert_eq!(frame[0] as usize, expected);
                expected += 1;
            }
            if outcome.status == ReadStatus::Drained {
                break;
            }
            if outcome.frames_read == 0 {
                thread::sleep(Duration::from_micros(50));
            }
        }

        let producer = writer.join().unwrap();
        assert_eq!(expected, TOTAL_FRAMES);
        assert!(monitor.is_finished());
        assert_eq!(producer.buffered_frames(), 0);
    }
}
