// Transport controller
// Owns the loaded track, the decode worker and the output stream, and
// serializes every transport command behind one lock. Position, duration,
// visualization and underrun telemetry are read lock-free.

use crossbeam_channel::bounded;
use parking_lot::Mutex;
use serde::Serialize;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use super::backend::AudioBackend;
use super::convert::{FormatConverter, Quantizer};
use super::decoder::{TrackHandle, TrackInfo};
use super::events::{mailbox, EngineEvent, EventListener, EventMailbox, EventSender};
use super::output::{OutputEngine, OutputTelemetry, Renderer};
use super::ring::{frame_ring, RingMonitor};
use super::worker::{Pipeline, Worker};
use crate::dsp::DspChain;
use crate::error::{EngineError, EngineResult};
use crate::settings::{BufferSettings, DeviceProfile, EngineSettings};
use crate::state::{
    is_supported_bit_depth, is_supported_channels, is_supported_sample_rate, OutputConfig,
    OutputFormat, SharedConfig, EQ_BANDS, VISUALIZATION_BINS,
};

/// Longest wait for the ring to fill before load/seek return
const PRIME_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum PlayerState {
    Idle,
    Loading,
    Ready,
    Playing,
    Paused,
    Stopped,
}

impl PlayerState {
    pub fn as_str(&self) -> &'static str {
        match self {
            PlayerState::Idle => "idle",
            PlayerState::Loading => "loading",
            PlayerState::Ready => "ready",
            PlayerState::Playing => "playing",
            PlayerState::Paused => "paused",
            PlayerState::Stopped => "stopped",
        }
    }
}

/// One loaded track with its running pipeline
struct Session {
    info: TrackInfo,
    format: OutputFormat,
    output: OutputEngine,
    monitor: RingMonitor,
    worker: Option<Worker>,
    /// Pipeline handed back by a worker that already exited
    parked: Option<Pipeline>,
    completed: bool,
}

impl Session {
    /// Stop the worker and take back the pipeline
    fn reclaim_pipeline(&mut self) -> EngineResult<Pipeline> {
        if let Some(worker) = self.worker.take() {
            let exit = worker.stop()?;
            if let Some(e) = exit.error {
                tracing::debug!("Discarding decode error from stopped worker: {}", e);
            }
            return Ok(exit.pipeline);
        }
        self.parked.take().ok_or(EngineError::InvalidState {
            op: "reclaim pipeline",
            state: "unloaded",
        })
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.output.stop();
        if let Some(worker) = self.worker.take() {
            match worker.stop() {
                Ok(exit) => exit.pipeline.track.close(),
                Err(e) => tracing::error!("Decode worker did not shut down cleanly: {}", e),
            }
        }
        if let Some(pipeline) = self.parked.take() {
            pipeline.track.close();
        }
    }
}

struct Transport {
    backend: Arc<dyn AudioBackend>,
    config: Arc<SharedConfig>,
    telemetry: Arc<OutputTelemetry>,
    buffer: BufferSettings,
    state: PlayerState,
    session: Option<Session>,
    events: EventSender,
}

impl Transport {
    fn set_state(&mut self, state: PlayerState) {
        if self.state != state {
            tracing::debug!("Transport {} -> {}", self.state.as_str(), state.as_str());
            self.state = state;
            self.events.send(EngineEvent::StateChanged(state));
        }
    }

    fn invalid(&self, op: &'static str) -> EngineError {
        EngineError::InvalidState {
            op,
            state: self.state.as_str(),
        }
    }

    /// Release the track and the device, reset telemetry
    fn halt(&mut self) {
        self.session = None;
        self.telemetry.reset();
    }

    fn fail(&mut self, error: EngineError) {
        tracing::error!("Playback stopped: {}", error);
        self.halt();
        self.set_state(PlayerState::Stopped);
        self.events.send(EngineEvent::Error(error));
    }

    /// Fold in whatever the audio and worker threads reported since the
    /// last command: device failures, decode failures, end of track.
    fn reconcile(&mut self) {
        if self.telemetry.take_device_error() {
            self.fail(EngineError::DeviceUnavailable(
                "Output device reported an error".to_string(),
            ));
            return;
        }

        let mut failure = None;
        if let Some(session) = self.session.as_mut() {
            if session.worker.as_ref().is_some_and(|w| w.is_finished()) {
                if let Some(worker) = session.worker.take() {
                    match worker.join() {
                        Ok(exit) => {
                            session.parked = Some(exit.pipeline);
                            failure = exit.error;
                        }
                        Err(e) => failure = Some(e),
                    }
                }
            }
        }
        if let Some(error) = failure {
            self.fail(error);
            return;
        }

        let Some(session) = self.session.as_mut() else {
            return;
        };
        if self.telemetry.take_completed() {
            session.output.pause();
            session.completed = true;
            tracing::info!("Reached end of {:?}", session.info.path);
            self.set_state(PlayerState::Paused);
            self.events.send(EngineEvent::Completed);
        }
    }

    fn load(&mut self, path: &Path) -> EngineResult<()> {
        self.halt();
        self.set_state(PlayerState::Loading);

        let opened = TrackHandle::open(path).and_then(|track| {
            let info = track.info().clone();
            self.telemetry.set_duration_ms(info.duration_ms());
            self.build_session(track, info, 0)
        });

        match opened {
            Ok(session) => {
                tracing::info!(
                    "Loaded {:?}: {} Hz, {} ch, {} ms",
                    path,
                    session.info.sample_rate,
                    session.info.channels,
                    session.info.duration_ms()
                );
                self.session = Some(session);
                self.set_state(PlayerState::Ready);
                Ok(())
            }
            Err(e) => {
                tracing::warn!("Failed to load {:?}: {}", path, e);
                self.halt();
                self.set_state(PlayerState::Idle);
                Err(EngineError::load(e))
            }
        }
    }

    /// Open the output at the configured format and start filling the ring
    /// from `start_ms`
    fn build_session(
        &mut self,
        track: TrackHandle,
        info: TrackInfo,
        start_ms: i64,
    ) -> EngineResult<Session> {
        let requested = OutputFormat {
            sample_rate: self.config.sample_rate(),
            channels: self.config.channels(),
        };
        let format = self.backend.negotiate(requested)?;
        let channels = format.channels as usize;

        let converter = FormatConverter::new(
            info.sample_rate,
            info.channels,
            format,
            self.buffer.resampler_quality,
        )?;
        let ring_frames = self.buffer.ring_frames(format.sample_rate);
        let (producer, consumer) = frame_ring(ring_frames, channels);
        let monitor = producer.monitor();

        self.telemetry.set_format(format);
        let renderer = Renderer::new(consumer, format, self.telemetry.clone(), self.config.clone());
        let output = OutputEngine::open(
            self.backend.as_ref(),
            renderer,
            format,
            self.buffer.period_frames,
            self.telemetry.clone(),
        )?;

        let mut pipeline = Pipeline {
            track,
            converter,
            dsp: DspChain::new(format.sample_rate, channels),
            quantizer: Quantizer::new(),
            producer,
        };
        if start_ms > 0 {
            pipeline.seek(source_frame(&info, start_ms))?;
        }
        self.telemetry.set_position_frames(format.ms_to_frames(start_ms));

        let worker = spawn_primed(pipeline, &self.config, &self.buffer, format)?;
        Ok(Session {
            info,
            format,
            output,
            monitor,
            worker: Some(worker),
            parked: None,
            completed: false,
        })
    }

    fn play(&mut self) -> EngineResult<()> {
        self.reconcile();
        match self.state {
            PlayerState::Playing => Ok(()),
            PlayerState::Ready | PlayerState::Paused => {
                if self.session.as_ref().is_some_and(|s| s.completed) {
                    self.seek(0)?;
                }
                let Some(session) = self.session.as_mut() else {
                    return Err(self.invalid("play"));
                };
                if let Err(e) = session.output.start() {
                    self.fail(e.clone());
                    return Err(e);
                }
                self.set_state(PlayerState::Playing);
                Ok(())
            }
            _ => Err(self.invalid("play")),
        }
    }

    fn pause(&mut self) -> EngineResult<()> {
        self.reconcile();
        match self.state {
            PlayerState::Playing => {
                if let Some(session) = self.session.as_mut() {
                    session.output.pause();
                }
                self.set_state(PlayerState::Paused);
                Ok(())
            }
            PlayerState::Paused | PlayerState::Ready => Ok(()),
            _ => Err(self.invalid("pause")),
        }
    }

    fn stop(&mut self) {
        self.halt();
        self.set_state(PlayerState::Stopped);
    }

    fn seek(&mut self, position_ms: i64) -> EngineResult<()> {
        self.reconcile();
        if !matches!(self.state, PlayerState::Ready | PlayerState::Playing | PlayerState::Paused) {
            return Err(self.invalid("seek"));
        }
        let playing = self.state == PlayerState::Playing;
        let Some(session) = self.session.as_mut() else {
            return Err(self.invalid("seek"));
        };

        let duration = session.info.duration_ms();
        let target_ms = if duration > 0 {
            position_ms.clamp(0, duration)
        } else {
            position_ms.max(0)
        };

        let mut pipeline = session.reclaim_pipeline()?;
        if let Err(e) = pipeline.seek(source_frame(&session.info, target_ms)) {
            session.parked = Some(pipeline);
            return Err(e);
        }

        session.completed = false;
        self.telemetry.clear_completed();
        self.telemetry.set_position_frames(session.format.ms_to_frames(target_ms));
        if playing {
            // The renderer may have gated itself on a drained ring
            self.telemetry.set_running(true);
        }

        let worker = spawn_primed(pipeline, &self.config, &self.buffer, session.format)?;
        session.worker = Some(worker);
        tracing::debug!("Seeked to {} ms", target_ms);
        Ok(())
    }

    /// Rebuild the stream at the configured format, keeping position and
    /// play state
    fn restart_output(&mut self) -> EngineResult<()> {
        self.reconcile();
        let Some(mut session) = self.session.take() else {
            return Ok(());
        };

        let playing = self.state == PlayerState::Playing;
        let completed = session.completed;
        let position_ms = self.telemetry.position_ms();
        session.output.stop();

        let pipeline = match session.reclaim_pipeline() {
            Ok(pipeline) => pipeline,
            Err(e) => {
                drop(session);
                self.fail(e.clone());
                return Err(e);
            }
        };
        let info = session.info.clone();
        drop(session);

        match self.build_session(pipeline.track, info, position_ms) {
            Ok(mut session) => {
                tracing::info!(
                    "Output restarted at {} Hz, {} ch",
                    session.format.sample_rate,
                    session.format.channels
                );
                session.completed = completed;
                if playing {
                    if let Err(e) = session.output.start() {
                        self.session = Some(session);
                        self.fail(e.clone());
                        return Err(e);
                    }
                }
                self.session = Some(session);
                Ok(())
            }
            Err(e) => {
                self.fail(e.clone());
                Err(e)
            }
        }
    }
}

impl Drop for Transport {
    fn drop(&mut self) {
        self.halt();
    }
}

/// Source frame for a position, kept inside the track
fn source_frame(info: &TrackInfo, ms: i64) -> u64 {
    let frame = info.ms_to_frames(ms);
    match info.total_frames {
        Some(total) => frame.min(total.saturating_sub(1)),
        None => frame,
    }
}

fn spawn_primed(
    pipeline: Pipeline,
    config: &Arc<SharedConfig>,
    buffer: &BufferSettings,
    format: OutputFormat,
) -> EngineResult<Worker> {
    let prime_frames = (buffer.ring_frames(format.sample_rate) / 2).max(1);
    let (tx, rx) = bounded(1);
    let worker = Worker::spawn(pipeline, config.clone(), prime_frames, Some(tx))?;
    if rx.recv_timeout(PRIME_TIMEOUT).is_err() {
        tracing::warn!("Ring buffer not primed after {:?}", PRIME_TIMEOUT);
    }
    Ok(worker)
}

/// The playback engine. One per process; construct once and share by
/// reference.
pub struct AudioPlayer {
    transport: Mutex<Transport>,
    config: Arc<SharedConfig>,
    telemetry: Arc<OutputTelemetry>,
    mailbox: EventMailbox,
}

impl AudioPlayer {
    /// Fails with `DeviceUnavailable` when the backend has no output device
    pub fn new(
        backend: Arc<dyn AudioBackend>,
        settings: EngineSettings,
        listener: Option<EventListener>,
    ) -> EngineResult<Self> {
        backend.probe()?;

        let config = Arc::new(SharedConfig::new(&settings.output));
        let telemetry = Arc::new(OutputTelemetry::new());
        let (events, mailbox) = mailbox(listener);

        tracing::info!("Audio engine ready on {} backend", backend.name());
        Ok(Self {
            transport: Mutex::new(Transport {
                backend,
                config: config.clone(),
                telemetry: telemetry.clone(),
                buffer: settings.buffer,
                state: PlayerState::Idle,
                session: None,
                events,
            }),
            config,
            telemetry,
            mailbox,
        })
    }

    // ===== Transport =====

    /// Open a track and prime the pipeline. Does not start playback.
    pub fn load(&self, path: impl AsRef<Path>) -> EngineResult<()> {
        self.transport.lock().load(path.as_ref())
    }

    pub fn play(&self) -> EngineResult<()> {
        self.transport.lock().play()
    }

    pub fn pause(&self) -> EngineResult<()> {
        self.transport.lock().pause()
    }

    pub fn stop(&self) {
        self.transport.lock().stop()
    }

    /// Jump to `position_ms`, clamped to the track. The reported position
    /// moves immediately; audio follows once the ring refills.
    pub fn seek_ms(&self, position_ms: i64) -> EngineResult<()> {
        self.transport.lock().seek(position_ms)
    }

    // ===== Output format =====

    /// Rejects the whole request, changing nothing, if any value is
    /// unsupported
    pub fn set_audio_quality(
        &self,
        sample_rate: u32,
        bit_depth: u32,
        channels: u16,
    ) -> EngineResult<()> {
        check_sample_rate(sample_rate)?;
        check_bit_depth(bit_depth)?;
        check_channels(channels)?;
        let mut transport = self.transport.lock();
        let rate_changed = self.config.set_sample_rate(sample_rate);
        let channels_changed = self.config.set_channels(channels);
        self.config.set_bit_depth(bit_depth);
        if rate_changed || channels_changed {
            transport.restart_output()?;
        }
        Ok(())
    }

    pub fn set_sample_rate(&self, sample_rate: u32) -> EngineResult<()> {
        check_sample_rate(sample_rate)?;
        let mut transport = self.transport.lock();
        if self.config.set_sample_rate(sample_rate) {
            transport.restart_output()?;
        }
        Ok(())
    }

    /// Takes effect on the next processed buffer; never restarts the stream
    pub fn set_bit_depth(&self, bit_depth: u32) -> EngineResult<()> {
        check_bit_depth(bit_depth)?;
        self.config.set_bit_depth(bit_depth);
        Ok(())
    }

    pub fn set_channels(&self, channels: u16) -> EngineResult<()> {
        check_channels(channels)?;
        let mut transport = self.transport.lock();
        if self.config.set_channels(channels) {
            transport.restart_output()?;
        }
        Ok(())
    }

    // ===== DSP =====

    pub fn set_volume(&self, volume: f32) {
        self.config.set_volume(volume);
    }

    pub fn enable_eq(&self, enabled: bool) {
        self.config.set_eq_enabled(enabled);
    }

    /// Returns false for a band index outside 0..10
    pub fn set_eq_band(&self, band: usize, gain_db: f32) -> bool {
        self.config.set_eq_band(band, gain_db)
    }

    pub fn enable_volume_normalization(&self, enabled: bool) {
        self.config.set_normalization_enabled(enabled);
    }

    pub fn set_target_lufs(&self, lufs: f32) {
        self.config.set_target_lufs(lufs);
    }

    /// Best-effort tuning. Buffer sizes apply the next time the pipeline is
    /// built; the headphone curve only lands on a flat EQ.
    pub fn optimize_for_device(&self, use_headphones: bool, high_performance: bool) {
        let profile = DeviceProfile {
            use_headphones,
            high_performance,
        };
        let mut transport = self.transport.lock();
        transport.buffer = profile.buffer_settings();

        if use_headphones && self.config.eq_gains_db().iter().all(|g| *g == 0.0) {
            for (band, gain) in DeviceProfile::headphone_curve().iter().enumerate() {
                self.config.set_eq_band(band, *gain);
            }
        }
        tracing::info!(
            "Optimized for device (headphones: {}, high performance: {}): \
             ring {} ms, period {} frames",
            use_headphones,
            high_performance,
            transport.buffer.ring_buffer_ms,
            transport.buffer.period_frames
        );
    }

    // ===== Telemetry =====

    pub fn position_ms(&self) -> i64 {
        self.telemetry.position_ms()
    }

    pub fn duration_ms(&self) -> i64 {
        self.telemetry.duration_ms()
    }

    pub fn visualization_data(&self) -> [f32; VISUALIZATION_BINS] {
        self.telemetry.visualization().load()
    }

    pub fn underrun_count(&self) -> u64 {
        self.telemetry.underruns()
    }

    pub fn is_playing(&self) -> bool {
        let mut transport = self.transport.lock();
        transport.reconcile();
        transport.state == PlayerState::Playing
    }

    pub fn state(&self) -> PlayerState {
        let mut transport = self.transport.lock();
        transport.reconcile();
        transport.state
    }

    /// Audio decoded ahead of the playback position
    pub fn buffered_ms(&self) -> i64 {
        let transport = self.transport.lock();
        transport
            .session
            .as_ref()
            .map_or(0, |s| s.format.frames_to_ms(s.monitor.buffered_frames() as u64))
    }

    pub fn output_format(&self) -> Option<OutputFormat> {
        let transport = self.transport.lock();
        transport.session.as_ref().map(|s| s.format)
    }

    pub fn track_info(&self) -> Option<TrackInfo> {
        let transport = self.transport.lock();
        transport.session.as_ref().map(|s| s.info.clone())
    }

    pub fn config(&self) -> OutputConfig {
        self.config.snapshot()
    }

    pub fn eq_gains_db(&self) -> [f32; EQ_BANDS] {
        self.config.eq_gains_db()
    }

    pub fn buffer_settings(&self) -> BufferSettings {
        self.transport.lock().buffer
    }

    /// Current settings, ready to persist
    pub fn settings(&self) -> EngineSettings {
        EngineSettings {
            output: self.config.snapshot(),
            buffer: self.buffer_settings(),
            ..EngineSettings::default()
        }
    }

    /// Events since the last poll, after folding in pending completion or
    /// errors
    pub fn poll_events(&self) -> Vec<EngineEvent> {
        self.transport.lock().reconcile();
        self.mailbox.drain()
    }
}

fn check_sample_rate(rate: u32) -> EngineResult<()> {
    if is_supported_sample_rate(rate) {
        Ok(())
    } else {
        Err(EngineError::UnsupportedFormat(format!("Output sample rate {} Hz", rate)))
    }
}

fn check_bit_depth(bits: u32) -> EngineResult<()> {
    if is_supported_bit_depth(bits) {
        Ok(())
    } else {
        Err(EngineError::UnsupportedFormat(format!("Output bit depth {}", bits)))
    }
}

fn check_channels(channels: u16) -> EngineResult<()> {
    if is_supported_channels(channels) {
        Ok(())
    } else {
        Err(EngineError::UnsupportedFormat(format!("Output channel count {}", channels)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::backend::NullBackend;
    use crate::audio::decoder::tests::write_sine_wav;
    use std::thread;

    fn player() -> AudioPlayer {
        AudioPlayer::new(Arc::new(NullBackend::new()), EngineSettings::default(), None).unwrap()
    }

    fn fixture(dir: &Path, seconds: f32) -> std::path::PathBuf {
        write_sine_wav(dir, "track.wav", 44_100, 2, seconds, 440.0, 0.5)
    }

    #[test]
    fn test_missing_device_fails_construction() {
        let backend = Arc::new(NullBackend::unavailable());
        let result = AudioPlayer::new(backend, EngineSettings::default(), None);
        assert!(matches!(result, Err(EngineError::DeviceUnavailable(_))));
    }

    #[test]
    fn test_load_missing_file() {
        let player = player();
        let err = player.load("/definitely/not/here.flac").unwrap_err();
        assert!(matches!(err, EngineError::LoadError { .. }));
        assert_eq!(err.code(), 1);
        assert_eq!(player.state(), PlayerState::Idle);
        assert!(matches!(player.play(), Err(EngineError::InvalidState { .. })));
    }

    #[test]
    fn test_load_primes_without_playing() {
        let dir = tempfile::tempdir().unwrap();
        let player = player();
        player.load(fixture(dir.path(), 3.0)).unwrap();

        assert_eq!(player.state(), PlayerState::Ready);
        assert_eq!(player.duration_ms(), 3_000);
        assert_eq!(player.position_ms(), 0);
        assert!(player.buffered_ms() > 0);
        assert!(!player.is_playing());

        thread::sleep(Duration::from_millis(100));
        assert_eq!(player.position_ms(), 0);
    }

    #[test]
    fn test_play_pause_seek() {
        let dir = tempfile::tempdir().unwrap();
        let player = player();
        player.load(fixture(dir.path(), 5.0)).unwrap();

        player.play().unwrap();
        assert!(player.is_playing());
        thread::sleep(Duration::from_millis(1_000));
        let position = player.position_ms();
        assert!((850..=1_150).contains(&position), "position {} ms", position);

        player.pause().unwrap();
        let frozen = player.position_ms();
        thread::sleep(Duration::from_millis(200));
        assert_eq!(player.position_ms(), frozen);
        assert_eq!(player.state(), PlayerState::Paused);

        player.seek_ms(0).unwrap();
        assert!(player.position_ms() <= 20);

        player.seek_ms(2_500).unwrap();
        assert!((2_499..=2_500).contains(&player.position_ms()));
    }

    #[test]
    fn test_seek_clamps_to_duration() {
        let dir = tempfile::tempdir().unwrap();
        let player = player();
        player.load(fixture(dir.path(), 2.0)).unwrap();

        player.seek_ms(60_000).unwrap();
        assert!(player.position_ms() >= 1_999);
        player.seek_ms(-50).unwrap();
        assert_eq!(player.position_ms(), 0);
    }

    #[test]
    fn test_completion_pauses_at_end_and_replays_from_start() {
        let dir = tempfile::tempdir().unwrap();
        let player = player();
        player.load(fixture(dir.path(), 0.5)).unwrap();
        player.poll_events();

        player.play().unwrap();
        thread::sleep(Duration::from_millis(900));

        assert!(!player.is_playing());
        assert_eq!(player.state(), PlayerState::Paused);
        assert_eq!(player.position_ms(), 500);
        let events = player.poll_events();
        assert!(events.contains(&EngineEvent::Completed));

        player.play().unwrap();
        assert!(player.position_ms() < 100);
        assert!(player.is_playing());
    }

    #[test]
    fn test_device_error_stops_with_an_error_event() {
        let dir = tempfile::tempdir().unwrap();
        let player = player();
        player.load(fixture(dir.path(), 3.0)).unwrap();
        player.play().unwrap();
        thread::sleep(Duration::from_millis(100));

        player.telemetry.report_device_error();
        assert_eq!(player.state(), PlayerState::Stopped);
        assert_eq!(player.position_ms(), 0);
        assert!(player.track_info().is_none());

        let events = player.poll_events();
        assert!(events
            .iter()
            .any(|e| matches!(e, EngineEvent::Error(EngineError::DeviceUnavailable(_)))));
        assert_eq!(
            events.iter().rev().find(|e| matches!(e, EngineEvent::StateChanged(_))),
            Some(&EngineEvent::StateChanged(PlayerState::Stopped))
        );
    }

    #[test]
    fn test_truncated_file_stops_with_an_error_instead_of_completing() {
        let dir = tempfile::tempdir().unwrap();
        let path = fixture(dir.path(), 4.0);
        // Keep one second of sample data under a header claiming four
        let file = std::fs::OpenOptions::new().write(true).open(&path).unwrap();
        let len = file.metadata().unwrap().len();
        file.set_len(len - 3 * 44_100 * 4).unwrap();
        drop(file);

        let player = player();
        player.load(&path).unwrap();
        assert_eq!(player.duration_ms(), 4_000);
        player.poll_events();

        player.play().unwrap();
        thread::sleep(Duration::from_millis(1_500));

        assert_eq!(player.state(), PlayerState::Stopped);
        let events = player.poll_events();
        assert!(events
            .iter()
            .any(|e| matches!(e, EngineEvent::Error(EngineError::CorruptStream(_)))));
        assert!(!events.contains(&EngineEvent::Completed));
    }

    #[test]
    fn test_stop_releases_track() {
        let dir = tempfile::tempdir().unwrap();
        let player = player();
        player.load(fixture(dir.path(), 2.0)).unwrap();
        player.play().unwrap();
        thread::sleep(Duration::from_millis(100));

        player.stop();
        assert_eq!(player.state(), PlayerState::Stopped);
        assert_eq!(player.position_ms(), 0);
        assert_eq!(player.duration_ms(), 0);
        assert!(player.track_info().is_none());

        // Stopped goes back through load
        player.load(fixture(dir.path(), 2.0)).unwrap();
        assert_eq!(player.state(), PlayerState::Ready);
    }

    #[test]
    fn test_dsp_changes_apply_while_playing() {
        let dir = tempfile::tempdir().unwrap();
        let player = player();
        player.load(fixture(dir.path(), 3.0)).unwrap();
        player.play().unwrap();

        player.enable_eq(true);
        assert!(player.set_eq_band(0, 6.0));
        assert!(!player.set_eq_band(10, 6.0));
        player.enable_volume_normalization(true);
        player.set_target_lufs(-16.0);
        thread::sleep(Duration::from_millis(300));

        assert!(player.is_playing());
        assert!(player.position_ms() > 150);
        assert_eq!(player.config().eq_gains_db[0], 6.0);
        assert!(player.visualization_data().iter().any(|&v| v > 0.0));
    }

    #[test]
    fn test_format_change_restarts_in_place() {
        let dir = tempfile::tempdir().unwrap();
        let player = player();
        player.load(fixture(dir.path(), 4.0)).unwrap();
        player.play().unwrap();
        thread::sleep(Duration::from_millis(300));

        player.set_sample_rate(48_000).unwrap();
        assert_eq!(player.output_format().map(|f| f.sample_rate), Some(48_000));
        assert!(player.is_playing());
        let position = player.position_ms();
        assert!((200..=500).contains(&position), "position {} ms", position);

        // Bit depth never restarts
        player.set_bit_depth(24).unwrap();
        assert_eq!(player.config().bit_depth, 24);
        assert_eq!(player.output_format().map(|f| f.sample_rate), Some(48_000));
    }

    #[test]
    fn test_headphone_profile_seeds_flat_eq_only() {
        let player = player();
        player.optimize_for_device(true, true);
        assert_eq!(player.eq_gains_db(), DeviceProfile::headphone_curve());
        assert_eq!(player.buffer_settings().period_frames, 240);

        player.set_eq_band(4, 2.0);
        player.optimize_for_device(true, false);
        assert_eq!(player.eq_gains_db()[4], 2.0);
        assert_eq!(player.buffer_settings().ring_buffer_ms, 400);
    }
}
