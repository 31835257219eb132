// Platform output backends
// `CpalBackend` talks to the system's low-latency audio API through cpal.
// A cpal stream is not Send, so each stream lives on its own device thread
// and is driven over a channel. `NullBackend` renders against the wall
// clock with no hardware, for tests and headless hosts.

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{SampleFormat, Stream, StreamConfig, SupportedBufferSize};
use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use super::output::{OutputTelemetry, Renderer};
use crate::error::{EngineError, EngineResult};
use crate::state::OutputFormat;

/// How long to wait for the device thread to acknowledge a command
const DEVICE_REPLY_TIMEOUT: Duration = Duration::from_secs(2);

/// A running platform stream
pub trait OutputStream: Send {
    fn play(&mut self) -> EngineResult<()>;
    fn pause(&mut self) -> EngineResult<()>;
}

pub trait AudioBackend: Send + Sync {
    fn name(&self) -> &'static str;

    /// Check that an output device exists at all
    fn probe(&self) -> EngineResult<()>;

    /// The closest format the device can run at
    fn negotiate(&self, requested: OutputFormat) -> EngineResult<OutputFormat>;

    /// Open a stream that pulls from `renderer`. It starts paused.
    fn open(
        &self,
        format: OutputFormat,
        period_frames: u32,
        renderer: Renderer,
        telemetry: Arc<OutputTelemetry>,
    ) -> EngineResult<Box<dyn OutputStream>>;
}

enum DeviceCommand {
    Play(Sender<EngineResult<()>>),
    Pause(Sender<EngineResult<()>>),
    Close,
}

/// Handle to a stream living on a device thread
struct DeviceThreadStream {
    commands: Sender<DeviceCommand>,
    thread: Option<JoinHandle<()>>,
}

impl DeviceThreadStream {
    fn request(
        &self,
        make: impl FnOnce(Sender<EngineResult<()>>) -> DeviceCommand,
    ) -> EngineResult<()> {
        let (reply_tx, reply_rx) = bounded(1);
        self.commands
            .send(make(reply_tx))
            .map_err(|_| EngineError::DeviceUnavailable("Output thread has exited".to_string()))?;
        reply_rx
            .recv_timeout(DEVICE_REPLY_TIMEOUT)
            .map_err(|_| {
                EngineError::DeviceUnavailable("Output thread did not respond".to_string())
            })?
    }
}

impl OutputStream for DeviceThreadStream {
    fn play(&mut self) -> EngineResult<()> {
        self.request(DeviceCommand::Play)
    }

    fn pause(&mut self) -> EngineResult<()> {
        self.request(DeviceCommand::Pause)
    }
}

impl Drop for DeviceThreadStream {
    fn drop(&mut self) {
        let _ = self.commands.send(DeviceCommand::Close);
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                tracing::error!("Output thread panicked");
            }
        }
    }
}

/// System audio output through cpal
#[derive(Debug, Default, Clone, Copy)]
pub struct CpalBackend;

impl CpalBackend {
    pub fn new() -> Self {
        Self
    }

    fn default_device() -> EngineResult<cpal::Device> {
        cpal::default_host()
            .default_output_device()
            .ok_or_else(|| EngineError::DeviceUnavailable("No output device available".to_string()))
    }

    /// Pick a supported config for `format`, preferring float samples
    fn select_config(
        device: &cpal::Device,
        format: OutputFormat,
    ) -> EngineResult<cpal::SupportedStreamConfigRange> {
        let supported: Vec<_> = device
            .supported_output_configs()
            .map_err(|e| {
                EngineError::DeviceUnavailable(format!("Failed to query output configs: {}", e))
            })?
            .collect();

        let fits = |c: &&cpal::SupportedStreamConfigRange| {
            c.channels() == format.channels
                && format.sample_rate >= c.min_sample_rate().0
                && format.sample_rate <= c.max_sample_rate().0
        };

        supported
            .iter()
            .filter(fits)
            .find(|c| c.sample_format() == SampleFormat::F32)
            .or_else(|| supported.iter().find(fits))
            .cloned()
            .ok_or_else(|| {
                EngineError::DeviceUnavailable(format!(
                    "Device cannot play {} Hz/{} ch",
                    format.sample_rate, format.channels
                ))
            })
    }

    fn build_stream<T>(
        device: &cpal::Device,
        config: &StreamConfig,
        mut render: impl FnMut(&mut [T]) + Send + 'static,
        telemetry: Arc<OutputTelemetry>,
    ) -> EngineResult<Stream>
    where
        T: cpal::SizedSample,
    {
        device
            .build_output_stream(
                config,
                move |data: &mut [T], _: &cpal::OutputCallbackInfo| render(data),
                move |err| {
                    tracing::error!("Audio output error: {}", err);
                    telemetry.report_device_error();
                },
                None,
            )
            .map_err(|e| {
                EngineError::DeviceUnavailable(format!("Failed to build output stream: {}", e))
            })
    }

    fn open_stream(
        format: OutputFormat,
        period_frames: u32,
        mut renderer: Renderer,
        telemetry: Arc<OutputTelemetry>,
    ) -> EngineResult<Stream> {
        let device = Self::default_device()?;
        let supported = Self::select_config(&device, format)?;

        let buffer_size = match supported.buffer_size() {
            SupportedBufferSize::Range { min, max } if (*min..=*max).contains(&period_frames) => {
                cpal::BufferSize::Fixed(period_frames)
            }
            _ => cpal::BufferSize::Default,
        };
        let sample_format = supported.sample_format();
        let config = StreamConfig {
            channels: format.channels,
            sample_rate: cpal::SampleRate(format.sample_rate),
            buffer_size,
        };

        let stream = match sample_format {
            SampleFormat::F32 => {
                Self::build_stream::<f32>(&device, &config, move |d| renderer.render(d), telemetry)?
            }
            SampleFormat::I16 => Self::build_stream::<i16>(
                &device,
                &config,
                move |d| renderer.render_into(d),
                telemetry,
            )?,
            SampleFormat::I32 => Self::build_stream::<i32>(
                &device,
                &config,
                move |d| renderer.render_into(d),
                telemetry,
            )?,
            SampleFormat::U16 => Self::build_stream::<u16>(
                &device,
                &config,
                move |d| renderer.render_into(d),
                telemetry,
            )?,
            other => {
                return Err(EngineError::DeviceUnavailable(format!(
                    "Unsupported device sample format: {:?}",
                    other
                )))
            }
        };

        // Streams may start running as soon as they are built
        if let Err(e) = stream.pause() {
            tracing::debug!("Stream could not be paused after build: {}", e);
        }
        Ok(stream)
    }

    fn device_loop(stream: Stream, commands: Receiver<DeviceCommand>) {
        for command in commands.iter() {
            match command {
                DeviceCommand::Play(reply) => {
                    let result = stream
                        .play()
                        .map_err(|e| {
                            EngineError::DeviceUnavailable(format!("Failed to start stream: {}", e))
                        });
                    let _ = reply.send(result);
                }
                DeviceCommand::Pause(reply) => {
                    let result = stream
                        .pause()
                        .map_err(|e| {
                            EngineError::DeviceUnavailable(format!("Failed to pause stream: {}", e))
                        });
                    let _ = reply.send(result);
                }
                DeviceCommand::Close => break,
            }
        }
        drop(stream);
    }
}

impl AudioBackend for CpalBackend {
    fn name(&self) -> &'static str {
        "cpal"
    }

    fn probe(&self) -> EngineResult<()> {
        let device = Self::default_device()?;
        let name = device.name().unwrap_or_else(|_| "Unknown".to_string());
        tracing::info!("Using audio device: {}", name);
        Ok(())
    }

    fn negotiate(&self, requested: OutputFormat) -> EngineResult<OutputFormat> {
        let device = Self::default_device()?;
        if Self::select_config(&device, requested).is_ok() {
            return Ok(requested);
        }

        // Fall back to whatever the device prefers
        let default = device
            .default_output_config()
            .map_err(|e| {
                let message = format!("Failed to get default output config: {}", e);
                EngineError::DeviceUnavailable(message)
            })?;
        let format = OutputFormat {
            sample_rate: default.sample_rate().0,
            channels: default.channels(),
        };
        tracing::warn!(
            "Device cannot play {} Hz/{} ch, using {} Hz/{} ch",
            requested.sample_rate,
            requested.channels,
            format.sample_rate,
            format.channels
        );
        Ok(format)
    }

    fn open(
        &self,
        format: OutputFormat,
        period_frames: u32,
        renderer: Renderer,
        telemetry: Arc<OutputTelemetry>,
    ) -> EngineResult<Box<dyn OutputStream>> {
        let (ready_tx, ready_rx) = bounded::<EngineResult<()>>(1);
        let (command_tx, command_rx) = bounded::<DeviceCommand>(8);

        let thread = thread::Builder::new()
            .name("pancake-output".to_string())
            .spawn(move || match Self::open_stream(format, period_frames, renderer, telemetry) {
                Ok(stream) => {
                    let _ = ready_tx.send(Ok(()));
                    Self::device_loop(stream, command_rx);
                }
                Err(e) => {
                    let _ = ready_tx.send(Err(e));
                }
            })
            .map_err(|e| {
                EngineError::DeviceUnavailable(format!("Failed to spawn output thread: {}", e))
            })?;

        let opened = ready_rx
            .recv()
            .map_err(|_| {
                EngineError::DeviceUnavailable("Output thread exited during open".to_string())
            })
            .and_then(|result| result);

        let stream = DeviceThreadStream {
            commands: command_tx,
            thread: Some(thread),
        };
        opened.map(|_| Box::new(stream) as Box<dyn OutputStream>)
    }
}

/// Headless output that consumes frames in real time
#[derive(Debug, Clone, Copy)]
pub struct NullBackend {
    available: bool,
}

impl NullBackend {
    pub fn new() -> Self {
        Self { available: true }
    }

    /// A backend whose device can never be opened
    pub fn unavailable() -> Self {
        Self { available: false }
    }

    fn clock_loop(
        mut renderer: Renderer,
        format: OutputFormat,
        period_frames: u32,
        commands: Receiver<DeviceCommand>,
    ) {
        let period = period_frames.max(1) as u64;
        let rate = format.sample_rate.max(1) as f64;
        let tick = Duration::from_secs_f64(period as f64 / rate);
        let mut buffer = vec![0.0f32; period as usize * renderer.channels()];
        // (start of the current run, frames rendered since)
        let mut clock: Option<(Instant, u64)> = None;

        loop {
            match commands.recv_timeout(tick) {
                Ok(DeviceCommand::Play(reply)) => {
                    if clock.is_none() {
                        clock = Some((Instant::now(), 0));
                    }
                    let _ = reply.send(Ok(()));
                }
                Ok(DeviceCommand::Pause(reply)) => {
                    clock = None;
                    let _ = reply.send(Ok(()));
                }
                Ok(DeviceCommand::Close) | Err(RecvTimeoutError::Disconnected) => break,
                Err(RecvTimeoutError::Timeout) => {}
            }

            if let Some((started, rendered)) = clock.as_mut() {
                let due = (started.elapsed().as_secs_f64() * rate) as u64;
                while *rendered + period <= due {
                    renderer.render(&mut buffer);
                    *rendered += period;
                }
            }
        }
    }
}

impl Default for NullBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl AudioBackend for NullBackend {
    fn name(&self) -> &'static str {
        "null"
    }

    fn probe(&self) -> EngineResult<()> {
        if self.available {
            Ok(())
        } else {
            Err(EngineError::DeviceUnavailable("Null device disabled".to_string()))
        }
    }

    fn negotiate(&self, requested: OutputFormat) -> EngineResult<OutputFormat> {
        self.probe()?;
        Ok(requested)
    }

    fn open(
        &self,
        format: OutputFormat,
        period_frames: u32,
        renderer: Renderer,
        _telemetry: Arc<OutputTelemetry>,
    ) -> EngineResult<Box<dyn OutputStream>> {
        self.probe()?;
        let (command_tx, command_rx) = bounded::<DeviceCommand>(8);
        let thread = thread::Builder::new()
            .name("pancake-null-output".to_string())
            .spawn(move || Self::clock_loop(renderer, format, period_frames, command_rx))
            .map_err(|e| {
                EngineError::DeviceUnavailable(format!("Failed to spawn output thread: {}", e))
            })?;

        Ok(Box::new(DeviceThreadStream {
            commands: command_tx,
            thread: Some(thread),
        }))
    }
}
