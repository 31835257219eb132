// Audio decoder using Symphonia
// Decodes audio files to interleaved f32 frames at their native format

use symphonia::core::audio::{AudioBufferRef, AudioPlanes, Signal};
use symphonia::core::codecs::{Decoder, DecoderOptions, CODEC_TYPE_NULL};
use symphonia::core::errors::Error as SymphoniaError;
use symphonia::core::formats::{FormatOptions, FormatReader, SeekMode, SeekTo};
use symphonia::core::io::MediaSourceStream;
use symphonia::core::meta::MetadataOptions;
use symphonia::core::probe::Hint;
use symphonia::core::sample::Sample;
use std::fs::File;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use crate::error::{EngineError, EngineResult};

/// Source properties of an open track
#[derive(Debug, Clone, PartialEq)]
pub struct TrackInfo {
    pub path: PathBuf,
    pub sample_rate: u32,
    pub channels: usize,
    pub bit_depth: Option<u32>,
    /// Total length in frames, when the container reports it
    pub total_frames: Option<u64>,
}

impl TrackInfo {
    pub fn duration_ms(&self) -> i64 {
        self.total_frames
            .map(|frames| (frames as u128 * 1000 / self.sample_rate.max(1) as u128) as i64)
            .unwrap_or(0)
    }

    pub fn ms_to_frames(&self, ms: i64) -> u64 {
        (ms.max(0) as u128 * self.sample_rate as u128 / 1000) as u64
    }
}

/// Open track: decoder context plus read position
pub struct TrackHandle {
    format: Box<dyn FormatReader>,
    decoder: Box<dyn Decoder>,
    track_id: u32,
    info: TrackInfo,
    /// Frame index of the next frame `read_frames` will return
    position: u64,
    /// Decoded samples not handed out yet
    pending: Vec<f32>,
    pending_offset: usize,
    /// Frames to drop after an accurate seek landed early
    skip_frames: u64,
    at_end: bool,
}

impl TrackHandle {
    /// Open an audio file and prepare for decoding
    pub fn open(path: &Path) -> EngineResult<Self> {
        let file = File::open(path).map_err(|e| match e.kind() {
            ErrorKind::NotFound => EngineError::FileNotFound(path.to_path_buf()),
            _ => EngineError::CorruptStream(format!("Failed to open file: {}", e)),
        })?;

        let mss = MediaSourceStream::new(Box::new(file), Default::default());

        // Create a hint using the file extension
        let mut hint = Hint::new();
        if let Some(ext) = path.extension().and_then(|e| e.to_str()) {
            hint.with_extension(ext);
        }

        let format_opts = FormatOptions {
            enable_gapless: true,
            ..Default::default()
        };
        let probed = symphonia::default::get_probe()
            .format(&hint, mss, &format_opts, &MetadataOptions::default())
            .map_err(|e| {
                EngineError::UnsupportedFormat(format!("Failed to probe file format: {}", e))
            })?;

        let format = probed.format;

        // Find the first audio track
        let track = format
            .tracks()
            .iter()
            .find(|t| t.codec_params.codec != CODEC_TYPE_NULL)
            .ok_or_else(|| EngineError::UnsupportedFormat("No audio track found".to_string()))?;

        let track_id = track.id;
        let sample_rate = track
            .codec_params
            .sample_rate
            .ok_or_else(|| EngineError::UnsupportedFormat("Track has no sample rate".to_string()))?;
        let channels = track.codec_params.channels.map(|c| c.count()).unwrap_or(2);
        let bit_depth = track
            .codec_params
            .bits_per_sample
            .or(track.codec_params.bits_per_coded_sample);
        let total_frames = track.codec_params.n_frames;

        // Create decoder for the track
        let decoder = symphonia::default::get_codecs()
            .make(&track.codec_params, &DecoderOptions::default())
            .map_err(|e| {
                EngineError::UnsupportedFormat(format!("Failed to create decoder: {}", e))
            })?;

        tracing::debug!(
            "Opened {:?}: {} Hz, {} ch, {:?} bit, {:?} frames",
            path,
            sample_rate,
            channels,
            bit_depth,
            total_frames
        );

        Ok(Self {
            format,
            decoder,
            track_id,
            info: TrackInfo {
                path: path.to_path_buf(),
                sample_rate,
                channels,
                bit_depth,
                total_frames,
            },
            position: 0,
            pending: Vec::new(),
            pending_offset: 0,
            skip_frames: 0,
            at_end: false,
        })
    }

    pub fn info(&self) -> &TrackInfo {
        &self.info
    }

    pub fn sample_rate(&self) -> u32 {
        self.info.sample_rate
    }

    pub fn channels(&self) -> usize {
        self.info.channels
    }

    /// Frame index of the next frame to be read
    pub fn position(&self) -> u64 {
        self.position
    }

    /// Release the decoder and the file
    pub fn close(self) {
        tracing::debug!("Closed {:?} at frame {}", self.info.path, self.position);
    }

    /// Append up to `max_frames` interleaved frames to `out`.
    /// Returns the number of frames appended; 0 means end of stream.
    pub fn read_frames(&mut self, max_frames: usize, out: &mut Vec<f32>) -> EngineResult<usize> {
        let channels = self.info.channels.max(1);
        let mut produced = 0;

        while produced < max_frames {
            if self.pending_offset >= self.pending.len() {
                if self.at_end || !self.decode_next()? {
                    break;
                }
                continue;
            }

            let available = (self.pending.len() - self.pending_offset) / channels;
            let take = available.min(max_frames - produced);
            let start = self.pending_offset;
            let end = start + take * channels;
            out.extend_from_slice(&self.pending[start..end]);
            self.pending_offset = end;
            produced += take;
        }

        self.position += produced as u64;
        if produced == 0 && self.at_end {
            self.check_complete()?;
        }
        Ok(produced)
    }

    /// Lazily yields chunks of at most `chunk_frames` frames until the end
    /// of the stream or the first error.
    pub fn frames(&mut self, chunk_frames: usize) -> Frames<'_> {
        Frames {
            track: self,
            chunk_frames: chunk_frames.max(1),
            done: false,
        }
    }

    /// Seek so that the next read returns `frame_offset`
    pub fn seek(&mut self, frame_offset: u64) -> EngineResult<()> {
        if let Some(total) = self.info.total_frames {
            if frame_offset > total {
                return Err(EngineError::SeekOutOfRange {
                    requested: frame_offset,
                    total,
                });
            }
        }

        let seeked_to = self
            .format
            .seek(
                SeekMode::Accurate,
                SeekTo::TimeStamp {
                    ts: frame_offset,
                    track_id: self.track_id,
                },
            )
            .map_err(|e| match e {
                SymphoniaError::SeekError(_) => EngineError::SeekOutOfRange {
                    requested: frame_offset,
                    total: self.info.total_frames.unwrap_or(0),
                },
                other => EngineError::CorruptStream(format!("Seek failed: {}", other)),
            })?;

        // Reset decoder state after seek
        self.decoder.reset();
        self.pending.clear();
        self.pending_offset = 0;
        self.at_end = false;
        self.skip_frames = seeked_to.required_ts.saturating_sub(seeked_to.actual_ts);
        self.position = frame_offset;
        Ok(())
    }

    /// Decode the next packet into `pending`. Returns false at end of stream.
    fn decode_next(&mut self) -> EngineResult<bool> {
        loop {
            let packet = match self.format.next_packet() {
                Ok(p) => p,
                Err(SymphoniaError::IoError(ref e)) if e.kind() == ErrorKind::UnexpectedEof => {
                    self.at_end = true;
                    return Ok(false);
                }
                Err(SymphoniaError::ResetRequired) => {
                    // Reset the decoder and try again
                    self.decoder.reset();
                    continue;
                }
                Err(e) => {
                    return Err(EngineError::CorruptStream(format!("Failed to read packet: {}", e)))
                }
            };

            // Skip packets from other tracks
            if packet.track_id() != self.track_id {
                continue;
            }

            match self.decoder.decode(&packet) {
                Ok(decoded) => {
                    self.pending.clear();
                    self.pending_offset = 0;
                    audio_buf_to_f32(&decoded, &mut self.pending);
                    self.drop_skipped_frames();
                    if self.pending.is_empty() {
                        continue;
                    }
                    return Ok(true);
                }
                Err(SymphoniaError::DecodeError(e)) => {
                    // A single bad packet is recoverable
                    tracing::warn!("Decode error (skipping packet): {}", e);
                    continue;
                }
                Err(e) => return Err(EngineError::CorruptStream(format!("Decode failed: {}", e))),
            }
        }
    }

    /// A stream that ends well short of the length its header promised was
    /// cut off, not finished.
    fn check_complete(&self) -> EngineResult<()> {
        let Some(total) = self.info.total_frames else {
            return Ok(());
        };
        let tolerance = (self.info.sample_rate as u64 / 10).max(total / 100);
        if self.position + tolerance < total {
            return Err(EngineError::CorruptStream(format!(
                "Stream ended at frame {} of {}",
                self.position, total
            )));
        }
        Ok(())
    }

    fn drop_skipped_frames(&mut self) {
        if self.skip_frames == 0 {
            return;
        }
        let channels = self.info.channels.max(1);
        let frames = (self.pending.len() / channels) as u64;
        let drop = self.skip_frames.min(frames);
        self.pending_offset = drop as usize * channels;
        self.skip_frames -= drop;
    }
}

/// Lazy chunk sequence over a track
pub struct Frames<'a> {
    track: &'a mut TrackHandle,
    chunk_frames: usize,
    done: bool,
}

impl Iterator for Frames<'_> {
    type Item = EngineResult<Vec<f32>>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        let mut chunk = Vec::with_capacity(self.chunk_frames * self.track.channels());
        match self.track.read_frames(self.chunk_frames, &mut chunk) {
            Ok(0) => {
                self.done = true;
                None
            }
            Ok(_) => Some(Ok(chunk)),
            Err(e) => {
                self.done = true;
                Some(Err(e))
            }
        }
    }
}

/// Convert any AudioBufferRef to interleaved f32 samples
fn audio_buf_to_f32(buf: &AudioBufferRef, out: &mut Vec<f32>) {
    match buf {
        AudioBufferRef::F32(b) => interleave_convert(b.planes(), b.frames(), |s: f32| s, out),
        AudioBufferRef::F64(b) => {
            interleave_convert(b.planes(), b.frames(), |s: f64| s as f32, out)
        }
        AudioBufferRef::S8(b) => {
            let scale = 1.0 / 128.0;
            interleave_convert(b.planes(), b.frames(), |s: i8| s as f32 * scale, out)
        }
        AudioBufferRef::S16(b) => {
            let scale = 1.0 / 32768.0;
            interleave_convert(b.planes(), b.frames(), |s: i16| s as f32 * scale, out)
        }
        AudioBufferRef::S24(b) => {
            let scale = 1.0 / 8388608.0;
            interleave_convert(b.planes(), b.frames(), |s| s.inner() as f32 * scale, out)
        }
        AudioBufferRef::S32(b) => {
            let scale = 1.0 / 2147483648.0;
            interleave_convert(b.planes(), b.frames(), |s: i32| s as f32 * scale, out)
        }
        AudioBufferRef::U8(b) => {
            interleave_convert(b.planes(), b.frames(), |s: u8| (s as f32 - 128.0) / 128.0, out)
        }
        AudioBufferRef::U16(b) => {
            interleave_convert(b.planes(), b.frames(), |s: u16| (s as f32 - 32768.0) / 32768.0, out)
        }
        AudioBufferRef::U24(b) => interleave_convert(
            b.planes(),
            b.frames(),
            |s| (s.inner() as f32 - 8388608.0) / 8388608.0,
            out,
        ),
        AudioBufferRef::U32(b) => interleave_convert(
            b.planes(),
            b.frames(),
            |s: u32| (s as f64 - 2147483648.0) as f32 / 2147483648.0,
            out,
        ),
    }
}

fn interleave_convert<T: Sample + Copy, F: Fn(T) -> f32>(
    planes: AudioPlanes<T>,
    frames: usize,
    convert: F,
    out: &mut Vec<f32>,
) {
    let planes = planes.planes();
    if planes.is_empty() || frames == 0 {
        return;
    }

    out.reserve(frames * planes.len());
    for frame in 0..frames {
        for plane in planes {
            out.push(convert(plane[frame]));
        }
    }
}
