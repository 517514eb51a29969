//! Symphonia-backed decoders
//!
//! Handles every container and codec the workspace enables in symphonia
//! (WAV, MP3, AAC in ADTS or MP4). Output is interleaved 16-bit PCM at the
//! stream's native rate.

use crate::decoder::{AudioDecoder, DecoderFactory};
use om_core::error::AudioError;
use std::fs::File;
use std::io::Cursor;
use std::path::Path;
use symphonia::core::audio::SampleBuffer;
use symphonia::core::codecs::{Decoder, DecoderOptions, CODEC_TYPE_NULL};
use symphonia::core::errors::Error as SymphoniaError;
use symphonia::core::formats::{FormatOptions, FormatReader, SeekMode, SeekTo};
use symphonia::core::io::{MediaSource, MediaSourceStream};
use symphonia::core::meta::MetadataOptions;
use symphonia::core::probe::Hint;
use symphonia::core::units::{Time, TimeBase};
use tracing::{debug, trace};

const DEFAULT_SAMPLE_RATE: u32 = 44100;

/// Opens streams with symphonia's default probe and codec registry
#[derive(Debug, Clone, Copy, Default)]
pub struct SymphoniaDecoderFactory;

impl DecoderFactory for SymphoniaDecoderFactory {
    fn open_bytes(&self, data: &[u8]) -> Result<Box<dyn AudioDecoder>, AudioError> {
        let source = Cursor::new(data.to_vec());
        Ok(Box::new(SymphoniaDecoder::open(Box::new(source), Hint::new())?))
    }

    fn open_file(&self, path: &Path) -> Result<Box<dyn AudioDecoder>, AudioError> {
        let file = File::open(path)
            .map_err(|e| AudioError::InitializationFailure(format!("{}: {}", path.display(), e)))?;

        let mut hint = Hint::new();
        if let Some(ext) = path.extension().and_then(|e| e.to_str()) {
            hint.with_extension(ext);
        }

        Ok(Box::new(SymphoniaDecoder::open(Box::new(file), hint)?))
    }
}

/// Streaming decoder over one audio track
pub struct SymphoniaDecoder {
    format: Box<dyn FormatReader>,
    decoder: Box<dyn Decoder>,
    track_id: u32,
    sample_rate: u32,
    channels: u16,
    time_base: Option<TimeBase>,
    sample_buf: Option<SampleBuffer<i16>>,
    /// Decoded samples not yet handed out
    pending: Vec<i16>,
    pending_pos: usize,
    /// Decoded frames to discard before the seek target is reached
    skip_frames: u64,
    /// Play position in frames
    position_frames: u64,
}

fn init_err(e: SymphoniaError) -> AudioError {
    AudioError::InitializationFailure(e.to_string())
}

impl SymphoniaDecoder {
    pub fn open(source: Box<dyn MediaSource>, hint: Hint) -> Result<Self, AudioError> {
        let mss = MediaSourceStream::new(source, Default::default());

        let probed = symphonia::default::get_probe()
            .format(&hint, mss, &FormatOptions::default(), &MetadataOptions::default())
            .map_err(init_err)?;
        let format = probed.format;

        let track = format
            .tracks()
            .iter()
            .find(|t| t.codec_params.codec != CODEC_TYPE_NULL)
            .ok_or_else(|| AudioError::InitializationFailure("No audio track".into()))?;

        let track_id = track.id;
        let params = track.codec_params.clone();
        let sample_rate = params.sample_rate.unwrap_or(DEFAULT_SAMPLE_RATE);
        let channels = params.channels.map(|c| c.count() as u16).unwrap_or(2);

        let decoder = symphonia::default::get_codecs()
            .make(&params, &DecoderOptions::default())
            .map_err(init_err)?;

        debug!(
            "Audio stream opened: codec={:?}, {}Hz, {} channels",
            params.codec, sample_rate, channels
        );

        Ok(Self {
            format,
            decoder,
            track_id,
            sample_rate,
            channels,
            time_base: params.time_base,
            sample_buf: None,
            pending: Vec::new(),
            pending_pos: 0,
            skip_frames: 0,
            position_frames: 0,
        })
    }

    /// Convert a timestamp in track time-base units to frames
    fn ts_to_frames(&self, ts: u64) -> u64 {
        match self.time_base {
            Some(tb) => {
                let time = tb.calc_time(ts);
                let rate = u64::from(self.sample_rate);
                time.seconds * rate + (time.frac * rate as f64).round() as u64
            }
            None => ts,
        }
    }

    /// Decode the next packet into `pending`; `false` at end of stream
    fn refill(&mut self) -> Result<bool, AudioError> {
        loop {
            let packet = match self.format.next_packet() {
                Ok(packet) => packet,
                Err(SymphoniaError::IoError(ref e))
                    if e.kind() == std::io::ErrorKind::UnexpectedEof =>
                {
                    return Ok(false)
                }
                Err(SymphoniaError::ResetRequired) => return Ok(false),
                Err(e) => return Err(AudioError::Decode(e.to_string())),
            };

            if packet.track_id() != self.track_id {
                continue;
            }

            let decoded = match self.decoder.decode(&packet) {
                Ok(decoded) => decoded,
                Err(SymphoniaError::DecodeError(e)) => {
                    trace!("Skipping undecodable packet: {}", e);
                    continue;
                }
                Err(e) => return Err(AudioError::Decode(e.to_string())),
            };

            let frames = decoded.capacity();
            let spec = *decoded.spec();
            let needed = frames * spec.channels.count();
            if self.sample_buf.as_ref().map_or(true, |buf| buf.capacity() < needed) {
                self.sample_buf = Some(SampleBuffer::new(frames as u64, spec));
            }
            let Some(buf) = self.sample_buf.as_mut() else {
                continue;
            };
            buf.copy_interleaved_ref(decoded);

            self.pending.clear();
            self.pending.extend_from_slice(buf.samples());
            self.pending_pos = 0;

            if !self.pending.is_empty() {
                return Ok(true);
            }
        }
    }
}

impl AudioDecoder for SymphoniaDecoder {
    fn read(&mut self, out: &mut [i16]) -> Result<usize, AudioError> {
        let mut written = 0;

        while written < out.len() {
            if self.pending_pos == self.pending.len() && !self.refill()? {
                break;
            }

            if self.skip_frames > 0 {
                let width = self.channels.max(1) as usize;
                let frames = ((self.pending.len() - self.pending_pos) / width) as u64;
                let n = frames.min(self.skip_frames);
                self.pending_pos += n as usize * width;
                self.skip_frames -= n;
                if n == 0 {
                    self.pending_pos = self.pending.len();
                }
                continue;
            }

            let available = &self.pending[self.pending_pos..];
            let n = available.len().min(out.len() - written);
            out[written..written + n].copy_from_slice(&available[..n]);
            self.pending_pos += n;
            written += n;
        }

        self.position_frames += (written / self.channels.max(1) as usize) as u64;
        Ok(written)
    }

    fn seek(&mut self, position_ms: u32) -> Result<(), AudioError> {
        let time = Time {
            seconds: u64::from(position_ms / 1000),
            frac: f64::from(position_ms % 1000) / 1000.0,
        };

        let seeked = self
            .format
            .seek(
                SeekMode::Accurate,
                SeekTo::Time {
                    time,
                    track_id: Some(self.track_id),
                },
            )
            .map_err(|e| AudioError::Decode(format!("Seek to {}ms failed: {}", position_ms, e)))?;

        // The reader lands on a packet boundary at or before the target
        let target = self.ts_to_frames(seeked.required_ts);
        let landed = self.ts_to_frames(seeked.actual_ts);

        self.decoder.reset();
        self.pending.clear();
        self.pending_pos = 0;
        self.skip_frames = target.saturating_sub(landed);
        self.position_frames = target;
        trace!(
            "Seeked to {}ms, discarding {} frames",
            position_ms,
            self.skip_frames
        );
        Ok(())
    }

    fn position_ms(&self) -> u32 {
        (self.position_frames * 1000 / u64::from(self.sample_rate.max(1))) as u32
    }

    fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    fn channels(&self) -> u16 {
        self.channels
    }

    fn close(&mut self) {
        self.pending = Vec::new();
        self.sample_buf = None;
        trace!("Audio stream closed");
    }
}
