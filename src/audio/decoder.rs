//! Audio decoder using Symphonia
//!
//! `SymphoniaSource` decodes a local file into f32 samples, publishes its
//! playback position through an atomic clock, and supports seeking.

use std::fs::File;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use rodio::source::SeekError;
use rodio::Source;
use symphonia::core::audio::SampleBuffer;
use symphonia::core::codecs::DecoderOptions;
use symphonia::core::formats::{FormatOptions, SeekMode, SeekTo};
use symphonia::core::io::{MediaSource, MediaSourceStream};
use symphonia::core::meta::MetadataOptions;
use symphonia::core::probe::Hint;
use symphonia::core::units::{Time, TimeBase};

use crate::error::EngineError;

use super::types::TrackInfo;

/// Convert a symphonia codec type to a human-readable name
pub fn codec_type_to_name(codec: symphonia::core::codecs::CodecType) -> String {
    use symphonia::core::codecs::*;
    match codec {
        CODEC_TYPE_AAC => "AAC".to_string(),
        CODEC_TYPE_FLAC => "FLAC".to_string(),
        CODEC_TYPE_MP3 => "MP3".to_string(),
        CODEC_TYPE_VORBIS => "Vorbis".to_string(),
        CODEC_TYPE_PCM_U8 => "PCM 8-bit".to_string(),
        CODEC_TYPE_PCM_S16LE | CODEC_TYPE_PCM_S16BE => "PCM 16-bit".to_string(),
        CODEC_TYPE_PCM_S24LE | CODEC_TYPE_PCM_S24BE => "PCM 24-bit".to_string(),
        CODEC_TYPE_PCM_S32LE | CODEC_TYPE_PCM_S32BE => "PCM 32-bit".to_string(),
        CODEC_TYPE_PCM_F32LE | CODEC_TYPE_PCM_F32BE => "PCM 32-bit Float".to_string(),
        CODEC_TYPE_PCM_F64LE | CODEC_TYPE_PCM_F64BE => "PCM 64-bit Float".to_string(),
        CODEC_TYPE_ALAC => "ALAC".to_string(),
        _ => "Audio".to_string(),
    }
}

/// A symphonia-based, seekable audio source for local tracks
pub struct SymphoniaSource {
    decoder: Box<dyn symphonia::core::codecs::Decoder>,
    format: Box<dyn symphonia::core::formats::FormatReader>,
    track_id: u32,
    time_base: Option<TimeBase>,
    sample_buf: Option<SampleBuffer<f32>>,
    sample_idx: usize,
    channels: u16,
    sample_rate: u32,
    codec_name: String,
    duration_secs: f64,
    /// Current decode position in milliseconds, readable from other threads
    position_ms: Arc<AtomicU64>,
    /// Stores the last non-EOF error for the engine to check after the
    /// stream ends
    last_error: Arc<Mutex<Option<String>>>,
}

impl SymphoniaSource {
    /// Open and probe a local file, auto-detecting the format from content
    /// with the file extension as a hint.
    pub fn from_path(path: &Path) -> Result<Self, EngineError> {
        let file = File::open(path)
            .map_err(|e| EngineError::Audio(format!("Cannot open {}: {}", path.display(), e)))?;
        let hint = path
            .extension()
            .and_then(|e| e.to_str())
            .map(|s| s.to_string());
        Self::from_media_source(Box::new(file), hint.as_deref())
    }

    /// Create a source from any seekable media source (used by tests with
    /// in-memory WAV data).
    pub fn from_media_source(
        source: Box<dyn MediaSource>,
        format_hint: Option<&str>,
    ) -> Result<Self, EngineError> {
        let mss = MediaSourceStream::new(source, Default::default());

        let mut hint = Hint::new();
        if let Some(ext) = format_hint {
            hint.with_extension(ext);
        }

        let probed = symphonia::default::get_probe()
            .format(
                &hint,
                mss,
                &FormatOptions::default(),
                &MetadataOptions::default(),
            )
            .map_err(|e| EngineError::Decode(format!("Probe error: {}", e)))?;

        let format = probed.format;

        let track = format
            .tracks()
            .iter()
            .find(|t| t.codec_params.codec != symphonia::core::codecs::CODEC_TYPE_NULL)
            .ok_or_else(|| EngineError::Decode("No audio track found".to_string()))?;

        let track_id = track.id;
        let codec_params = track.codec_params.clone();

        let decoder = symphonia::default::get_codecs()
            .make(&codec_params, &DecoderOptions::default())
            .map_err(|e| EngineError::Decode(format!("Decoder creation error: {}", e)))?;

        let channels = codec_params.channels.map(|c| c.count() as u16).unwrap_or(2);
        let sample_rate = codec_params.sample_rate.unwrap_or(44100);
        let codec_name = codec_type_to_name(codec_params.codec);
        let time_base = codec_params.time_base;

        let duration_secs = match (codec_params.n_frames, time_base) {
            (Some(frames), Some(tb)) => {
                let t = tb.calc_time(frames);
                t.seconds as f64 + t.frac
            }
            (Some(frames), None) if sample_rate > 0 => frames as f64 / sample_rate as f64,
            _ => 0.0,
        };

        let mut source = Self {
            decoder,
            format,
            track_id,
            time_base,
            sample_buf: None,
            sample_idx: 0,
            channels,
            sample_rate,
            codec_name,
            duration_secs,
            position_ms: Arc::new(AtomicU64::new(0)),
            last_error: Arc::new(Mutex::new(None)),
        };

        // Pre-decode the first packet so the reported rate/channels reflect
        // actual decoder output before rodio configures its resampler.
        source.decode_next_packet();

        Ok(source)
    }

    /// Track length in seconds; 0.0 when the container does not report it
    pub fn duration_secs(&self) -> f64 {
        self.duration_secs
    }

    /// Handle to the decode-position clock (milliseconds)
    pub fn position_clock(&self) -> Arc<AtomicU64> {
        self.position_ms.clone()
    }

    /// Get the error slot for checking after the stream ends.
    ///
    /// If the stream ended due to an IO or decode error (not clean EOF),
    /// the slot will contain the error message.
    pub fn error_slot(&self) -> Arc<Mutex<Option<String>>> {
        self.last_error.clone()
    }

    /// Full track info for the given path
    pub fn track_info(&self, path: &Path) -> TrackInfo {
        TrackInfo {
            path: path.to_path_buf(),
            codec_name: self.codec_name.clone(),
            channels: self.channels,
            sample_rate: self.sample_rate,
            duration_secs: self.duration_secs,
        }
    }

    fn publish_position(&self, ts: u64) {
        if let Some(tb) = self.time_base {
            let t = tb.calc_time(ts);
            let ms = t.seconds * 1000 + (t.frac * 1000.0) as u64;
            self.position_ms.store(ms, Ordering::Relaxed);
        } else if self.sample_rate > 0 {
            let ms = ts * 1000 / self.sample_rate as u64;
            self.position_ms.store(ms, Ordering::Relaxed);
        }
    }

    fn decode_next_packet(&mut self) -> bool {
        loop {
            match self.format.next_packet() {
                Ok(packet) => {
                    if packet.track_id() != self.track_id {
                        continue;
                    }

                    self.publish_position(packet.ts());

                    match self.decoder.decode(&packet) {
                        Ok(decoded) => {
                            let spec = *decoded.spec();
                            let duration = decoded.capacity() as u64;

                            self.sample_rate = spec.rate;
                            self.channels = spec.channels.count() as u16;

                            let needs_realloc = self
                                .sample_buf
                                .as_ref()
                                .map_or(true, |b| b.capacity() < duration as usize);
                            if needs_realloc {
                                self.sample_buf = Some(SampleBuffer::new(duration, spec));
                            }

                            if let Some(ref mut buf) = self.sample_buf {
                                buf.copy_interleaved_ref(decoded);
                                self.sample_idx = 0;
                                return true;
                            }
                        }
                        Err(symphonia::core::errors::Error::DecodeError(_)) => {
                            // Corrupt packet, skip and keep decoding
                            continue;
                        }
                        Err(e) => {
                            if let Ok(mut err) = self.last_error.lock() {
                                *err = Some(format!("{}", e));
                            }
                            return false;
                        }
                    }
                }
                Err(symphonia::core::errors::Error::IoError(e))
                    if e.kind() == std::io::ErrorKind::UnexpectedEof =>
                {
                    // Clean EOF, track ended naturally, no error stored
                    return false;
                }
                Err(e) => {
                    if let Ok(mut err) = self.last_error.lock() {
                        *err = Some(format!("{}", e));
                    }
                    return false;
                }
            }
        }
    }
}

impl Iterator for SymphoniaSource {
    type Item = f32;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if let Some(ref buf) = self.sample_buf {
                if self.sample_idx < buf.samples().len() {
                    let sample = buf.samples()[self.sample_idx];
                    self.sample_idx += 1;
                    return Some(sample);
                }
            }

            if !self.decode_next_packet() {
                return None;
            }
        }
    }
}

impl Source for SymphoniaSource {
    fn current_frame_len(&self) -> Option<usize> {
        None
    }

    fn channels(&self) -> u16 {
        self.channels
    }

    fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    fn total_duration(&self) -> Option<Duration> {
        if self.duration_secs > 0.0 {
            Some(Duration::from_secs_f64(self.duration_secs))
        } else {
            None
        }
    }

    fn try_seek(&mut self, pos: Duration) -> Result<(), SeekError> {
        let target = Time::from(pos.as_secs_f64());
        match self.format.seek(
            SeekMode::Accurate,
            SeekTo::Time {
                time: target,
                track_id: Some(self.track_id),
            },
        ) {
            Ok(seeked) => {
                self.decoder.reset();
                self.sample_buf = None;
                self.sample_idx = 0;
                self.publish_position(seeked.actual_ts);
                Ok(())
            }
            Err(e) => {
                if let Ok(mut err) = self.last_error.lock() {
                    *err = Some(format!("Seek error: {}", e));
                }
                Err(SeekError::NotSupported {
                    underlying_source: "symphonia",
                })
            }
        }
    }
}
