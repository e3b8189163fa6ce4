//! PCM16 conversion between capture/playback samples and the wire format.
//!
//! Everything here is pure: no state, no I/O.

use std::time::Duration;
use thiserror::Error;

use crate::audio_capture::AudioFrame;

/// Scale between f32 samples and i16 PCM values
const PCM_SCALE: f32 = 32768.0;
const PCM_LIMIT: f32 = 32767.0;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DecodeError {
    #[error("PCM16 payload has odd length ({0} bytes)")]
    OddLength(usize),
    #[error("PCM16 payload of {bytes} bytes is not a whole number of {channels}-channel frames")]
    PartialFrame { bytes: usize, channels: u16 },
    #[error("Invalid sample rate: {0}")]
    InvalidSampleRate(u32),
}

/// Sample encoding on the wire
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Encoding {
    /// Signed 16-bit little-endian PCM
    Pcm16,
}

/// Format metadata attached to an encoded chunk
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AudioFormat {
    pub encoding: Encoding,
    pub sample_rate: u32,
    pub channels: u16,
}

impl AudioFormat {
    pub fn pcm16(sample_rate: u32, channels: u16) -> Self {
        Self {
            encoding: Encoding::Pcm16,
            sample_rate,
            channels,
        }
    }

    /// MIME descriptor used by the streaming service, e.g. `audio/pcm;rate=16000`
    pub fn mime_type(&self) -> String {
        if self.channels > 1 {
            format!("audio/pcm;rate={};channels={}", self.sample_rate, self.channels)
        } else {
            format!("audio/pcm;rate={}", self.sample_rate)
        }
    }

    /// Parse a PCM MIME descriptor. Missing parameters fall back to
    /// `default_rate` and mono. Returns `None` for non-PCM types.
    pub fn from_mime(mime: &str, default_rate: u32) -> Option<Self> {
        let mut parts = mime.split(';').map(str::trim);
        let essence = parts.next()?.to_ascii_lowercase();
        if essence != "audio/pcm" && essence != "audio/l16" {
            return None;
        }

        let mut format = Self::pcm16(default_rate, 1);
        for param in parts {
            let Some((key, value)) = param.split_once('=') else {
                continue;
            };
            match key.trim().to_ascii_lowercase().as_str() {
                "rate" => format.sample_rate = value.trim().parse().ok()?,
                "channels" => format.channels = value.trim().parse().ok()?,
                _ => {}
            }
        }
        Some(format)
    }
}

/// A byte payload plus its format, ready for the transport
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncodedChunk {
    pub data: Vec<u8>,
    pub format: AudioFormat,
}

impl EncodedChunk {
    pub fn mime_type(&self) -> String {
        self.format.mime_type()
    }
}

/// Decoded, de-interleaved audio
#[derive(Debug, Clone, PartialEq)]
pub struct AudioBuffer {
    pub sample_rate: u32,
    /// One sample vector per channel, all of equal length
    pub channels: Vec<Vec<f32>>,
}

impl AudioBuffer {
    pub fn mono(samples: Vec<f32>, sample_rate: u32) -> Self {
        Self {
            sample_rate,
            channels: vec![samples],
        }
    }

    /// Number of sample frames (samples per channel)
    pub fn frames(&self) -> usize {
        self.channels.first().map_or(0, Vec::len)
    }

    pub fn is_empty(&self) -> bool {
        self.frames() == 0
    }

    pub fn duration(&self) -> Duration {
        if self.sample_rate == 0 {
            return Duration::ZERO;
        }
        let nanos = self.frames() as u128 * 1_000_000_000 / u128::from(self.sample_rate);
        Duration::from_nanos(nanos as u64)
    }

    /// Average all channels down to one
    pub fn to_mono(&self) -> Vec<f32> {
        match self.channels.len() {
            0 => Vec::new(),
            1 => self.channels[0].clone(),
            n => (0..self.frames())
                .map(|i| self.channels.iter().map(|c| c[i]).sum::<f32>() / n as f32)
                .collect(),
        }
    }
}

/// Stateless f32 <-> PCM16 codec
pub struct FrameCodec;

impl FrameCodec {
    /// Encode a captured frame as mono PCM16 LE.
    pub fn encode(frame: &AudioFrame) -> EncodedChunk {
        let mut data = Vec::with_capacity(frame.samples.len() * 2);
        for &sample in &frame.samples {
            data.extend_from_slice(&Self::sample_to_i16(sample).to_le_bytes());
        }

        EncodedChunk {
            data,
            format: AudioFormat::pcm16(frame.sample_rate, 1),
        }
    }

    /// Decode PCM16 LE, de-interleaving the declared channel count.
    pub fn decode(chunk: &EncodedChunk) -> Result<AudioBuffer, DecodeError> {
        let format = chunk.format;
        if format.sample_rate == 0 {
            return Err(DecodeError::InvalidSampleRate(format.sample_rate));
        }
        if chunk.data.len() % 2 != 0 {
            return Err(DecodeError::OddLength(chunk.data.len()));
        }

        let channels = usize::from(format.channels.max(1));
        if chunk.data.len() % (2 * channels) != 0 {
            return Err(DecodeError::PartialFrame {
                bytes: chunk.data.len(),
                channels: format.channels,
            });
        }

        let frames = chunk.data.len() / (2 * channels);
        let mut out = vec![Vec::with_capacity(frames); channels];
        for (i, pair) in chunk.data.chunks_exact(2).enumerate() {
            let value = i16::from_le_bytes([pair[0], pair[1]]);
            out[i % channels].push(f32::from(value) / PCM_SCALE);
        }

        Ok(AudioBuffer {
            sample_rate: format.sample_rate,
            channels: out,
        })
    }

    fn sample_to_i16(sample: f32) -> i16 {
        // NaN casts to 0
        (sample * PCM_SCALE).round().clamp(-PCM_LIMIT, PCM_LIMIT) as i16
    }
}
