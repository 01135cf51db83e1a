//! PCM16 codec for the uplink and downlink
//!
//! Both directions carry raw signed 16-bit little-endian mono PCM; only the
//! sample rate differs. The mime descriptor travels with every chunk.

pub mod decoder;
pub mod encoder;

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use bytes::Bytes;

use crate::error::CodecError;

pub use decoder::DownlinkDecoder;
pub use encoder::{rms_volume, UplinkEncoder};

/// Mime descriptor for signed 16-bit little-endian PCM at a given rate
///
/// Rendered and parsed as `audio/pcm;rate=<hz>`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PcmFormat {
    pub rate_hz: u32,
}

impl PcmFormat {
    pub const MIME_TYPE: &'static str = "audio/pcm";

    pub fn new(rate_hz: u32) -> Self {
        Self { rate_hz }
    }

    /// Parse a mime string, using `default_rate` when no rate parameter is present
    pub fn parse_with_default(mime: &str, default_rate: u32) -> Result<Self, CodecError> {
        let mut parts = mime.split(';').map(str::trim);
        let essence = parts.next().unwrap_or_default();
        if !essence.eq_ignore_ascii_case(Self::MIME_TYPE) {
            return Err(CodecError::UnsupportedMime(mime.to_string()));
        }

        let mut rate_hz = default_rate;
        for param in parts {
            if let Some((key, value)) = param.split_once('=') {
                if key.trim().eq_ignore_ascii_case("rate") {
                    rate_hz = value
                        .trim()
                        .parse()
                        .ok()
                        .filter(|r| *r > 0)
                        .ok_or_else(|| CodecError::UnsupportedMime(mime.to_string()))?;
                }
            }
        }

        Ok(Self { rate_hz })
    }
}

impl fmt::Display for PcmFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{};rate={}", Self::MIME_TYPE, self.rate_hz)
    }
}

impl FromStr for PcmFormat {
    type Err = CodecError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        // A bare "audio/pcm" has no rate to fall back to
        let format = Self::parse_with_default(s, 0)?;
        if format.rate_hz == 0 {
            return Err(CodecError::UnsupportedMime(s.to_string()));
        }
        Ok(format)
    }
}

/// Transport-ready PCM payload derived from exactly one frame
#[derive(Debug, Clone, PartialEq)]
pub struct EncodedChunk {
    pub format: PcmFormat,
    pub data: Bytes,
}

impl EncodedChunk {
    pub fn mime_type(&self) -> String {
        self.format.to_string()
    }
}

/// Instantaneous frame volume in [0, 1]
pub type VolumeSample = f32;

/// Playable mono audio produced from one inbound chunk
#[derive(Debug, Clone, PartialEq)]
pub struct DecodedBuffer {
    samples: Arc<[f32]>,
    sample_rate: u32,
}

impl DecodedBuffer {
    pub fn new(samples: Vec<f32>, sample_rate: u32) -> Self {
        Self {
            samples: samples.into(),
            sample_rate,
        }
    }

    pub fn samples(&self) -> &[f32] {
        &self.samples
    }

    /// Shared handle to the samples, for handing to an output device
    pub fn shared_samples(&self) -> Arc<[f32]> {
        self.samples.clone()
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    /// Duration in seconds
    pub fn duration(&self) -> f64 {
        self.samples.len() as f64 / self.sample_rate as f64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mime_display() {
        assert_eq!(PcmFormat::new(16_000).to_string(), "audio/pcm;rate=16000");
    }

    #[test]
    fn test_mime_parse() {
        assert_eq!("audio/pcm;rate=24000".parse::<PcmFormat>().unwrap().rate_hz, 24_000);
        assert_eq!(
            PcmFormat::parse_with_default("audio/pcm; rate=16000", 24_000).unwrap().rate_hz,
            16_000
        );
        assert_eq!(PcmFormat::parse_with_default("audio/pcm", 24_000).unwrap().rate_hz, 24_000);
        assert!("audio/pcm".parse::<PcmFormat>().is_err());
        assert!("audio/opus;rate=48000".parse::<PcmFormat>().is_err());
        assert!("audio/pcm;rate=abc".parse::<PcmFormat>().is_err());
    }

    #[test]
    fn test_buffer_duration() {
        let buffer = DecodedBuffer::new(vec![0.0; 12_000], 24_000);
        assert!((buffer.duration() - 0.5).abs() < 1e-9);
    }
}
