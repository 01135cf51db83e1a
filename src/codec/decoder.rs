//! Downlink decoder
//!
//! Converts inbound PCM16 payloads into playable float buffers. A
//! malformed payload yields a [`CodecError`]; callers drop the chunk and
//! carry on, so nothing here is fatal to a session.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use bytes::{Buf, Bytes};

use crate::codec::{DecodedBuffer, EncodedChunk, PcmFormat};
use crate::error::CodecError;

/// PCM16 downlink decoder
pub struct DownlinkDecoder {
    /// Rate assumed when the mime type carries none
    default_rate: u32,
    chunks_decoded: u64,
    chunks_dropped: u64,
}

impl DownlinkDecoder {
    pub fn new(default_rate: u32) -> Self {
        Self {
            default_rate,
            chunks_decoded: 0,
            chunks_dropped: 0,
        }
    }

    /// Decode a binary chunk
    pub fn decode(&mut self, chunk: &EncodedChunk) -> Result<DecodedBuffer, CodecError> {
        let result = pcm16_to_buffer(chunk.data.clone(), chunk.format);
        self.record(&result);
        result
    }

    /// Decode an inline payload as it arrives on the wire: mime string plus
    /// base64 text
    pub fn decode_inline(&mut self, mime_type: &str, data: &str) -> Result<DecodedBuffer, CodecError> {
        let result = PcmFormat::parse_with_default(mime_type, self.default_rate).and_then(|format| {
            let bytes = BASE64
                .decode(data)
                .map_err(|e| CodecError::InvalidBase64(e.to_string()))?;
            pcm16_to_buffer(Bytes::from(bytes), format)
        });
        self.record(&result);
        result
    }

    fn record(&mut self, result: &Result<DecodedBuffer, CodecError>) {
        match result {
            Ok(_) => self.chunks_decoded += 1,
            Err(_) => self.chunks_dropped += 1,
        }
    }

    /// Get statistics
    pub fn stats(&self) -> DecoderStats {
        DecoderStats {
            chunks_decoded: self.chunks_decoded,
            chunks_dropped: self.chunks_dropped,
        }
    }
}

/// Decoder statistics
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DecoderStats {
    pub chunks_decoded: u64,
    pub chunks_dropped: u64,
}

fn pcm16_to_buffer(mut data: Bytes, format: PcmFormat) -> Result<DecodedBuffer, CodecError> {
    // A zero rate would give the buffer an infinite duration
    if format.rate_hz == 0 {
        return Err(CodecError::UnsupportedMime(format.to_string()));
    }
    if data.is_empty() {
        return Err(CodecError::EmptyPayload);
    }
    if data.len() % 2 != 0 {
        return Err(CodecError::TruncatedPayload(data.len()));
    }

    let mut samples = Vec::with_capacity(data.len() / 2);
    while data.has_remaining() {
        samples.push(data.get_i16_le() as f32 / 32768.0);
    }

    Ok(DecodedBuffer::new(samples, format.rate_hz))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::buffer::AudioFrame;
    use crate::codec::UplinkEncoder;

    #[test]
    fn test_decode_inline() {
        let pcm: Vec<u8> = [0i16, 16384, -32768, 32767]
            .iter()
            .flat_map(|s| s.to_le_bytes())
            .collect();
        let data = BASE64.encode(&pcm);

        let mut decoder = DownlinkDecoder::new(24_000);
        let buffer = decoder.decode_inline("audio/pcm;rate=24000", &data).unwrap();

        assert_eq!(buffer.sample_rate(), 24_000);
        assert_eq!(buffer.samples(), &[0.0, 0.5, -1.0, 32767.0 / 32768.0]);
        assert_eq!(decoder.stats().chunks_decoded, 1);
    }

    #[test]
    fn test_missing_rate_uses_default() {
        let data = BASE64.encode([0u8; 48]);
        let mut decoder = DownlinkDecoder::new(24_000);
        let buffer = decoder.decode_inline("audio/pcm", &data).unwrap();
        assert_eq!(buffer.sample_rate(), 24_000);
        assert_eq!(buffer.samples().len(), 24);
    }

    #[test]
    fn test_malformed_payloads_are_errors() {
        let mut decoder = DownlinkDecoder::new(24_000);

        assert!(matches!(
            decoder.decode_inline("audio/pcm;rate=24000", "***not base64***"),
            Err(CodecError::InvalidBase64(_))
        ));
        assert!(matches!(
            decoder.decode_inline("audio/pcm;rate=24000", &BASE64.encode([1u8, 2, 3])),
            Err(CodecError::TruncatedPayload(3))
        ));
        assert!(matches!(
            decoder.decode_inline("audio/mpeg", &BASE64.encode([0u8; 4])),
            Err(CodecError::UnsupportedMime(_))
        ));
        assert_eq!(
            decoder.decode_inline("audio/pcm;rate=24000", ""),
            Err(CodecError::EmptyPayload)
        );

        let stats = decoder.stats();
        assert_eq!(stats.chunks_dropped, 4);
        assert_eq!(stats.chunks_decoded, 0);
    }

    #[test]
    fn test_uplink_chunk_decodes() {
        let encoder = UplinkEncoder::new(16_000);
        let (chunk, _) = encoder.encode(&AudioFrame::new(vec![0.25; 160], 16_000));

        let mut decoder = DownlinkDecoder::new(24_000);
        let buffer = decoder.decode(&chunk).unwrap();
        assert_eq!(buffer.sample_rate(), 16_000);
        assert!((buffer.duration() - 0.01).abs() < 1e-9);
        assert!(buffer.samples().iter().all(|s| (s - 0.25).abs() < 1e-4));
    }

    #[test]
    fn test_zero_rate_is_rejected() {
        let chunk = EncodedChunk {
            format: PcmFormat::new(0),
            data: Bytes::from_static(&[0, 0, 1, 0]),
        };

        let mut decoder = DownlinkDecoder::new(24_000);
        assert!(matches!(decoder.decode(&chunk), Err(CodecError::UnsupportedMime(_))));

        // No rate in the mime type and no usable default either
        let mut decoder = DownlinkDecoder::new(0);
        assert!(matches!(
            decoder.decode_inline("audio/pcm", &BASE64.encode([0u8; 4])),
            Err(CodecError::UnsupportedMime(_))
        ));
        assert_eq!(decoder.stats().chunks_dropped, 1);
    }
}
