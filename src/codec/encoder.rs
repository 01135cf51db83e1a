//! Uplink encoder
//!
//! Turns a captured frame into a PCM16 chunk plus a volume reading.
//! Stateless: one call per frame, nothing carried between frames.

use bytes::{BufMut, BytesMut};

use crate::audio::buffer::AudioFrame;
use crate::codec::{EncodedChunk, PcmFormat, VolumeSample};

/// PCM16 uplink encoder
#[derive(Debug, Clone, Copy)]
pub struct UplinkEncoder {
    format: PcmFormat,
}

impl UplinkEncoder {
    pub fn new(rate_hz: u32) -> Self {
        Self {
            format: PcmFormat::new(rate_hz),
        }
    }

    /// Encode one frame
    pub fn encode(&self, frame: &AudioFrame) -> (EncodedChunk, VolumeSample) {
        let samples = frame.samples();
        let mut data = BytesMut::with_capacity(samples.len() * 2);
        for &sample in samples {
            data.put_i16_le(float_to_pcm16(sample));
        }

        let chunk = EncodedChunk {
            format: self.format,
            data: data.freeze(),
        };
        (chunk, rms_volume(samples))
    }
}

/// Clamp to [-1, 1] and scale onto the full i16 range
///
/// Negative samples scale by 32768 and positive ones by 32767 so both
/// extremes are reachable; rounding is half away from zero.
pub fn float_to_pcm16(sample: f32) -> i16 {
    // NaN clamps to NaN; treat it as silence
    let clamped = if sample.is_nan() { 0.0 } else { sample.clamp(-1.0, 1.0) };
    let scaled = if clamped < 0.0 {
        clamped * 32768.0
    } else {
        clamped * 32767.0
    };
    scaled.round() as i16
}

/// Root-mean-square of the samples, clamped to [0, 1]
pub fn rms_volume(samples: &[f32]) -> VolumeSample {
    if samples.is_empty() {
        return 0.0;
    }
    let sum_squares: f64 = samples.iter().map(|&s| (s as f64) * (s as f64)).sum();
    let rms = (sum_squares / samples.len() as f64).sqrt() as f32;
    if rms.is_nan() {
        0.0
    } else {
        rms.clamp(0.0, 1.0)
    }
}
