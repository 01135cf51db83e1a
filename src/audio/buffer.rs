//! Audio frames and sample accumulation
//!
//! Device callbacks deliver blocks of arbitrary size, interleaved and at
//! the device rate. The helpers here turn them into fixed-size mono frames
//! at the session rate.

use std::sync::Arc;

use rubato::{FastFixedIn, PolynomialDegree, Resampler};

use crate::error::AudioError;

/// Input samples converted per resampler call
const RESAMPLE_CHUNK: usize = 1024;

/// Fixed-length block of mono samples in -1.0..1.0
///
/// Immutable once produced; clones share the sample storage.
#[derive(Clone, Debug, PartialEq)]
pub struct AudioFrame {
    samples: Arc<[f32]>,
    sample_rate: u32,
}

impl AudioFrame {
    pub fn new(samples: Vec<f32>, sample_rate: u32) -> Self {
        Self {
            samples: samples.into(),
            sample_rate,
        }
    }

    pub fn samples(&self) -> &[f32] {
        &self.samples
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// Get frame duration in microseconds
    pub fn duration_us(&self) -> u64 {
        if self.sample_rate == 0 {
            return 0;
        }
        (self.samples.len() as u64 * 1_000_000) / self.sample_rate as u64
    }
}

/// Accumulates samples and cuts them into frames of exactly `frame_size`
pub struct FrameAssembler {
    pending: Vec<f32>,
    frame_size: usize,
    sample_rate: u32,
}

impl FrameAssembler {
    pub fn new(frame_size: usize, sample_rate: u32) -> Self {
        Self {
            pending: Vec::with_capacity(frame_size * 2),
            frame_size,
            sample_rate,
        }
    }

    /// Append samples, emitting every completed frame in order
    pub fn push(&mut self, samples: &[f32], mut emit: impl FnMut(AudioFrame)) {
        self.pending.extend_from_slice(samples);

        while self.pending.len() >= self.frame_size {
            let frame: Vec<f32> = self.pending.drain(..self.frame_size).collect();
            emit(AudioFrame::new(frame, self.sample_rate));
        }
    }

    /// Samples waiting for the next frame
    pub fn pending(&self) -> usize {
        self.pending.len()
    }
}

/// Average interleaved channels down to mono
pub fn downmix_to_mono(data: &[f32], channels: u16) -> Vec<f32> {
    if channels <= 1 {
        return data.to_vec();
    }
    let channels = channels as usize;
    data.chunks(channels)
        .map(|c| c.iter().sum::<f32>() / c.len() as f32)
        .collect()
}

/// Rate converter that keeps its phase across device callbacks
///
/// Input is buffered and converted in fixed chunks, so the output does not
/// depend on how the device happened to split the stream into blocks.
pub struct StreamResampler {
    resampler: Option<FastFixedIn<f32>>,
    input: Vec<f32>,
}

impl StreamResampler {
    pub fn new(from_rate: u32, to_rate: u32) -> Result<Self, AudioError> {
        Self::with_chunk_size(from_rate, to_rate, RESAMPLE_CHUNK)
    }

    pub fn with_chunk_size(from_rate: u32, to_rate: u32, chunk_size: usize) -> Result<Self, AudioError> {
        if from_rate == 0 || to_rate == 0 {
            return Err(AudioError::UnsupportedFormat(format!(
                "cannot resample {} Hz to {} Hz",
                from_rate, to_rate
            )));
        }

        let resampler = if from_rate == to_rate {
            None
        } else {
            let ratio = to_rate as f64 / from_rate as f64;
            let resampler = FastFixedIn::<f32>::new(ratio, 10.0, PolynomialDegree::Septic, chunk_size, 1)
                .map_err(|e| AudioError::UnsupportedFormat(e.to_string()))?;
            Some(resampler)
        };

        Ok(Self {
            resampler,
            input: Vec::with_capacity(chunk_size * 2),
        })
    }

    /// Convert the next block; a partial chunk is held until more input arrives
    pub fn process(&mut self, samples: &[f32]) -> Result<Vec<f32>, AudioError> {
        let Some(resampler) = self.resampler.as_mut() else {
            return Ok(samples.to_vec());
        };

        self.input.extend_from_slice(samples);

        let mut output = Vec::new();
        let mut consumed = 0;
        loop {
            let needed = resampler.input_frames_next();
            if self.input.len() - consumed < needed {
                break;
            }
            let chunk = &self.input[consumed..consumed + needed];
            let resampled = resampler
                .process(&[chunk], None)
                .map_err(|e| AudioError::StreamError(e.to_string()))?;
            output.extend_from_slice(&resampled[0]);
            consumed += needed;
        }
        self.input.drain(..consumed);

        Ok(output)
    }

    /// Samples waiting for a full chunk
    pub fn pending(&self) -> usize {
        if self.resampler.is_some() {
            self.input.len()
        } else {
            0
        }
    }
}

/// Linear resampling into exactly `output_len` samples
///
/// Source positions advance by `from_rate / to_rate` per output sample; past
/// the end of the input the last sample is held.
pub fn resample(samples: &[f32], from_rate: u32, to_rate: u32, output_len: usize) -> Vec<f32> {
    if (from_rate == to_rate && samples.len() == output_len) || samples.is_empty() || to_rate == 0 {
        let mut output = samples.to_vec();
        output.resize(output_len, samples.last().copied().unwrap_or(0.0));
        return output;
    }

    let step = from_rate as f64 / to_rate as f64;
    let mut output = Vec::with_capacity(output_len);

    for i in 0..output_len {
        let src_idx = i as f64 * step;
        let idx_floor = src_idx.floor() as usize;
        let frac = (src_idx - idx_floor as f64) as f32;

        let sample = match (samples.get(idx_floor), samples.get(idx_floor + 1)) {
            (Some(&s1), Some(&s2)) => s1 + (s2 - s1) * frac,
            (Some(&s1), None) => s1,
            _ => samples[samples.len() - 1],
        };

        output.push(sample);
    }

    output
}
