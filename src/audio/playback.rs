//! Audio output on a virtual timeline
//!
//! [`OutputDevice`] exposes a playback clock in seconds and lets callers
//! place sample buffers at absolute start times on it. [`CpalOutput`]
//! implements it with a small mixer driven by the cpal output callback:
//! the clock advances by exactly the number of frames rendered.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use cpal::traits::{DeviceTrait, StreamTrait};
use cpal::{FromSample, Sample, SampleFormat, SizedSample, StreamConfig};
use crossbeam_channel::bounded;
use parking_lot::Mutex;

use crate::audio::buffer::resample;
use crate::audio::device::{map_build_error, output_device};
use crate::error::AudioError;

/// Identifier of a scheduled buffer
pub type VoiceId = u64;

/// Invoked once when a scheduled buffer finishes or is stopped
pub type EndedHook = Box<dyn FnOnce() + Send + 'static>;

/// Speakers with a monotonic playback clock
pub trait OutputDevice: Send + Sync + 'static {
    /// Current playback clock in seconds
    fn now(&self) -> f64;

    /// Place mono `samples` at `sample_rate` on the timeline starting at
    /// `start_time` seconds. `on_ended` runs once the buffer has played
    /// out or has been stopped.
    fn schedule(
        &self,
        samples: Arc<[f32]>,
        sample_rate: u32,
        start_time: f64,
        on_ended: EndedHook,
    ) -> Result<VoiceId, AudioError>;

    /// Halt one scheduled buffer immediately
    fn stop(&self, id: VoiceId);

    /// Halt everything scheduled
    fn stop_all(&self);
}

struct Voice {
    id: VoiceId,
    start_frame: u64,
    /// Mono samples at the device rate
    samples: Vec<f32>,
    on_ended: Option<EndedHook>,
}

impl Voice {
    fn end_frame(&self) -> u64 {
        self.start_frame + self.samples.len() as u64
    }

    fn finish(mut self) {
        if let Some(hook) = self.on_ended.take() {
            hook();
        }
    }
}

/// Mixer state shared with the device callback
#[derive(Default)]
struct Timeline {
    /// Frames rendered since the stream started
    rendered: u64,
    voices: Vec<Voice>,
}

impl Timeline {
    /// Mix the next `out.len()` frames (mono) and return voices that ended
    fn render(&mut self, out: &mut [f32]) -> Vec<Voice> {
        out.fill(0.0);
        let window_start = self.rendered;
        let window_end = window_start + out.len() as u64;

        for voice in &self.voices {
            let from = voice.start_frame.max(window_start);
            let to = voice.end_frame().min(window_end);
            for t in from..to {
                out[(t - window_start) as usize] += voice.samples[(t - voice.start_frame) as usize];
            }
        }

        self.rendered = window_end;

        let (ended, live): (Vec<Voice>, Vec<Voice>) = std::mem::take(&mut self.voices)
            .into_iter()
            .partition(|v| v.end_frame() <= window_end);
        self.voices = live;
        ended
    }
}

struct OutputThread {
    running: Arc<AtomicBool>,
    handle: JoinHandle<()>,
}

/// cpal-backed speakers
///
/// The stream lives on a dedicated thread for as long as this value does.
pub struct CpalOutput {
    timeline: Arc<Mutex<Timeline>>,
    device_rate: u32,
    next_id: AtomicU64,
    thread: Mutex<Option<OutputThread>>,
}

impl CpalOutput {
    /// Open the named output device, or the default one
    pub fn open(device_name: Option<String>) -> Result<Self, AudioError> {
        let timeline = Arc::new(Mutex::new(Timeline::default()));
        let running = Arc::new(AtomicBool::new(true));
        let (ready_tx, ready_rx) = bounded::<Result<u32, AudioError>>(1);

        let timeline_for_stream = timeline.clone();
        let running_for_loop = running.clone();

        let handle = thread::Builder::new()
            .name("playback".into())
            .spawn(move || {
                let opened = open_output_stream(device_name.as_deref(), timeline_for_stream);
                let (stream, rate) = match opened {
                    Ok(opened) => opened,
                    Err(e) => {
                        let _ = ready_tx.send(Err(e));
                        return;
                    }
                };

                if let Err(e) = stream.play() {
                    let _ = ready_tx.send(Err(AudioError::StreamError(e.to_string())));
                    return;
                }
                let _ = ready_tx.send(Ok(rate));

                while running_for_loop.load(Ordering::Relaxed) {
                    thread::sleep(Duration::from_millis(10));
                }
            })
            .map_err(|e| AudioError::StreamError(e.to_string()))?;

        let ready = ready_rx
            .recv_timeout(Duration::from_secs(5))
            .unwrap_or_else(|_| Err(AudioError::StreamError("playback thread did not start".into())));

        match ready {
            Ok(device_rate) => Ok(Self {
                timeline,
                device_rate,
                next_id: AtomicU64::new(1),
                thread: Mutex::new(Some(OutputThread { running, handle })),
            }),
            Err(e) => {
                running.store(false, Ordering::SeqCst);
                let _ = handle.join();
                Err(e)
            }
        }
    }

    pub fn device_rate(&self) -> u32 {
        self.device_rate
    }

    fn close(&self) {
        if let Some(thread) = self.thread.lock().take() {
            thread.running.store(false, Ordering::SeqCst);
            let _ = thread.handle.join();
        }
        self.stop_all();
    }
}

impl OutputDevice for CpalOutput {
    fn now(&self) -> f64 {
        self.timeline.lock().rendered as f64 / self.device_rate as f64
    }

    fn schedule(
        &self,
        samples: Arc<[f32]>,
        sample_rate: u32,
        start_time: f64,
        on_ended: EndedHook,
    ) -> Result<VoiceId, AudioError> {
        if sample_rate == 0 {
            return Err(AudioError::UnsupportedFormat("zero sample rate".into()));
        }

        // Resample outside the lock; the callback contends for it
        let (requested, len) = frame_span(start_time, samples.len(), sample_rate, self.device_rate);
        let samples = resample(&samples, sample_rate, self.device_rate, len);
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);

        let mut timeline = self.timeline.lock();
        let voice = Voice {
            id,
            start_frame: requested.max(timeline.rendered),
            samples,
            on_ended: Some(on_ended),
        };
        timeline.voices.push(voice);
        Ok(id)
    }

    fn stop(&self, id: VoiceId) {
        let stopped = {
            let mut timeline = self.timeline.lock();
            timeline
                .voices
                .iter()
                .position(|v| v.id == id)
                .map(|pos| timeline.voices.swap_remove(pos))
        };
        if let Some(voice) = stopped {
            voice.finish();
        }
    }

    fn stop_all(&self) {
        let stopped = std::mem::take(&mut self.timeline.lock().voices);
        for voice in stopped {
            voice.finish();
        }
    }
}

impl Drop for CpalOutput {
    fn drop(&mut self) {
        self.close();
    }
}

fn open_output_stream(
    device_name: Option<&str>,
    timeline: Arc<Mutex<Timeline>>,
) -> Result<(cpal::Stream, u32), AudioError> {
    let device = output_device(device_name)?;
    let supported = device
        .default_output_config()
        .map_err(|e| AudioError::DeviceNotFound(e.to_string()))?;

    tracing::info!(
        "Using output device: {} ({} Hz, {} ch, {:?})",
        device.name().unwrap_or_default(),
        supported.sample_rate().0,
        supported.channels(),
        supported.sample_format()
    );

    let format = supported.sample_format();
    let config: StreamConfig = supported.into();
    let rate = config.sample_rate.0;

    let stream = match format {
        SampleFormat::F32 => build_output::<f32>(&device, &config, timeline),
        SampleFormat::I16 => build_output::<i16>(&device, &config, timeline),
        SampleFormat::U16 => build_output::<u16>(&device, &config, timeline),
        other => Err(AudioError::UnsupportedFormat(format!("{:?}", other))),
    }?;

    Ok((stream, rate))
}

fn build_output<T>(
    device: &cpal::Device,
    config: &StreamConfig,
    timeline: Arc<Mutex<Timeline>>,
) -> Result<cpal::Stream, AudioError>
where
    T: SizedSample + FromSample<f32>,
{
    let channels = config.channels as usize;
    let mut mono: Vec<f32> = Vec::new();

    device
        .build_output_stream(
            config,
            move |data: &mut [T], _: &cpal::OutputCallbackInfo| {
                let frames = data.len() / channels;
                mono.resize(frames, 0.0);

                let ended = timeline.lock().render(&mut mono);

                for (frame, &value) in data.chunks_mut(channels).zip(mono.iter()) {
                    let sample = T::from_sample(value.clamp(-1.0, 1.0));
                    frame.fill(sample);
                }

                // Hooks run after the mixer lock is released
                for voice in ended {
                    voice.finish();
                }
            },
            |err| {
                tracing::error!("Audio output error: {}", err);
            },
            None,
        )
        .map_err(map_build_error)
}

/// Device frames covered by a buffer placed at `start_time`
///
/// Both ends are rounded from absolute times, so a buffer starting where
/// the previous one ended begins on the frame right after it.
fn frame_span(start_time: f64, len: usize, sample_rate: u32, device_rate: u32) -> (u64, usize) {
    let start_time = start_time.max(0.0);
    let end_time = start_time + len as f64 / sample_rate as f64;
    let start = (start_time * device_rate as f64).round() as u64;
    let end = (end_time * device_rate as f64).round() as u64;
    (start, end.saturating_sub(start) as usize)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn voice(id: VoiceId, start_frame: u64, samples: Vec<f32>, ended: Arc<AtomicUsize>) -> Voice {
        Voice {
            id,
            start_frame,
            samples,
            on_ended: Some(Box::new(move || {
                ended.fetch_add(1, Ordering::SeqCst);
            })),
        }
    }

    #[test]
    fn test_timeline_places_voices_at_start_frame() {
        let ended = Arc::new(AtomicUsize::new(0));
        let mut timeline = Timeline::default();
        timeline.voices.push(voice(1, 2, vec![0.5; 3], ended.clone()));
        timeline.voices.push(voice(2, 5, vec![0.25; 2], ended.clone()));

        let mut out = vec![0.0; 4];
        let finished = timeline.render(&mut out);
        assert!(finished.is_empty());
        assert_eq!(out, vec![0.0, 0.0, 0.5, 0.5]);

        let finished = timeline.render(&mut out);
        assert_eq!(out, vec![0.5, 0.25, 0.25, 0.0]);
        assert_eq!(finished.len(), 2);
        assert_eq!(timeline.rendered, 8);

        for v in finished {
            v.finish();
        }
        assert_eq!(ended.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_overlapping_voices_mix() {
        let ended = Arc::new(AtomicUsize::new(0));
        let mut timeline = Timeline::default();
        timeline.voices.push(voice(1, 0, vec![0.25; 2], ended.clone()));
        timeline.voices.push(voice(2, 1, vec![0.25; 2], ended));

        let mut out = vec![0.0; 3];
        timeline.render(&mut out);
        assert_eq!(out, vec![0.25, 0.5, 0.25]);
    }

    #[test]
    fn test_back_to_back_buffers_leave_no_gap_at_device_rate() {
        // 24 kHz reply chunks played on a 44.1 kHz device
        let lengths = [2400usize, 4801, 1234, 7, 24_000, 333, 959];
        let ended = Arc::new(AtomicUsize::new(0));
        let mut timeline = Timeline::default();

        let mut start_time = 0.0;
        let mut expected_start = 0u64;
        for (id, &len) in lengths.iter().enumerate() {
            let (start, device_len) = frame_span(start_time, len, 24_000, 44_100);
            assert_eq!(start, expected_start, "buffer {}", id);

            let samples = resample(&vec![1.0; len], 24_000, 44_100, device_len);
            assert_eq!(samples.len(), device_len);
            timeline.voices.push(voice(id as VoiceId, start, samples, ended.clone()));

            expected_start = start + device_len as u64;
            start_time += len as f64 / 24_000.0;
        }

        let total = expected_start as usize;
        let mut out = vec![0.0; total];
        let finished = timeline.render(&mut out);

        // A gap renders 0.0 and an overlap 2.0
        assert!(out.iter().all(|&s| s == 1.0));
        assert_eq!(finished.len(), lengths.len());
    }

    #[test]
    fn test_frame_span_clamps_negative_start() {
        assert_eq!(frame_span(-0.5, 24_000, 24_000, 48_000), (0, 48_000));
    }
}
