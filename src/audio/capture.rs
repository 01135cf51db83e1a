//! Audio capture from the microphone
//!
//! [`CaptureDevice`] is the seam to the hardware: it hands out a stream of
//! fixed-size mono frames and releases the device on request.
//! [`AudioCaptureSource`] wraps one device for the lifetime of one session
//! and cannot be restarted once stopped.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use cpal::traits::{DeviceTrait, StreamTrait};
use cpal::{FromSample, Sample, SampleFormat, SizedSample, StreamConfig};
use crossbeam_channel::bounded;
use parking_lot::Mutex;
use tokio::sync::mpsc;

use crate::audio::buffer::{downmix_to_mono, AudioFrame, FrameAssembler, StreamResampler};
use crate::audio::device::{input_device, map_build_error};
use crate::error::AudioError;

/// Ordered stream of captured frames; ends when the device is released or lost
pub type FrameStream = mpsc::UnboundedReceiver<AudioFrame>;

/// How long `acquire` waits for the device thread to report readiness
const ACQUIRE_TIMEOUT: Duration = Duration::from_secs(5);

/// A microphone that can be held by at most one session at a time
pub trait CaptureDevice: Send + Sync + 'static {
    /// Acquire the device and start producing frames of `frame_size`
    /// samples at `rate_hz`. Fails before any frame is produced.
    fn acquire(&self, rate_hz: u32, frame_size: usize) -> Result<FrameStream, AudioError>;

    /// Release the device. A no-op when nothing is held.
    fn release(&self);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SourceState {
    Idle,
    Running,
    Stopped,
}

/// Single-use capture source owned by one session
pub struct AudioCaptureSource<D: CaptureDevice> {
    device: Arc<D>,
    frame_size: usize,
    state: SourceState,
}

impl<D: CaptureDevice> AudioCaptureSource<D> {
    pub fn new(device: Arc<D>, frame_size: usize) -> Self {
        Self {
            device,
            frame_size,
            state: SourceState::Idle,
        }
    }

    /// Start capturing at `rate_hz`
    pub fn start(&mut self, rate_hz: u32) -> Result<FrameStream, AudioError> {
        if self.state != SourceState::Idle {
            return Err(AudioError::AlreadyStarted);
        }

        match self.device.acquire(rate_hz, self.frame_size) {
            Ok(frames) => {
                self.state = SourceState::Running;
                tracing::debug!("Capture started at {} Hz, {} samples/frame", rate_hz, self.frame_size);
                Ok(frames)
            }
            Err(e) => {
                // Never restartable, even after a failed start
                self.state = SourceState::Stopped;
                Err(e)
            }
        }
    }

    /// Release the device
    pub fn stop(&mut self) {
        if self.state == SourceState::Running {
            self.device.release();
            tracing::debug!("Capture stopped");
        }
        self.state = SourceState::Stopped;
    }

    pub fn is_running(&self) -> bool {
        self.state == SourceState::Running
    }
}

impl<D: CaptureDevice> Drop for AudioCaptureSource<D> {
    fn drop(&mut self) {
        self.stop();
    }
}

struct CaptureThread {
    running: Arc<AtomicBool>,
    handle: JoinHandle<()>,
}

/// cpal-backed microphone
///
/// The cpal stream lives on a dedicated thread; captured blocks are
/// downmixed, resampled to the session rate and cut into frames inside
/// the device callback.
pub struct CpalCapture {
    device_name: Option<String>,
    active: Mutex<Option<CaptureThread>>,
}

impl CpalCapture {
    /// Capture from the named input device, or the default one
    pub fn new(device_name: Option<String>) -> Self {
        Self {
            device_name,
            active: Mutex::new(None),
        }
    }
}

impl CaptureDevice for CpalCapture {
    fn acquire(&self, rate_hz: u32, frame_size: usize) -> Result<FrameStream, AudioError> {
        let mut active = self.active.lock();
        if active.is_some() {
            return Err(AudioError::DeviceBusy(
                self.device_name.clone().unwrap_or_else(|| "default input".into()),
            ));
        }

        let (frame_tx, frame_rx) = mpsc::unbounded_channel();
        let (ready_tx, ready_rx) = bounded::<Result<(), AudioError>>(1);
        let running = Arc::new(AtomicBool::new(true));
        let running_for_loop = running.clone();
        let device_name = self.device_name.clone();

        let handle = thread::Builder::new()
            .name("capture-mic".into())
            .spawn(move || {
                let stream = open_input_stream(
                    device_name.as_deref(),
                    rate_hz,
                    frame_size,
                    frame_tx,
                    running_for_loop.clone(),
                );

                let stream = match stream {
                    Ok(stream) => stream,
                    Err(e) => {
                        let _ = ready_tx.send(Err(e));
                        return;
                    }
                };

                if let Err(e) = stream.play() {
                    let _ = ready_tx.send(Err(AudioError::StreamError(e.to_string())));
                    return;
                }
                let _ = ready_tx.send(Ok(()));

                // Keep thread alive while running
                while running_for_loop.load(Ordering::Relaxed) {
                    thread::sleep(Duration::from_millis(10));
                }

                // Stream is dropped here, closing the frame channel
            })
            .map_err(|e| AudioError::StreamError(e.to_string()))?;

        let ready = ready_rx
            .recv_timeout(ACQUIRE_TIMEOUT)
            .unwrap_or_else(|_| Err(AudioError::StreamError("capture thread did not start".into())));

        match ready {
            Ok(()) => {
                *active = Some(CaptureThread { running, handle });
                Ok(frame_rx)
            }
            Err(e) => {
                running.store(false, Ordering::SeqCst);
                let _ = handle.join();
                Err(e)
            }
        }
    }

    fn release(&self) {
        let thread = self.active.lock().take();
        if let Some(thread) = thread {
            thread.running.store(false, Ordering::SeqCst);
            let _ = thread.handle.join();
        }
    }
}

impl Drop for CpalCapture {
    fn drop(&mut self) {
        self.release();
    }
}

fn open_input_stream(
    device_name: Option<&str>,
    rate_hz: u32,
    frame_size: usize,
    frame_tx: mpsc::UnboundedSender<AudioFrame>,
    running: Arc<AtomicBool>,
) -> Result<cpal::Stream, AudioError> {
    let device = input_device(device_name)?;
    let supported = device
        .default_input_config()
        .map_err(|e| AudioError::DeviceNotFound(e.to_string()))?;

    tracing::info!(
        "Using input device: {} ({} Hz, {} ch, {:?})",
        device.name().unwrap_or_default(),
        supported.sample_rate().0,
        supported.channels(),
        supported.sample_format()
    );

    let format = supported.sample_format();
    let config: StreamConfig = supported.into();

    match format {
        SampleFormat::F32 => build_input::<f32>(&device, &config, rate_hz, frame_size, frame_tx, running),
        SampleFormat::I16 => build_input::<i16>(&device, &config, rate_hz, frame_size, frame_tx, running),
        SampleFormat::U16 => build_input::<u16>(&device, &config, rate_hz, frame_size, frame_tx, running),
        other => Err(AudioError::UnsupportedFormat(format!("{:?}", other))),
    }
}

fn build_input<T>(
    device: &cpal::Device,
    config: &StreamConfig,
    rate_hz: u32,
    frame_size: usize,
    frame_tx: mpsc::UnboundedSender<AudioFrame>,
    running: Arc<AtomicBool>,
) -> Result<cpal::Stream, AudioError>
where
    T: SizedSample,
    f32: FromSample<T>,
{
    let channels = config.channels;
    let device_rate = config.sample_rate.0;
    let mut resampler = StreamResampler::new(device_rate, rate_hz)?;
    let mut assembler = FrameAssembler::new(frame_size, rate_hz);
    let running_for_errors = running.clone();

    device
        .build_input_stream(
            config,
            move |data: &[T], _: &cpal::InputCallbackInfo| {
                if !running.load(Ordering::Relaxed) {
                    return;
                }
                let samples: Vec<f32> = data.iter().map(|s| s.to_sample::<f32>()).collect();
                let mono = downmix_to_mono(&samples, channels);
                let resampled = match resampler.process(&mono) {
                    Ok(resampled) => resampled,
                    Err(e) => {
                        tracing::warn!("Dropping capture block: {}", e);
                        return;
                    }
                };

                // Never block the device callback
                assembler.push(&resampled, |frame| {
                    let _ = frame_tx.send(frame);
                });
            },
            move |err| {
                tracing::error!("Capture stream error: {}", err);
                if matches!(err, cpal::StreamError::DeviceNotAvailable) {
                    running_for_errors.store(false, Ordering::SeqCst);
                }
            },
            None,
        )
        .map_err(map_build_error)
}
