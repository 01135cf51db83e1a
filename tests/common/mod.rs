//! In-memory devices and endpoint for driving the controller in tests

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use parking_lot::Mutex;
use tokio::sync::{mpsc, Notify};

use live_voice_session::audio::{AudioFrame, CaptureDevice, EndedHook, FrameStream, OutputDevice, VoiceId};
use live_voice_session::config::{AppConfig, TransportConfig};
use live_voice_session::error::{AudioError, Error, NetworkError};
use live_voice_session::network::{ChannelEvent, DuplexChannel, InboundStream, StreamingClient};
use live_voice_session::session::{SessionController, SessionObserver};
use live_voice_session::ConnectionState;

pub type TestController = SessionController<SharedClient, FakeCapture, FakeOutput>;

/// Microphone that records how it is held
#[derive(Default)]
pub struct FakeCapture {
    held: AtomicBool,
    pub acquisitions: AtomicUsize,
    pub releases: AtomicUsize,
    /// Times `acquire` was called while the device was already held
    pub double_holds: AtomicUsize,
    pub failure: Mutex<Option<AudioError>>,
    frames: Mutex<Option<mpsc::UnboundedSender<AudioFrame>>>,
}

impl FakeCapture {
    pub fn failing(error: AudioError) -> Self {
        let capture = Self::default();
        *capture.failure.lock() = Some(error);
        capture
    }

    pub fn is_held(&self) -> bool {
        self.held.load(Ordering::SeqCst)
    }

    pub fn push(&self, samples: Vec<f32>) -> bool {
        match self.frames.lock().as_ref() {
            Some(tx) => tx.send(AudioFrame::new(samples, 16_000)).is_ok(),
            None => false,
        }
    }

    /// Simulate the device disappearing mid-session
    pub fn lose(&self) {
        self.frames.lock().take();
    }
}

impl CaptureDevice for FakeCapture {
    fn acquire(&self, rate_hz: u32, _frame_size: usize) -> Result<FrameStream, AudioError> {
        if let Some(error) = self.failure.lock().clone() {
            return Err(error);
        }
        if self.held.swap(true, Ordering::SeqCst) {
            self.double_holds.fetch_add(1, Ordering::SeqCst);
            return Err(AudioError::DeviceBusy("fake".into()));
        }
        assert_eq!(rate_hz, 16_000);

        self.acquisitions.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = mpsc::unbounded_channel();
        *self.frames.lock() = Some(tx);
        Ok(rx)
    }

    fn release(&self) {
        self.frames.lock().take();
        if self.held.swap(false, Ordering::SeqCst) {
            self.releases.fetch_add(1, Ordering::SeqCst);
        }
    }
}

/// Speakers with a hand-driven clock
#[derive(Default)]
pub struct FakeOutput {
    clock: Mutex<f64>,
    pub scheduled: Mutex<Vec<(VoiceId, f64, f64)>>,
    pub stopped: Mutex<Vec<VoiceId>>,
    hooks: Mutex<HashMap<VoiceId, EndedHook>>,
    next_id: Mutex<VoiceId>,
}

impl FakeOutput {
    pub fn advance(&self, seconds: f64) {
        *self.clock.lock() += seconds;
    }
}

impl OutputDevice for FakeOutput {
    fn now(&self) -> f64 {
        *self.clock.lock()
    }

    fn schedule(
        &self,
        samples: Arc<[f32]>,
        sample_rate: u32,
        start_time: f64,
        on_ended: EndedHook,
    ) -> Result<VoiceId, AudioError> {
        let id = {
            let mut next = self.next_id.lock();
            *next += 1;
            *next
        };
        self.scheduled
            .lock()
            .push((id, start_time, samples.len() as f64 / sample_rate as f64));
        self.hooks.lock().insert(id, on_ended);
        Ok(id)
    }

    fn stop(&self, id: VoiceId) {
        self.stopped.lock().push(id);
        let hook = self.hooks.lock().remove(&id);
        if let Some(hook) = hook {
            hook();
        }
    }

    fn stop_all(&self) {
        let ids: Vec<VoiceId> = self.hooks.lock().keys().copied().collect();
        for id in ids {
            self.stop(id);
        }
    }
}

/// Endpoint double: acknowledges setup and lets the test play the server
#[derive(Default)]
pub struct FakeClient {
    pub opens: AtomicUsize,
    pub closes: Arc<AtomicUsize>,
    pub sent: Arc<Mutex<Vec<String>>>,
    pub reject: Mutex<Option<NetworkError>>,
    /// When set, `open` waits for a notification before answering
    pub gate: Mutex<Option<Arc<Notify>>>,
    server: Mutex<Option<mpsc::UnboundedSender<ChannelEvent>>>,
}

impl FakeClient {
    /// Deliver a server frame on the current channel
    pub fn server_send(&self, event: ChannelEvent) {
        if let Some(tx) = self.server.lock().as_ref() {
            let _ = tx.send(event);
        }
    }

    pub fn audio_messages_sent(&self) -> usize {
        self.sent.lock().iter().filter(|m| m.contains("realtimeInput")).count()
    }
}

pub struct FakeChannel {
    sent: Arc<Mutex<Vec<String>>>,
    closes: Arc<AtomicUsize>,
}

impl DuplexChannel for FakeChannel {
    fn send(&self, frame: String) -> Result<(), NetworkError> {
        self.sent.lock().push(frame);
        Ok(())
    }

    async fn close(self) {
        tokio::task::yield_now().await;
        self.closes.fetch_add(1, Ordering::SeqCst);
    }
}

impl StreamingClient for FakeClient {
    type Channel = FakeChannel;

    async fn open(&self, _config: &TransportConfig) -> Result<(FakeChannel, InboundStream), NetworkError> {
        self.opens.fetch_add(1, Ordering::SeqCst);

        let gate = self.gate.lock().clone();
        if let Some(gate) = gate {
            gate.notified().await;
        }

        if let Some(error) = self.reject.lock().clone() {
            return Err(error);
        }

        let (tx, rx) = mpsc::unbounded_channel();
        let _ = tx.send(ChannelEvent::Message(r#"{"setupComplete":{}}"#.into()));
        *self.server.lock() = Some(tx);

        Ok((
            FakeChannel {
                sent: self.sent.clone(),
                closes: self.closes.clone(),
            },
            rx,
        ))
    }
}

/// Lets the test keep a handle on the client the controller owns
pub struct SharedClient(pub Arc<FakeClient>);

impl StreamingClient for SharedClient {
    type Channel = FakeChannel;

    async fn open(&self, config: &TransportConfig) -> Result<(FakeChannel, InboundStream), NetworkError> {
        self.0.open(config).await
    }
}

/// Records every callback in order
#[derive(Default)]
pub struct RecordingObserver {
    pub events: Mutex<Vec<String>>,
    pub volumes: Mutex<Vec<f32>>,
}

impl RecordingObserver {
    pub fn events(&self) -> Vec<String> {
        self.events.lock().clone()
    }

    pub fn count(&self, name: &str) -> usize {
        self.events.lock().iter().filter(|e| e.starts_with(name)).count()
    }
}

impl SessionObserver for RecordingObserver {
    fn on_open(&self) {
        self.events.lock().push("open".into());
    }

    fn on_close(&self) {
        self.events.lock().push("close".into());
    }

    fn on_error(&self, error: &Error) {
        self.events.lock().push(format!("error: {}", error));
    }

    fn on_volume_change(&self, volume: f32) {
        self.volumes.lock().push(volume);
    }
}

pub struct Harness {
    pub controller: TestController,
    pub client: Arc<FakeClient>,
    pub capture: Arc<FakeCapture>,
    pub output: Arc<FakeOutput>,
    pub observer: Arc<RecordingObserver>,
}

/// Controller wired to fresh fakes; the client is shared through an `Arc`
pub fn harness_with(capture: FakeCapture) -> Harness {
    let client = Arc::new(FakeClient::default());
    let capture = Arc::new(capture);
    let output = Arc::new(FakeOutput::default());
    let observer = Arc::new(RecordingObserver::default());

    let mut config = AppConfig::default();
    config.transport.open_timeout_ms = 1_000;
    config.transport.close_timeout_ms = 500;

    let controller = SessionController::new(
        SharedClient(client.clone()),
        capture.clone(),
        output.clone(),
        &config,
        observer.clone(),
    );

    Harness {
        controller,
        client,
        capture,
        output,
        observer,
    }
}

pub fn harness() -> Harness {
    harness_with(FakeCapture::default())
}

/// Base64 PCM16 model-turn message with `samples` zero samples at 24 kHz
pub fn audio_message(samples: usize) -> ChannelEvent {
    let data = BASE64.encode(vec![0u8; samples * 2]);
    ChannelEvent::Message(format!(
        r#"{{"serverContent":{{"modelTurn":{{"parts":[{{"inlineData":{{"mimeType":"audio/pcm;rate=24000","data":"{}"}}}}]}}}}}}"#,
        data
    ))
}

pub fn interrupted_message() -> ChannelEvent {
    ChannelEvent::Message(r#"{"serverContent":{"interrupted":true}}"#.into())
}

/// Poll until `condition` holds, failing the test after two seconds
pub async fn wait_until(mut condition: impl FnMut() -> bool) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    while !condition() {
        assert!(tokio::time::Instant::now() < deadline, "condition not reached in time");
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

pub async fn wait_for_state(controller: &TestController, state: ConnectionState) {
    wait_until(|| controller.state() == state).await;
}
