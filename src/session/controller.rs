//! Session controller
//!
//! Single owner of the active session. All state changes go through
//! [`Inner::set_state`]; the session handle is swapped out of the slot
//! under a lock before anything is awaited on it, so overlapping
//! disconnects and remote failures release each resource exactly once.
//!
//! Lock order: `lifecycle` (connects only), then `teardown`, then
//! `machine`. `machine` is never held across an await.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use tokio::sync::{mpsc, watch};
use tracing::Instrument;

use crate::audio::capture::{AudioCaptureSource, CaptureDevice};
use crate::audio::playback::OutputDevice;
use crate::config::{AppConfig, SessionConfig, TransportConfig};
use crate::error::{AudioError, Error, Result, SessionError};
use crate::network::channel::StreamingClient;
use crate::network::transport::LiveTransportSession;
use crate::session::pipeline::{ActiveSession, PipelineParts, SessionEnd};
use crate::session::{ConnectionState, SessionInfo, SessionObserver};

enum Slot<D: CaptureDevice, C: StreamingClient> {
    Idle,
    Connecting { generation: u64 },
    Active(ActiveSession<D, C::Channel>),
}

impl<D: CaptureDevice, C: StreamingClient> Slot<D, C> {
    fn is_connecting(&self, generation: u64) -> bool {
        matches!(self, Slot::Connecting { generation: g } if *g == generation)
    }
}

/// Returns a connect attempt to idle if its future is dropped before it settles
struct ConnectGuard<'a, C: StreamingClient, D: CaptureDevice, O: OutputDevice> {
    inner: &'a Inner<C, D, O>,
    generation: u64,
}

impl<C: StreamingClient, D: CaptureDevice, O: OutputDevice> Drop for ConnectGuard<'_, C, D, O> {
    fn drop(&mut self) {
        let abandoned = {
            let mut slot = self.inner.machine.lock();
            if slot.is_connecting(self.generation) {
                *slot = Slot::Idle;
                self.inner.set_state(ConnectionState::Disconnected);
                true
            } else {
                false
            }
        };

        if abandoned {
            tracing::info!("Connect abandoned (attempt {})", self.generation);
            self.inner.observer.on_close();
        }
    }
}

struct Inner<C: StreamingClient, D: CaptureDevice, O: OutputDevice> {
    client: C,
    capture_device: Arc<D>,
    output: Arc<O>,
    transport: TransportConfig,
    frame_size: usize,
    observer: Arc<dyn SessionObserver>,
    state_tx: watch::Sender<ConnectionState>,
    machine: Mutex<Slot<D, C>>,
    lifecycle: tokio::sync::Mutex<()>,
    teardown: tokio::sync::Mutex<()>,
    last_config: Mutex<Option<SessionConfig>>,
    generation: AtomicU64,
}

/// Orchestrates capture, transport and playback for one session at a time
pub struct SessionController<C: StreamingClient, D: CaptureDevice, O: OutputDevice> {
    inner: Arc<Inner<C, D, O>>,
}

impl<C, D, O> SessionController<C, D, O>
where
    C: StreamingClient,
    D: CaptureDevice,
    O: OutputDevice,
{
    pub fn new(
        client: C,
        capture_device: Arc<D>,
        output: Arc<O>,
        config: &AppConfig,
        observer: Arc<dyn SessionObserver>,
    ) -> Self {
        let (state_tx, _) = watch::channel(ConnectionState::Disconnected);

        Self {
            inner: Arc::new(Inner {
                client,
                capture_device,
                output,
                transport: config.transport.clone(),
                frame_size: config.audio.frame_size,
                observer,
                state_tx,
                machine: Mutex::new(Slot::Idle),
                lifecycle: tokio::sync::Mutex::new(()),
                teardown: tokio::sync::Mutex::new(()),
                last_config: Mutex::new(None),
                generation: AtomicU64::new(0),
            }),
        }
    }

    /// Start a session, tearing down any active one first
    ///
    /// Resolves once the session is CONNECTED, or with the error that put
    /// the controller into ERROR. A connect overtaken by [`disconnect`]
    /// resolves with [`SessionError::Cancelled`].
    ///
    /// [`disconnect`]: SessionController::disconnect
    pub async fn connect(&self, config: SessionConfig) -> Result<()> {
        let _lifecycle = self.inner.lifecycle.lock().await;
        *self.inner.last_config.lock() = Some(config.clone());
        self.inner.connect(config).await
    }

    /// End the active session, if any. Idempotent and safe to call
    /// concurrently with anything else.
    pub async fn disconnect(&self) {
        self.inner.disconnect().await;
    }

    /// Connect again with the most recent session config
    pub async fn retry(&self) -> Result<()> {
        let config = self
            .inner
            .last_config
            .lock()
            .clone()
            .ok_or(SessionError::NothingToRetry)?;
        self.connect(config).await
    }

    pub fn state(&self) -> ConnectionState {
        *self.inner.state_tx.borrow()
    }

    /// Watch state transitions
    pub fn subscribe(&self) -> watch::Receiver<ConnectionState> {
        self.inner.state_tx.subscribe()
    }

    /// Identity of the connected session
    pub fn session_info(&self) -> Option<SessionInfo> {
        match &*self.inner.machine.lock() {
            Slot::Active(session) => Some(session.info.clone()),
            _ => None,
        }
    }
}

impl<C, D, O> Inner<C, D, O>
where
    C: StreamingClient,
    D: CaptureDevice,
    O: OutputDevice,
{
    fn set_state(&self, state: ConnectionState) {
        let previous = self.state_tx.send_replace(state);
        if previous != state {
            tracing::info!("State {} -> {}", previous, state);
        }
    }

    async fn connect(self: &Arc<Self>, config: SessionConfig) -> Result<()> {
        // The previous session must have released the device before we
        // try to acquire it
        self.disconnect().await;

        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        {
            let mut slot = self.machine.lock();
            *slot = Slot::Connecting { generation };
            self.set_state(ConnectionState::Connecting);
        }

        let _abandoned = ConnectGuard { inner: &**self, generation };

        let info = SessionInfo::new(config);
        let span = tracing::info_span!("session", id = %info.id);
        self.establish(info, generation).instrument(span).await
    }

    async fn establish(self: &Arc<Self>, info: SessionInfo, generation: u64) -> Result<()> {
        tracing::info!(
            "Connecting (voice {}, {} Hz up, {} Hz down)",
            info.config.voice_id,
            info.config.uplink_rate_hz,
            info.config.downlink_rate_hz
        );

        // Device acquisition may block on the audio backend
        let mut capture = AudioCaptureSource::new(self.capture_device.clone(), self.frame_size);
        let rate_hz = info.config.uplink_rate_hz;
        let started = tokio::task::spawn_blocking(move || {
            let frames = capture.start(rate_hz);
            (capture, frames)
        })
        .await;

        let (mut capture, frames) = match started {
            Ok((capture, Ok(frames))) => (capture, frames),
            Ok((_, Err(e))) => return self.fail_connect(generation, e.into()),
            Err(e) => return self.fail_connect(generation, AudioError::StreamError(e.to_string()).into()),
        };

        if !self.machine.lock().is_connecting(generation) {
            capture.stop();
            tracing::info!("Connect cancelled before the channel was opened");
            return Err(SessionError::Cancelled.into());
        }

        let (transport, inbound) =
            match LiveTransportSession::open(&self.client, &self.transport, &info.config).await {
                Ok(opened) => opened,
                Err(e) => {
                    capture.stop();
                    return self.fail_connect(generation, e.into());
                }
            };

        // Install under the teardown lock so a racing disconnect sees either
        // nothing or the complete session
        let _teardown = self.teardown.lock().await;

        let parts = PipelineParts {
            info,
            generation,
            capture,
            frames,
            transport,
            inbound,
            output: self.output.clone(),
            observer: self.observer.clone(),
        };

        let rejected = {
            let mut slot = self.machine.lock();
            if slot.is_connecting(generation) {
                let (ends_tx, ends_rx) = mpsc::unbounded_channel();
                *slot = Slot::Active(ActiveSession::start(parts, ends_tx));
                self.set_state(ConnectionState::Connected);
                tokio::spawn(watch_session(Arc::downgrade(self), generation, ends_rx).in_current_span());
                None
            } else {
                Some(parts)
            }
        };

        match rejected {
            None => {
                tracing::info!("Session open");
                self.observer.on_open();
                Ok(())
            }
            Some(mut parts) => {
                parts.transport.close().await;
                parts.capture.stop();
                tracing::info!("Connect cancelled after the channel was opened");
                Err(SessionError::Cancelled.into())
            }
        }
    }

    /// Report a failed connect, unless a disconnect already claimed it
    fn fail_connect(&self, generation: u64, error: Error) -> Result<()> {
        let owned = {
            let mut slot = self.machine.lock();
            if slot.is_connecting(generation) {
                *slot = Slot::Idle;
                self.set_state(ConnectionState::Error);
                true
            } else {
                false
            }
        };

        if !owned {
            tracing::info!("Connect cancelled ({})", error);
            return Err(SessionError::Cancelled.into());
        }

        tracing::error!("Connect failed: {}", error);
        self.observer.on_error(&error);
        Err(error)
    }

    async fn disconnect(&self) {
        let _teardown = self.teardown.lock().await;

        let taken = std::mem::replace(&mut *self.machine.lock(), Slot::Idle);
        match taken {
            Slot::Idle => {}
            Slot::Connecting { generation } => {
                // The connect in flight releases what it acquired when it settles
                tracing::info!("Disconnect during connect (attempt {})", generation);
                self.set_state(ConnectionState::Disconnected);
                self.observer.on_close();
            }
            Slot::Active(session) => {
                let id = session.info.id;
                session.shutdown().await;
                self.set_state(ConnectionState::Disconnected);
                tracing::info!(session = %id, "Disconnected");
                self.observer.on_close();
            }
        }
    }

    /// The pipeline stopped on its own: remote close, channel failure or
    /// capture loss
    async fn session_ended(&self, generation: u64, end: SessionEnd) {
        let _teardown = self.teardown.lock().await;

        let session = {
            let mut slot = self.machine.lock();
            let current = matches!(&*slot, Slot::Active(session) if session.generation == generation);
            match current {
                true => match std::mem::replace(&mut *slot, Slot::Idle) {
                    Slot::Active(session) => Some(session),
                    _ => None,
                },
                false => None,
            }
        };

        // Already torn down by a disconnect or a newer connect
        let Some(session) = session else {
            return;
        };
        session.shutdown().await;

        match end {
            SessionEnd::RemoteClosed => {
                self.set_state(ConnectionState::Disconnected);
                self.observer.on_close();
            }
            SessionEnd::Failed(error) => {
                tracing::error!("Session failed: {}", error);
                self.set_state(ConnectionState::Error);
                self.observer.on_error(&error);
            }
        }
    }
}

impl<C: StreamingClient, D: CaptureDevice, O: OutputDevice> Drop for Inner<C, D, O> {
    fn drop(&mut self) {
        let taken = std::mem::replace(self.machine.get_mut(), Slot::Idle);
        if let Slot::Active(session) = taken {
            tracing::debug!("Controller dropped with an active session");
            session.abort();
        }
    }
}

async fn watch_session<C, D, O>(
    inner: Weak<Inner<C, D, O>>,
    generation: u64,
    mut ends: mpsc::UnboundedReceiver<SessionEnd>,
) where
    C: StreamingClient,
    D: CaptureDevice,
    O: OutputDevice,
{
    // Closes without a message once both pipeline tasks stopped on request
    let Some(end) = ends.recv().await else {
        return;
    };
    if let Some(inner) = inner.upgrade() {
        inner.session_ended(generation, end).await;
    }
}
