//! Live transport session
//!
//! Owns the duplex channel for one conversation. The outbound side is a
//! fire-and-forget [`ChunkSender`] used from the capture path; the inbound
//! side is drained by a [`Downlink`] that decodes audio onto the playback
//! timeline and flushes it on interruption.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::watch;

use crate::audio::playback::OutputDevice;
use crate::audio::scheduler::PlaybackScheduler;
use crate::codec::{DownlinkDecoder, EncodedChunk};
use crate::config::{SessionConfig, TransportConfig};
use crate::error::NetworkError;
use crate::network::channel::{ChannelEvent, DuplexChannel, InboundStream, StreamingClient};
use crate::protocol::{ClientMessage, InboundEvent, ServerMessage};

struct Shared<Ch> {
    channel: Mutex<Option<Ch>>,
    closing: AtomicBool,
    chunks_sent: AtomicU64,
    chunks_dropped: AtomicU64,
}

/// One open conversation channel
pub struct LiveTransportSession<Ch: DuplexChannel> {
    shared: Arc<Shared<Ch>>,
    close_timeout: Duration,
}

impl<Ch: DuplexChannel> LiveTransportSession<Ch> {
    /// Open a channel, send the setup message and wait for the server to
    /// acknowledge it. Bounded by the configured open timeout.
    pub async fn open<C>(
        client: &C,
        transport: &TransportConfig,
        session: &SessionConfig,
    ) -> Result<(Self, InboundStream), NetworkError>
    where
        C: StreamingClient<Channel = Ch>,
    {
        // A timed-out handshake drops the channel, which releases it
        let (channel, inbound) =
            tokio::time::timeout(transport.open_timeout(), handshake(client, transport, session))
                .await
                .map_err(|_| NetworkError::Timeout)??;

        tracing::info!("Live channel open (voice {})", session.voice_id);

        Ok((
            Self {
                shared: Arc::new(Shared {
                    channel: Mutex::new(Some(channel)),
                    closing: AtomicBool::new(false),
                    chunks_sent: AtomicU64::new(0),
                    chunks_dropped: AtomicU64::new(0),
                }),
                close_timeout: transport.close_timeout(),
            },
            inbound,
        ))
    }

    /// Cheap handle for the capture path
    pub fn sender(&self) -> ChunkSender<Ch> {
        ChunkSender {
            shared: self.shared.clone(),
        }
    }

    /// Release the channel. Later and concurrent calls are no-ops.
    pub async fn close(&self) {
        self.shared.closing.store(true, Ordering::SeqCst);

        // Swap the handle out before awaiting anything
        let channel = self.shared.channel.lock().take();
        let Some(channel) = channel else {
            return;
        };

        if tokio::time::timeout(self.close_timeout, channel.close()).await.is_err() {
            tracing::warn!("Channel close timed out after {:?}", self.close_timeout);
        }

        tracing::info!(
            "Live channel closed ({} chunks sent, {} dropped)",
            self.shared.chunks_sent.load(Ordering::Relaxed),
            self.shared.chunks_dropped.load(Ordering::Relaxed)
        );
    }

    pub fn is_closed(&self) -> bool {
        self.shared.closing.load(Ordering::SeqCst)
    }

    pub fn stats(&self) -> TransportStats {
        TransportStats {
            chunks_sent: self.shared.chunks_sent.load(Ordering::Relaxed),
            chunks_dropped: self.shared.chunks_dropped.load(Ordering::Relaxed),
        }
    }
}

/// Transport statistics
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransportStats {
    pub chunks_sent: u64,
    pub chunks_dropped: u64,
}

async fn handshake<C: StreamingClient>(
    client: &C,
    transport: &TransportConfig,
    session: &SessionConfig,
) -> Result<(C::Channel, InboundStream), NetworkError> {
    let (channel, mut inbound) = client.open(transport).await?;

    let setup = ClientMessage::setup(&transport.model, session).to_json()?;
    if let Err(e) = channel.send(setup) {
        channel.close().await;
        return Err(e);
    }

    match await_setup_complete(&mut inbound).await {
        Ok(()) => Ok((channel, inbound)),
        Err(e) => {
            channel.close().await;
            Err(e)
        }
    }
}

async fn await_setup_complete(inbound: &mut InboundStream) -> Result<(), NetworkError> {
    while let Some(event) = inbound.recv().await {
        match event {
            ChannelEvent::Message(text) => {
                let message = ServerMessage::parse(&text)?;
                for event in message.into_events() {
                    match event {
                        InboundEvent::SetupComplete => return Ok(()),
                        InboundEvent::Error(reason) => return Err(NetworkError::Server(reason)),
                        other => tracing::debug!("Ignoring {:?} before setup completed", other),
                    }
                }
            }
            ChannelEvent::Closed { code, reason } => {
                return Err(NetworkError::Closed(match code {
                    Some(code) => format!("{} ({})", reason, code),
                    None => reason,
                }));
            }
            ChannelEvent::Failed(reason) => return Err(NetworkError::ConnectionFailed(reason)),
        }
    }
    Err(NetworkError::Closed("channel ended during setup".into()))
}

/// Fire-and-forget sender for the capture path
pub struct ChunkSender<Ch> {
    shared: Arc<Shared<Ch>>,
}

impl<Ch> Clone for ChunkSender<Ch> {
    fn clone(&self) -> Self {
        Self {
            shared: self.shared.clone(),
        }
    }
}

impl<Ch: DuplexChannel> ChunkSender<Ch> {
    /// Queue one chunk. Returns false when the chunk was dropped because the
    /// channel is closing or gone. Never waits.
    pub fn send(&self, chunk: &EncodedChunk) -> bool {
        if self.shared.closing.load(Ordering::Acquire) {
            self.shared.chunks_dropped.fetch_add(1, Ordering::Relaxed);
            return false;
        }

        let frame = match ClientMessage::audio(chunk).to_json() {
            Ok(frame) => frame,
            Err(e) => {
                tracing::warn!("Failed to serialize audio chunk: {}", e);
                self.shared.chunks_dropped.fetch_add(1, Ordering::Relaxed);
                return false;
            }
        };

        let sent = match self.shared.channel.lock().as_ref() {
            Some(channel) => channel.send(frame).is_ok(),
            None => false,
        };

        if sent {
            self.shared.chunks_sent.fetch_add(1, Ordering::Relaxed);
        } else {
            self.shared.chunks_dropped.fetch_add(1, Ordering::Relaxed);
        }
        sent
    }
}

/// Why the downlink stopped
#[derive(Debug, Clone, PartialEq)]
pub enum DownlinkEnd {
    /// Local stop signal
    Stopped,
    /// Remote closed normally
    RemoteClosed,
    /// Remote closed abnormally, broke, or reported an error
    Failed(NetworkError),
}

/// Inbound half: decode audio, schedule it, flush on barge-in
pub struct Downlink<O: OutputDevice> {
    decoder: DownlinkDecoder,
    scheduler: PlaybackScheduler<O>,
}

impl<O: OutputDevice> Downlink<O> {
    pub fn new(decoder: DownlinkDecoder, scheduler: PlaybackScheduler<O>) -> Self {
        Self { decoder, scheduler }
    }

    /// Process inbound events in delivery order until stopped or the
    /// channel ends. Playback is flushed on the way out.
    pub async fn run(mut self, mut inbound: InboundStream, mut stop: watch::Receiver<bool>) -> DownlinkEnd {
        let end = loop {
            tokio::select! {
                biased;

                _ = stop.changed() => break DownlinkEnd::Stopped,

                event = inbound.recv() => match event {
                    Some(event) => {
                        if let Some(end) = self.handle_event(event) {
                            break end;
                        }
                    }
                    None => break DownlinkEnd::RemoteClosed,
                },
            }
        };

        self.scheduler.flush();
        end
    }

    /// Handle one channel event; returns the end reason if the channel is done
    pub fn handle_event(&mut self, event: ChannelEvent) -> Option<DownlinkEnd> {
        match event {
            ChannelEvent::Message(text) => self.handle_message(&text),
            closed @ ChannelEvent::Closed { .. } if closed.is_normal_close() => {
                tracing::info!("Remote closed the channel");
                Some(DownlinkEnd::RemoteClosed)
            }
            ChannelEvent::Closed { code, reason } => {
                tracing::error!("Remote closed the channel: {} ({:?})", reason, code);
                Some(DownlinkEnd::Failed(NetworkError::Closed(reason)))
            }
            ChannelEvent::Failed(reason) => {
                tracing::error!("Channel failed: {}", reason);
                Some(DownlinkEnd::Failed(NetworkError::ConnectionFailed(reason)))
            }
        }
    }

    fn handle_message(&mut self, text: &str) -> Option<DownlinkEnd> {
        let message = match ServerMessage::parse(text) {
            Ok(message) => message,
            Err(e) => {
                tracing::warn!("Ignoring unparseable message: {}", e);
                return None;
            }
        };

        for event in message.into_events() {
            match event {
                InboundEvent::Audio(blob) => match self.decoder.decode_inline(&blob.mime_type, &blob.data) {
                    Ok(buffer) => {
                        if let Err(e) = self.scheduler.schedule_buffer(&buffer) {
                            tracing::warn!("Failed to schedule buffer: {}", e);
                        }
                    }
                    Err(e) => tracing::warn!("Dropping malformed audio chunk: {}", e),
                },
                InboundEvent::Interrupted => {
                    tracing::debug!("Interrupted, flushing playback");
                    self.scheduler.flush();
                }
                InboundEvent::TurnComplete => tracing::debug!("Turn complete"),
                InboundEvent::GoAway { time_left } => {
                    tracing::warn!("Server going away (time left: {:?})", time_left);
                }
                InboundEvent::SetupComplete => {}
                InboundEvent::Error(reason) => {
                    tracing::error!("Server error: {}", reason);
                    return Some(DownlinkEnd::Failed(NetworkError::Server(reason)));
                }
            }
        }
        None
    }

    pub fn decoder(&self) -> &DownlinkDecoder {
        &self.decoder
    }
}
