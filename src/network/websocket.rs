//! WebSocket implementation of the duplex channel
//!
//! The socket is split into a writer task fed by an unbounded queue and a
//! reader task forwarding frames as [`ChannelEvent`]s.

use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;

use crate::config::TransportConfig;
use crate::error::NetworkError;
use crate::network::channel::{ChannelEvent, DuplexChannel, InboundStream, StreamingClient};

/// Opens WebSocket channels to the configured endpoint
#[derive(Debug, Clone, Default)]
pub struct WebSocketClient;

impl WebSocketClient {
    pub fn new() -> Self {
        Self
    }
}

impl StreamingClient for WebSocketClient {
    type Channel = WsChannel;

    async fn open(&self, config: &TransportConfig) -> Result<(WsChannel, InboundStream), NetworkError> {
        let url = config.url()?;
        tracing::info!("Connecting to {}", config.endpoint);

        let (ws_stream, _) = connect_async(url.as_str())
            .await
            .map_err(|e| NetworkError::ConnectionFailed(e.to_string()))?;
        let (mut writer, mut reader) = ws_stream.split();

        let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel::<Message>();
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel::<ChannelEvent>();

        let writer_task = tokio::spawn(async move {
            while let Some(message) = outbound_rx.recv().await {
                let is_close = matches!(message, Message::Close(_));
                if let Err(e) = writer.send(message).await {
                    tracing::warn!("WebSocket write failed: {}", e);
                    break;
                }
                if is_close {
                    break;
                }
            }
            let _ = writer.close().await;
        });

        let reader_task = tokio::spawn(async move {
            while let Some(frame) = reader.next().await {
                let event = match frame {
                    Ok(Message::Text(text)) => ChannelEvent::Message(text),
                    // The server may deliver JSON in binary frames
                    Ok(Message::Binary(bytes)) => match String::from_utf8(bytes) {
                        Ok(text) => ChannelEvent::Message(text),
                        Err(_) => {
                            tracing::warn!("Dropping non-UTF-8 binary frame");
                            continue;
                        }
                    },
                    Ok(Message::Close(frame)) => {
                        let (code, reason) = match frame {
                            Some(f) => (Some(u16::from(f.code)), f.reason.to_string()),
                            None => (None, String::new()),
                        };
                        let _ = inbound_tx.send(ChannelEvent::Closed { code, reason });
                        return;
                    }
                    Ok(_) => continue,
                    Err(e) => {
                        let _ = inbound_tx.send(ChannelEvent::Failed(e.to_string()));
                        return;
                    }
                };

                if inbound_tx.send(event).is_err() {
                    return;
                }
            }

            let _ = inbound_tx.send(ChannelEvent::Closed {
                code: None,
                reason: "stream ended".into(),
            });
        });

        Ok((
            WsChannel {
                outbound: outbound_tx,
                writer: Some(writer_task),
                reader: Some(reader_task),
            },
            inbound_rx,
        ))
    }
}

/// Open WebSocket channel
pub struct WsChannel {
    outbound: mpsc::UnboundedSender<Message>,
    writer: Option<JoinHandle<()>>,
    reader: Option<JoinHandle<()>>,
}

impl DuplexChannel for WsChannel {
    fn send(&self, frame: String) -> Result<(), NetworkError> {
        self.outbound
            .send(Message::Text(frame))
            .map_err(|_| NetworkError::SendFailed("writer stopped".into()))
    }

    async fn close(mut self) {
        let _ = self.outbound.send(Message::Close(Some(CloseFrame {
            code: CloseCode::Normal,
            reason: "client disconnect".into(),
        })));

        // Let queued frames and the close frame drain
        if let Some(writer) = self.writer.take() {
            let _ = writer.await;
        }
        if let Some(reader) = self.reader.take() {
            reader.abort();
        }
        tracing::debug!("WebSocket closed");
    }
}

impl Drop for WsChannel {
    fn drop(&mut self) {
        if let Some(writer) = self.writer.take() {
            writer.abort();
        }
        if let Some(reader) = self.reader.take() {
            reader.abort();
        }
    }
}
