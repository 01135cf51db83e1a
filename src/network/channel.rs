//! Duplex channel abstraction
//!
//! A [`StreamingClient`] opens a [`DuplexChannel`] plus the stream of
//! events arriving on it. Channels are single-owner: `close` consumes the
//! handle, so a channel can only ever be released once.

use std::future::Future;

use tokio::sync::mpsc;

use crate::config::TransportConfig;
use crate::error::NetworkError;

/// Normal closure status code
pub const CLOSE_NORMAL: u16 = 1000;

/// Something that happened on the inbound side of a channel
#[derive(Debug, Clone, PartialEq)]
pub enum ChannelEvent {
    /// One text frame
    Message(String),
    /// The remote end closed the channel
    Closed { code: Option<u16>, reason: String },
    /// The channel broke
    Failed(String),
}

impl ChannelEvent {
    /// Close without a status, or with the normal one
    pub fn is_normal_close(&self) -> bool {
        matches!(self, ChannelEvent::Closed { code, .. } if code.map_or(true, |c| c == CLOSE_NORMAL))
    }
}

/// Inbound events in delivery order
pub type InboundStream = mpsc::UnboundedReceiver<ChannelEvent>;

/// Outbound half of an open channel
pub trait DuplexChannel: Send + 'static {
    /// Queue a frame for sending; never waits for the network
    fn send(&self, frame: String) -> Result<(), NetworkError>;

    /// Release the channel
    fn close(self) -> impl Future<Output = ()> + Send;
}

/// Opens channels to the streaming endpoint
pub trait StreamingClient: Send + Sync + 'static {
    type Channel: DuplexChannel;

    fn open(
        &self,
        config: &TransportConfig,
    ) -> impl Future<Output = Result<(Self::Channel, InboundStream), NetworkError>> + Send;
}
