//! Network subsystem for the live streaming channel

pub mod channel;
pub mod transport;
pub mod websocket;

pub use channel::{ChannelEvent, DuplexChannel, InboundStream, StreamingClient};
pub use transport::{ChunkSender, Downlink, DownlinkEnd, LiveTransportSession};
pub use websocket::{WebSocketClient, WsChannel};
