//! Realtime channel used to receive server-initiated resync signals.

mod channel;
mod protocol;
mod transport;

#[cfg(test)]
mod channel_test;

pub use channel::{ChannelCommand, ChannelState, DisconnectReason, RealtimeChannel, RealtimeConfig};
pub use protocol::{ChannelMessage, ProtocolError};
pub use transport::{
    ChannelConnection, ChannelTransport, Incoming, TransportError, WsConnection, WsTransport,
};
