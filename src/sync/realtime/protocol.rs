//! JSON frames exchanged over the realtime channel.
//!
//! Every frame is `{"event": "<name>", "data": {...}}`; `data` may be omitted
//! for events without fields.

use miette::Diagnostic;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

#[derive(Error, Diagnostic, Debug)]
pub enum ProtocolError {
    #[error("Malformed frame: {0}")]
    #[diagnostic(code(maintsync::realtime::malformed))]
    Malformed(#[from] serde_json::Error),

    #[error("Unknown event: {0}")]
    #[diagnostic(code(maintsync::realtime::unknown_event))]
    UnknownEvent(String),
}

#[derive(Debug, Serialize, Deserialize)]
struct Frame {
    event: String,
    #[serde(default, skip_serializing_if = "Value::is_null")]
    data: Value,
}

#[derive(Deserialize)]
struct ConnectedData {
    client_id: String,
}

#[derive(Deserialize)]
struct DisconnectData {
    #[serde(default)]
    reason: String,
}

#[derive(Deserialize)]
struct ErrorData {
    #[serde(default)]
    message: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelMessage {
    Connect,
    Connected { client_id: String },
    /// Server-side data changed; the client should flush and resync.
    Sync,
    Ping,
    Pong,
    Heartbeat,
    Disconnect { reason: String },
    Error { message: String },
}

impl ChannelMessage {
    pub fn decode(text: &str) -> Result<Self, ProtocolError> {
        let frame: Frame = serde_json::from_str(text)?;
        let data = frame.data;
        let message = match frame.event.as_str() {
            "connect" => ChannelMessage::Connect,
            "connected" => {
                let ConnectedData { client_id } = serde_json::from_value(data)?;
                ChannelMessage::Connected { client_id }
            }
            "sync" => ChannelMessage::Sync,
            "ping" => ChannelMessage::Ping,
            "pong" => ChannelMessage::Pong,
            "heartbeat" => ChannelMessage::Heartbeat,
            "disconnect" => {
                let reason = if data.is_null() {
                    String::new()
                } else {
                    serde_json::from_value::<DisconnectData>(data)?.reason
                };
                ChannelMessage::Disconnect { reason }
            }
            "error" => {
                let message = if data.is_null() {
                    String::new()
                } else {
                    serde_json::from_value::<ErrorData>(data)?.message
                };
                ChannelMessage::Error { message }
            }
            other => return Err(ProtocolError::UnknownEvent(other.to_string())),
        };
        Ok(message)
    }

    pub fn encode(&self) -> String {
        let (event, data) = match self {
            ChannelMessage::Connect => ("connect", Value::Null),
            ChannelMessage::Connected { client_id } => {
                ("connected", serde_json::json!({ "client_id": client_id }))
            }
            ChannelMessage::Sync => ("sync", Value::Null),
            ChannelMessage::Ping => ("ping", Value::Null),
            ChannelMessage::Pong => ("pong", Value::Null),
            ChannelMessage::Heartbeat => ("heartbeat", Value::Null),
            ChannelMessage::Disconnect { reason } => {
                ("disconnect", serde_json::json!({ "reason": reason }))
            }
            ChannelMessage::Error { message } => {
                ("error", serde_json::json!({ "message": message }))
            }
        };
        let frame = Frame {
            event: event.to_string(),
            data,
        };
        // A frame of a string and a JSON value always serializes.
        serde_json::to_string(&frame).unwrap_or_default()
    }

    /// Proof of life for the heartbeat.
    pub fn is_liveness(&self) -> bool {
        matches!(self, ChannelMessage::Pong | ChannelMessage::Heartbeat)
    }

    /// A `disconnect` the server chose, as opposed to one caused by the transport.
    pub fn is_server_disconnect(&self) -> bool {
        match self {
            ChannelMessage::Disconnect { reason } => {
                SERVER_DISCONNECT_REASONS.contains(&reason.as_str())
            }
            _ => false,
        }
    }
}

/// `disconnect` reasons that mean the server does not want the client back.
const SERVER_DISCONNECT_REASONS: &[&str] = &["server", "io server disconnect"];
