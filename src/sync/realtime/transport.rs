//! Transport seam for the realtime channel and its WebSocket implementation.

use std::future::Future;

use futures_util::{SinkExt, StreamExt};
use miette::Diagnostic;
use thiserror::Error;
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use tracing::debug;

#[derive(Error, Diagnostic, Debug)]
pub enum TransportError {
    #[error("Failed to open realtime channel: {message}")]
    #[diagnostic(
        code(maintsync::realtime::connect),
        help("Check MSYNC_WS_URL and that the server accepts WebSocket upgrades.")
    )]
    Connect { message: String },

    #[error("Realtime channel error: {message}")]
    #[diagnostic(code(maintsync::realtime::io))]
    Io { message: String },
}

/// A frame read from the transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Incoming {
    Text(String),
    /// The peer sent a close frame.
    Closed { code: Option<u16>, reason: String },
}

impl Incoming {
    /// Normal (1000) or policy (1008) close: the server does not want us back.
    pub fn is_deliberate_close(&self) -> bool {
        match self {
            Incoming::Closed { code: Some(code), .. } => {
                matches!(*code, 1000 | 1008)
            }
            _ => false,
        }
    }
}

/// One open connection. Dropped after every disconnect; never reused.
pub trait ChannelConnection: Send + 'static {
    fn send(&mut self, text: String) -> impl Future<Output = Result<(), TransportError>> + Send;

    /// Next frame, or `None` once the stream ended without a close frame.
    fn recv(&mut self) -> impl Future<Output = Option<Result<Incoming, TransportError>>> + Send;

    fn close(&mut self) -> impl Future<Output = ()> + Send;
}

/// Opens fresh connections to the server.
pub trait ChannelTransport: Send + Sync + 'static {
    type Connection: ChannelConnection;

    fn connect(&self) -> impl Future<Output = Result<Self::Connection, TransportError>> + Send;
}

/// WebSocket transport for `ws://` and `wss://` (rustls, webpki roots).
#[derive(Debug, Clone)]
pub struct WsTransport {
    url: String,
}

impl WsTransport {
    pub fn new(url: impl Into<String>) -> Self {
        Self { url: url.into() }
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

pub struct WsConnection {
    stream: WebSocketStream<MaybeTlsStream<TcpStream>>,
}

impl ChannelTransport for WsTransport {
    type Connection = WsConnection;

    async fn connect(&self) -> Result<WsConnection, TransportError> {
        if self.url.starts_with("wss://") {
            // Already installed by the binary; a second install is refused harmlessly.
            let _ = rustls::crypto::ring::default_provider().install_default();
        }
        let (stream, response) =
            connect_async(self.url.as_str())
                .await
                .map_err(|e| TransportError::Connect {
                    message: e.to_string(),
                })?;
        debug!(url = %self.url, status = response.status().as_u16(), "WebSocket opened");
        Ok(WsConnection { stream })
    }
}

impl ChannelConnection for WsConnection {
    async fn send(&mut self, text: String) -> Result<(), TransportError> {
        self.stream
            .send(Message::Text(text.into()))
            .await
            .map_err(|e| TransportError::Io {
                message: e.to_string(),
            })
    }

    async fn recv(&mut self) -> Option<Result<Incoming, TransportError>> {
        loop {
            let message = match self.stream.next().await? {
                Ok(message) => message,
                Err(e) => {
                    return Some(Err(TransportError::Io {
                        message: e.to_string(),
                    }));
                }
            };
            match message {
                Message::Text(text) => return Some(Ok(Incoming::Text(text.to_string()))),
                Message::Close(frame) => {
                    let (code, reason) = match frame {
                        Some(frame) => (Some(u16::from(frame.code)), frame.reason.to_string()),
                        None => (None, String::new()),
                    };
                    return Some(Ok(Incoming::Closed { code, reason }));
                }
                // Control frames are answered by tungstenite itself.
                Message::Ping(_) | Message::Pong(_) | Message::Binary(_) | Message::Frame(_) => {}
            }
        }
    }

    async fn close(&mut self) {
        let _ = self.stream.close(None).await;
    }
}
