//! Persistent realtime channel: handshake, heartbeat, reconnect.
//!
//! The channel task owns its connection outright. Everything else talks to it
//! through [`ChannelCommand`]s and hears from it through [`SyncEvent`]s and
//! the status reporter.

use std::future::pending;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::mpsc;
use tokio::time::{Instant, sleep, sleep_until, timeout};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::protocol::ChannelMessage;
use super::transport::{ChannelConnection, ChannelTransport, Incoming, TransportError};
use crate::sync::backoff::{Backoff, BackoffPolicy};
use crate::sync::error::SyncError;
use crate::sync::event::{FlushReason, SyncEvent};
use crate::sync::status::SyncStatusReporter;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DisconnectReason {
    NotStarted,
    Manual,
    ServerClosed,
    /// Reconnect attempts ran out; needs a foreground trigger or manual reconnect.
    RetriesExhausted,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "state", content = "detail", rename_all = "snake_case")]
pub enum ChannelState {
    Disconnected(DisconnectReason),
    Connecting,
    Connected,
    Reconnecting { attempt: u32, delay_ms: u64 },
}

impl Default for ChannelState {
    fn default() -> Self {
        ChannelState::Disconnected(DisconnectReason::NotStarted)
    }
}

impl ChannelState {
    pub fn is_connected(&self) -> bool {
        matches!(self, ChannelState::Connected)
    }

    pub fn is_exhausted(&self) -> bool {
        matches!(
            self,
            ChannelState::Disconnected(DisconnectReason::RetriesExhausted)
        )
    }
}

impl std::fmt::Display for ChannelState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ChannelState::Disconnected(DisconnectReason::NotStarted) => write!(f, "disconnected"),
            ChannelState::Disconnected(DisconnectReason::Manual) => {
                write!(f, "disconnected (manual)")
            }
            ChannelState::Disconnected(DisconnectReason::ServerClosed) => {
                write!(f, "disconnected (closed by server)")
            }
            ChannelState::Disconnected(DisconnectReason::RetriesExhausted) => {
                write!(f, "disconnected (retries exhausted)")
            }
            ChannelState::Connecting => write!(f, "connecting"),
            ChannelState::Connected => write!(f, "connected"),
            ChannelState::Reconnecting { attempt, delay_ms } => {
                write!(f, "reconnecting (attempt {} in {}ms)", attempt, delay_ms)
            }
        }
    }
}

/// Requests from the rest of the process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelCommand {
    /// Reset the attempt counter and reconnect now.
    Reconnect,
    /// Close and stay closed until `Reconnect`.
    Disconnect,
    /// The app came to the foreground; reconnect now unless manually closed.
    Foreground,
}

#[derive(Debug, Clone, Copy)]
pub struct RealtimeConfig {
    pub heartbeat_interval: Duration,
    pub heartbeat_timeout: Duration,
    pub connect_timeout: Duration,
    pub reconnect: BackoffPolicy,
}

impl Default for RealtimeConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval: Duration::from_secs(25),
            heartbeat_timeout: Duration::from_secs(10),
            connect_timeout: Duration::from_secs(10),
            reconnect: BackoffPolicy::new(Duration::from_secs(1), Duration::from_secs(30), 10),
        }
    }
}

enum Next {
    Connect,
    Wait(Duration),
    Idle,
    Stop,
}

enum Wake {
    Shutdown,
    Command(ChannelCommand),
    PingDue,
    PongOverdue,
    Frame(Option<Result<Incoming, TransportError>>),
}

pub struct RealtimeChannel<T: ChannelTransport> {
    transport: T,
    config: RealtimeConfig,
    commands: mpsc::Receiver<ChannelCommand>,
    events: mpsc::Sender<SyncEvent>,
    status: SyncStatusReporter,
    backoff: Backoff,
    manual: bool,
    client_id: Option<String>,
    last_error: String,
}

impl<T: ChannelTransport> RealtimeChannel<T> {
    pub fn new(
        transport: T,
        config: RealtimeConfig,
        commands: mpsc::Receiver<ChannelCommand>,
        events: mpsc::Sender<SyncEvent>,
        status: SyncStatusReporter,
    ) -> Self {
        Self {
            transport,
            backoff: config.reconnect.series(),
            config,
            commands,
            events,
            status,
            manual: false,
            client_id: None,
            last_error: String::new(),
        }
    }

    /// Drive the channel until cancelled. Connects immediately.
    pub async fn run(mut self, cancel: CancellationToken) {
        let mut next = Next::Connect;
        loop {
            next = match next {
                Next::Connect => self.open(&cancel).await,
                Next::Wait(delay) => self.wait(delay, &cancel).await,
                Next::Idle => self.idle(&cancel).await,
                Next::Stop => break,
            };
        }
        debug!("Realtime channel stopped");
    }

    fn set_state(&self, state: ChannelState) {
        self.status.set_channel(state);
    }

    async fn emit(&self, event: SyncEvent) {
        let _ = self.events.send(event).await;
    }

    async fn open(&mut self, cancel: &CancellationToken) -> Next {
        self.set_state(ChannelState::Connecting);

        let attempt = {
            let connect = timeout(self.config.connect_timeout, self.transport.connect());
            tokio::pin!(connect);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => return Next::Stop,
                    Some(cmd) = self.commands.recv() => match cmd {
                        ChannelCommand::Disconnect => {
                            self.manual = true;
                            self.set_state(ChannelState::Disconnected(DisconnectReason::Manual));
                            return Next::Idle;
                        }
                        ChannelCommand::Reconnect => {
                            self.manual = false;
                            self.backoff.reset();
                            return Next::Connect;
                        }
                        ChannelCommand::Foreground => {
                            debug!("Foreground while connecting");
                            self.backoff.reset();
                        }
                    },
                    result = &mut connect => break result,
                }
            }
        };

        let mut conn = match attempt {
            Ok(Ok(conn)) => conn,
            Ok(Err(e)) => {
                warn!(error = %e, "Realtime connect failed");
                self.last_error = e.to_string();
                return self.schedule_reconnect();
            }
            Err(_) => {
                warn!(
                    timeout_ms = self.config.connect_timeout.as_millis() as u64,
                    "Realtime connect timed out"
                );
                self.last_error = "connect timed out".to_string();
                return self.schedule_reconnect();
            }
        };

        if let Err(e) = conn.send(ChannelMessage::Connect.encode()).await {
            warn!(error = %e, "Realtime handshake failed");
            self.last_error = e.to_string();
            return self.schedule_reconnect();
        }

        self.set_state(ChannelState::Connected);
        info!("Realtime channel open");
        self.serve(conn, cancel).await
    }

    async fn serve(&mut self, mut conn: T::Connection, cancel: &CancellationToken) -> Next {
        let mut next_ping = Instant::now() + self.config.heartbeat_interval;
        let mut pong_deadline: Option<Instant> = None;

        loop {
            let wake = tokio::select! {
                _ = cancel.cancelled() => Wake::Shutdown,
                Some(cmd) = self.commands.recv() => Wake::Command(cmd),
                _ = sleep_until(next_ping), if pong_deadline.is_none() => Wake::PingDue,
                _ = sleep_until_opt(pong_deadline) => Wake::PongOverdue,
                frame = conn.recv() => Wake::Frame(frame),
            };

            match wake {
                Wake::Shutdown => {
                    conn.close().await;
                    return Next::Stop;
                }
                Wake::Command(ChannelCommand::Disconnect) => {
                    conn.close().await;
                    self.manual = true;
                    info!("Realtime channel closed by request");
                    self.set_state(ChannelState::Disconnected(DisconnectReason::Manual));
                    self.emit(SyncEvent::ChannelDown).await;
                    return Next::Idle;
                }
                Wake::Command(ChannelCommand::Reconnect) => {
                    conn.close().await;
                    self.backoff.reset();
                    self.emit(SyncEvent::ChannelDown).await;
                    return Next::Connect;
                }
                Wake::Command(ChannelCommand::Foreground) => {
                    debug!("Foreground while connected");
                }
                Wake::PingDue => {
                    let now = Instant::now();
                    if let Err(e) = conn.send(ChannelMessage::Ping.encode()).await {
                        return self.lost(e.to_string()).await;
                    }
                    pong_deadline = Some(now + self.config.heartbeat_timeout);
                    next_ping = now + self.config.heartbeat_interval;
                }
                Wake::PongOverdue => {
                    let err = SyncError::ChannelTimeout {
                        waited_ms: self.config.heartbeat_timeout.as_millis() as u64,
                    };
                    conn.close().await;
                    return self.lost(err.to_string()).await;
                }
                Wake::Frame(None) => {
                    return self.lost("connection dropped".to_string()).await;
                }
                Wake::Frame(Some(Err(e))) => {
                    return self.lost(e.to_string()).await;
                }
                Wake::Frame(Some(Ok(closed @ Incoming::Closed { .. }))) => {
                    if closed.is_deliberate_close() {
                        return self.closed_by_server(&format!("{:?}", closed)).await;
                    }
                    return self.lost(format!("{:?}", closed)).await;
                }
                Wake::Frame(Some(Ok(Incoming::Text(text)))) => {
                    let message = match ChannelMessage::decode(&text) {
                        Ok(message) => message,
                        Err(e) => {
                            warn!(error = %e, "Ignoring unparseable realtime frame");
                            continue;
                        }
                    };
                    if message.is_liveness() {
                        pong_deadline = None;
                    }
                    let server_disconnect = message.is_server_disconnect();

                    match message {
                        ChannelMessage::Connected { client_id } => {
                            info!(client_id = %client_id, "Realtime handshake complete");
                            self.client_id = Some(client_id);
                            self.backoff.reset();
                            self.emit(SyncEvent::ChannelUp).await;
                        }
                        ChannelMessage::Sync => {
                            debug!("Server requested a resync");
                            self.emit(SyncEvent::FlushRequested(FlushReason::ServerSignal))
                                .await;
                        }
                        ChannelMessage::Ping => {
                            if let Err(e) = conn.send(ChannelMessage::Pong.encode()).await {
                                return self.lost(e.to_string()).await;
                            }
                        }
                        ChannelMessage::Disconnect { reason } => {
                            conn.close().await;
                            if server_disconnect {
                                return self.closed_by_server(&reason).await;
                            }
                            return self.lost(format!("disconnect: {}", reason)).await;
                        }
                        ChannelMessage::Error { message } => {
                            warn!(message = %message, "Server reported a realtime error");
                            self.status.record_error(format!("Realtime: {}", message));
                        }
                        ChannelMessage::Pong | ChannelMessage::Heartbeat | ChannelMessage::Connect => {}
                    }
                }
            }
        }
    }

    /// Unexpected loss of an open connection.
    async fn lost(&mut self, reason: String) -> Next {
        warn!(reason = %reason, "Realtime channel lost");
        self.status.record_error(format!("Realtime: {}", reason));
        self.last_error = reason;
        self.client_id = None;
        self.emit(SyncEvent::ChannelDown).await;
        self.schedule_reconnect()
    }

    async fn closed_by_server(&mut self, reason: &str) -> Next {
        info!(reason, "Realtime channel closed by server; not reconnecting");
        self.client_id = None;
        self.set_state(ChannelState::Disconnected(DisconnectReason::ServerClosed));
        self.emit(SyncEvent::ChannelDown).await;
        Next::Idle
    }

    fn schedule_reconnect(&mut self) -> Next {
        if self.manual {
            self.set_state(ChannelState::Disconnected(DisconnectReason::Manual));
            return Next::Idle;
        }

        match self.backoff.next_delay() {
            Some(delay) => {
                let attempt = self.backoff.attempt();
                let delay_ms = delay.as_millis() as u64;
                info!(attempt, delay_ms, "Scheduling realtime reconnect");
                self.set_state(ChannelState::Reconnecting { attempt, delay_ms });
                Next::Wait(delay)
            }
            None => {
                let err = SyncError::MaxRetriesExceeded {
                    attempts: self.backoff.attempt(),
                    last_error: self.last_error.clone(),
                };
                error!(error = %err, "Realtime channel giving up");
                self.status.record_error(err.to_string());
                self.set_state(ChannelState::Disconnected(DisconnectReason::RetriesExhausted));
                Next::Idle
            }
        }
    }

    async fn wait(&mut self, delay: Duration, cancel: &CancellationToken) -> Next {
        tokio::select! {
            _ = cancel.cancelled() => Next::Stop,
            _ = sleep(delay) => Next::Connect,
            Some(cmd) = self.commands.recv() => match cmd {
                ChannelCommand::Disconnect => {
                    self.manual = true;
                    info!("Pending reconnect cancelled by request");
                    self.set_state(ChannelState::Disconnected(DisconnectReason::Manual));
                    Next::Idle
                }
                ChannelCommand::Reconnect | ChannelCommand::Foreground => {
                    self.backoff.reset();
                    Next::Connect
                }
            },
        }
    }

    async fn idle(&mut self, cancel: &CancellationToken) -> Next {
        tokio::select! {
            _ = cancel.cancelled() => Next::Stop,
            Some(cmd) = self.commands.recv() => match cmd {
                ChannelCommand::Disconnect => {
                    self.manual = true;
                    self.set_state(ChannelState::Disconnected(DisconnectReason::Manual));
                    Next::Idle
                }
                ChannelCommand::Reconnect => {
                    self.manual = false;
                    self.backoff.reset();
                    Next::Connect
                }
                ChannelCommand::Foreground if self.manual => {
                    debug!("Foreground ignored; channel closed by request");
                    Next::Idle
                }
                ChannelCommand::Foreground => {
                    self.backoff.reset();
                    Next::Connect
                }
            },
        }
    }
}

async fn sleep_until_opt(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => sleep_until(deadline).await,
        None => pending().await,
    }
}
