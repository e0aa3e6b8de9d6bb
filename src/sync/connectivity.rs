//! Network reachability and server liveness.
//!
//! The monitor owns [`ConnectionState`]. It polls `GET /api/connection/status`
//! and only changes state through [`transition`]. Transport-level hints from
//! the host (link up/down) merely bring the next probe forward. Every probe
//! that confirms an unchanged Online state asks for a sweep flush.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::time::{Instant, sleep_until, timeout};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::event::{FlushReason, SyncEvent};
use super::status::SyncStatusReporter;
use crate::api::SyncServer;

/// Server reachability as seen by this client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    Online,
    /// Unknown or unreachable. Every process starts here.
    #[default]
    OfflineDetected,
    /// One successful probe seen; waiting for a second to confirm.
    Reconnecting,
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ConnectionState::Online => "online",
            ConnectionState::OfflineDetected => "offline",
            ConnectionState::Reconnecting => "reconnecting",
        };
        write!(f, "{}", s)
    }
}

/// Next state after one probe.
///
/// Leaving the offline side takes two consecutive successes; a single
/// failure anywhere drops back to `OfflineDetected`.
pub fn transition(state: ConnectionState, probe_ok: bool) -> ConnectionState {
    match (state, probe_ok) {
        (ConnectionState::OfflineDetected, true) => ConnectionState::Reconnecting,
        (ConnectionState::Reconnecting, true) => ConnectionState::Online,
        (ConnectionState::Online, true) => ConnectionState::Online,
        (_, false) => ConnectionState::OfflineDetected,
    }
}

/// Link-level hint from the host environment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NetworkHint {
    Online,
    Offline,
}

#[derive(Debug, Clone, Copy)]
pub struct MonitorConfig {
    pub probe_interval: Duration,
    /// Probe delay after a hint, and while confirming a reconnect.
    pub hint_interval: Duration,
    pub probe_timeout: Duration,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            probe_interval: Duration::from_secs(30),
            hint_interval: Duration::from_secs(2),
            probe_timeout: Duration::from_secs(5),
        }
    }
}

pub struct ConnectivityMonitor<S: SyncServer> {
    server: Arc<S>,
    config: MonitorConfig,
    state: ConnectionState,
    hints: mpsc::Receiver<NetworkHint>,
    events: mpsc::Sender<SyncEvent>,
    status: SyncStatusReporter,
}

impl<S: SyncServer> ConnectivityMonitor<S> {
    pub fn new(
        server: Arc<S>,
        config: MonitorConfig,
        hints: mpsc::Receiver<NetworkHint>,
        events: mpsc::Sender<SyncEvent>,
        status: SyncStatusReporter,
    ) -> Self {
        Self {
            server,
            config,
            state: ConnectionState::default(),
            hints,
            events,
            status,
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    /// One liveness probe, bounded by `probe_timeout`.
    pub async fn probe(&self) -> bool {
        match timeout(self.config.probe_timeout, self.server.connection_status()).await {
            Ok(Ok(status)) if status.is_connected() => true,
            Ok(Ok(status)) => {
                debug!(status = %status.status, offline_mode = status.offline_mode, "Server not accepting sync");
                false
            }
            Ok(Err(e)) => {
                debug!(error = %e, "Liveness probe failed");
                false
            }
            Err(_) => {
                debug!(timeout_ms = self.config.probe_timeout.as_millis() as u64, "Liveness probe timed out");
                false
            }
        }
    }

    /// Feed one probe result through the state machine and publish any change.
    pub async fn apply(&mut self, probe_ok: bool) -> Option<ConnectionState> {
        let previous = self.state;
        let next = transition(previous, probe_ok);
        if next == previous {
            return None;
        }

        self.state = next;
        info!(from = %previous, to = %next, "Connection state changed");
        self.status.set_connection(next);
        let _ = self.events.send(SyncEvent::Connectivity(next)).await;
        if next == ConnectionState::Online {
            let _ = self
                .events
                .send(SyncEvent::FlushRequested(FlushReason::Reconnected))
                .await;
        }
        Some(next)
    }

    fn next_interval(&self) -> Duration {
        match self.state {
            ConnectionState::Reconnecting => self.config.hint_interval,
            _ => self.config.probe_interval,
        }
    }

    /// Probe until cancelled. The first probe runs immediately.
    pub async fn run(mut self, cancel: CancellationToken) {
        let mut next_probe = Instant::now();
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = sleep_until(next_probe) => {
                    let ok = self.probe().await;
                    let changed = self.apply(ok).await;
                    if changed.is_none() && self.state == ConnectionState::Online {
                        let _ = self
                            .events
                            .send(SyncEvent::FlushRequested(FlushReason::Sweep))
                            .await;
                    }
                    next_probe = Instant::now() + self.next_interval();
                }
                Some(hint) = self.hints.recv() => {
                    let soon = Instant::now() + self.config.hint_interval;
                    if soon < next_probe {
                        next_probe = soon;
                    }
                    if hint == NetworkHint::Offline && self.state == ConnectionState::Online {
                        warn!("Host reports the network is down; confirming with a probe");
                    } else {
                        debug!(?hint, "Network hint received");
                    }
                }
            }
        }
        debug!("Connectivity monitor stopped");
    }
}
