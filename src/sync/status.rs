//! Aggregate, read-only view of the engine for UIs and the CLI.
//!
//! Components publish into a [`SyncStatusReporter`]; any number of
//! subscribers observe the latest [`SyncStatus`] snapshot.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::watch;

use super::connectivity::ConnectionState;
use super::realtime::ChannelState;
use crate::api::RemoteSyncStatus;
use crate::db::{QueueCounts, SyncSession};

/// Point-in-time status snapshot.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SyncStatus {
    pub connection: ConnectionState,
    pub channel: ChannelState,
    pub in_progress: bool,
    pub queue: QueueCounts,
    /// Finish time of the last fully completed flush cycle.
    pub last_sync: Option<DateTime<Utc>>,
    pub last_session: Option<SyncSession>,
    pub last_error: Option<String>,
    /// Server-side view from `GET /api/sync/status`, refreshed after each completed cycle.
    pub remote: Option<RemoteSyncStatus>,
}

impl Default for SyncStatus {
    fn default() -> Self {
        Self {
            connection: ConnectionState::default(),
            channel: ChannelState::default(),
            in_progress: false,
            queue: QueueCounts::default(),
            last_sync: None,
            last_session: None,
            last_error: None,
            remote: None,
        }
    }
}

impl SyncStatus {
    /// Changes the server has not confirmed yet.
    pub fn pending_count(&self) -> usize {
        self.queue.outstanding()
    }

    /// Something needs a person: failed or held changes, or a dead channel.
    pub fn needs_attention(&self) -> bool {
        self.queue.failed > 0 || self.queue.needs_attention > 0 || self.channel.is_exhausted()
    }
}

/// Publisher side of the status snapshot.
#[derive(Clone)]
pub struct SyncStatusReporter {
    tx: Arc<watch::Sender<SyncStatus>>,
}

impl Default for SyncStatusReporter {
    fn default() -> Self {
        Self::new()
    }
}

impl SyncStatusReporter {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(SyncStatus::default());
        Self { tx: Arc::new(tx) }
    }

    /// Subscribe to receive every new snapshot.
    pub fn subscribe(&self) -> watch::Receiver<SyncStatus> {
        self.tx.subscribe()
    }

    pub fn snapshot(&self) -> SyncStatus {
        self.tx.borrow().clone()
    }

    pub fn set_connection(&self, state: ConnectionState) {
        self.tx.send_if_modified(|s| replace(&mut s.connection, state));
    }

    pub fn set_channel(&self, state: ChannelState) {
        self.tx.send_if_modified(|s| replace(&mut s.channel, state));
    }

    pub fn set_in_progress(&self, in_progress: bool) {
        self.tx
            .send_if_modified(|s| replace(&mut s.in_progress, in_progress));
    }

    pub fn set_queue(&self, counts: QueueCounts) {
        self.tx.send_if_modified(|s| replace(&mut s.queue, counts));
    }

    /// Publish a finished flush cycle.
    pub fn record_session(&self, session: &SyncSession) {
        self.tx.send_modify(|s| {
            if session.outcome.is_completed() {
                s.last_sync = session.finished_at;
            }
            s.last_session = Some(session.clone());
        });
    }

    pub fn record_error(&self, message: impl Into<String>) {
        let message = message.into();
        self.tx.send_modify(|s| s.last_error = Some(message));
    }

    pub fn set_remote(&self, remote: RemoteSyncStatus) {
        self.tx
            .send_if_modified(|s| replace(&mut s.remote, Some(remote)));
    }

    pub fn clear_error(&self) {
        self.tx.send_if_modified(|s| s.last_error.take().is_some());
    }
}

/// Store `value` and report whether it differed.
fn replace<T: PartialEq>(slot: &mut T, value: T) -> bool {
    if *slot == value {
        false
    } else {
        *slot = value;
        true
    }
}
