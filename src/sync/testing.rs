//! In-process fake of the maintenance server for engine tests.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use crate::api::{ConnectionStatus, RemoteSyncStatus, SyncServer, TriggerResponse};
use crate::db::PendingChange;
use crate::sync::conflict::ServerVersion;
use crate::sync::error::{SyncError, SyncResult};

/// Scripted answer to one submission.
#[derive(Debug, Clone)]
pub enum Reply {
    Ok,
    Status(u16),
    Conflict(ServerVersion),
    Network,
}

impl Reply {
    fn into_result(self) -> SyncResult<()> {
        match self {
            Reply::Ok => Ok(()),
            Reply::Status(status) => Err(SyncError::from_status(status, "scripted")),
            Reply::Conflict(version) => Err(SyncError::ConflictDetected(version)),
            Reply::Network => Err(SyncError::TransientNetwork {
                message: "connection refused".into(),
            }),
        }
    }
}

#[derive(Default)]
pub struct FakeServer {
    online: AtomicBool,
    probes: Mutex<VecDeque<bool>>,
    probe_count: AtomicUsize,
    probe_delay: Mutex<Option<Duration>>,
    replies: Mutex<HashMap<String, VecDeque<Reply>>>,
    submit_delay: Mutex<Option<Duration>>,
    submitted: Mutex<Vec<PendingChange>>,
    triggers: AtomicUsize,
    trigger_fails: AtomicBool,
}

impl FakeServer {
    pub fn online() -> Self {
        let server = Self::default();
        server.set_online(true);
        server
    }

    pub fn set_online(&self, online: bool) {
        self.online.store(online, Ordering::SeqCst);
    }

    /// Answers for the next probes; afterwards the `online` flag applies.
    pub fn script_probes(&self, results: impl IntoIterator<Item = bool>) {
        self.probes.lock().unwrap().extend(results);
    }

    pub fn probe_count(&self) -> usize {
        self.probe_count.load(Ordering::SeqCst)
    }

    pub fn set_probe_delay(&self, delay: Duration) {
        *self.probe_delay.lock().unwrap() = Some(delay);
    }

    /// Queue replies for submissions to `resource`; unscripted ones succeed.
    pub fn reply(&self, resource: &str, replies: impl IntoIterator<Item = Reply>) {
        self.replies
            .lock()
            .unwrap()
            .entry(resource.to_string())
            .or_default()
            .extend(replies);
    }

    pub fn set_submit_delay(&self, delay: Duration) {
        *self.submit_delay.lock().unwrap() = Some(delay);
    }

    pub fn submitted(&self) -> Vec<PendingChange> {
        self.submitted.lock().unwrap().clone()
    }

    pub fn submitted_resources(&self) -> Vec<String> {
        self.submitted()
            .into_iter()
            .map(|c| c.target.resource)
            .collect()
    }

    pub fn trigger_count(&self) -> usize {
        self.triggers.load(Ordering::SeqCst)
    }

    pub fn fail_trigger(&self) {
        self.trigger_fails.store(true, Ordering::SeqCst);
    }
}

impl SyncServer for FakeServer {
    async fn connection_status(&self) -> SyncResult<ConnectionStatus> {
        self.probe_count.fetch_add(1, Ordering::SeqCst);
        let delay = *self.probe_delay.lock().unwrap();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let scripted = self.probes.lock().unwrap().pop_front();
        let up = scripted.unwrap_or_else(|| self.online.load(Ordering::SeqCst));
        if up {
            Ok(ConnectionStatus {
                status: "connected".into(),
                offline_mode: false,
            })
        } else {
            Err(SyncError::TransientNetwork {
                message: "connection refused".into(),
            })
        }
    }

    async fn sync_status(&self) -> SyncResult<RemoteSyncStatus> {
        Ok(RemoteSyncStatus::default())
    }

    async fn trigger_sync(&self) -> SyncResult<TriggerResponse> {
        self.triggers.fetch_add(1, Ordering::SeqCst);
        if self.trigger_fails.load(Ordering::SeqCst) {
            return Err(SyncError::from_status(500, "reconciliation failed"));
        }
        Ok(TriggerResponse {
            success: true,
            message: "ok".into(),
        })
    }

    async fn submit_change(&self, change: &PendingChange) -> SyncResult<()> {
        self.submitted.lock().unwrap().push(change.clone());
        let delay = *self.submit_delay.lock().unwrap();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let reply = self
            .replies
            .lock()
            .unwrap()
            .get_mut(&change.target.resource)
            .and_then(VecDeque::pop_front)
            .unwrap_or(Reply::Ok);
        reply.into_result()
    }
}
