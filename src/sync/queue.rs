//! Durable, ordered queue of local mutations.
//!
//! Every operation goes straight to the database before returning, so the
//! queue survives a process restart at any point. Read-modify-write
//! sequences are serialised by an async mutex.

use std::sync::Arc;

use serde_json::Value;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use super::clock::{Clock, SystemClock};
use super::error::SyncResult;
use crate::db::{
    ChangeRepository, ChangeStatus, ChangeTarget, Database, DbError, PendingChange, QueueCounts,
};

/// Which side wins when a held conflict is resolved by hand.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Keep {
    /// Force the local change onto the server.
    Local,
    /// Drop the local change.
    Server,
}

impl std::str::FromStr for Keep {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "local" | "client" => Ok(Keep::Local),
            "server" | "remote" => Ok(Keep::Server),
            _ => Err(format!("Invalid side: {} (expected local or server)", s)),
        }
    }
}

/// The pending change queue.
pub struct PendingChangeQueue<D: Database> {
    db: Arc<D>,
    clock: Arc<dyn Clock>,
    write_lock: Mutex<()>,
}

impl<D: Database> PendingChangeQueue<D> {
    pub fn new(db: Arc<D>) -> Self {
        Self::with_clock(db, Arc::new(SystemClock))
    }

    pub fn with_clock(db: Arc<D>, clock: Arc<dyn Clock>) -> Self {
        Self {
            db,
            clock,
            write_lock: Mutex::new(()),
        }
    }

    /// Return changes left in flight by a previous process to pending.
    ///
    /// Submissions are idempotent per change id, so resending is safe.
    pub async fn recover(&self) -> SyncResult<u64> {
        let _guard = self.write_lock.lock().await;
        let reset = self.db.changes().reset_in_flight().await?;
        if reset > 0 {
            info!(count = reset, "Recovered in-flight changes from previous run");
        }
        Ok(reset)
    }

    /// Queue a change, coalescing with a pending change for the same target.
    ///
    /// Creates are never coalesced.
    pub async fn enqueue(&self, target: ChangeTarget, payload: Value) -> SyncResult<PendingChange> {
        let _guard = self.write_lock.lock().await;
        let now = self.clock.now();
        let changes = self.db.changes();
        let seq = changes.next_seq().await?;

        let existing = if target.coalesces() {
            changes.find_pending(&target).await?
        } else {
            None
        };
        if let Some(mut existing) = existing {
            existing.payload = payload;
            existing.enqueued_at = now;
            existing.seq = seq;
            existing.last_error = None;
            // A fresh edit goes through conflict detection again.
            existing.force = false;
            changes.update(&existing).await?;
            debug!(id = %existing.id, target = %existing.target, "Coalesced pending change");
            return Ok(existing);
        }

        let mut change = PendingChange::new(target, payload, now);
        change.seq = seq;
        changes.insert(&change).await?;
        info!(id = %change.id, target = %change.target, "Queued change");
        Ok(change)
    }

    /// Up to `n` pending changes in FIFO order.
    pub async fn peek_batch(&self, n: usize) -> SyncResult<Vec<PendingChange>> {
        let all = self.db.changes().list().await?;
        Ok(all.into_iter().filter(|c| c.is_pending()).take(n).collect())
    }

    /// Every change in queue order, whatever its status.
    pub async fn all(&self) -> SyncResult<Vec<PendingChange>> {
        Ok(self.db.changes().list().await?)
    }

    pub async fn get(&self, id: &str) -> SyncResult<PendingChange> {
        Ok(self.db.changes().get(id).await?)
    }

    pub async fn counts(&self) -> SyncResult<QueueCounts> {
        let mut counts = QueueCounts::default();
        for change in self.db.changes().list().await? {
            match change.status {
                ChangeStatus::Pending => counts.pending += 1,
                ChangeStatus::InFlight => counts.in_flight += 1,
                ChangeStatus::Failed => counts.failed += 1,
                ChangeStatus::NeedsAttention => counts.needs_attention += 1,
                ChangeStatus::Applied => {}
            }
        }
        Ok(counts)
    }

    /// Claim a pending change for submission.
    ///
    /// Fails if another change for the same target is already in flight.
    pub async fn mark_in_flight(&self, id: &str) -> SyncResult<PendingChange> {
        let _guard = self.write_lock.lock().await;
        let changes = self.db.changes();
        let mut change = changes.get(id).await?;
        require_status(&change, &[ChangeStatus::Pending], "pending")?;

        let busy = changes.list().await?.into_iter().any(|other| {
            other.id != change.id
                && other.status == ChangeStatus::InFlight
                && other.target == change.target
        });
        if busy {
            return Err(DbError::InvalidState {
                id: change.id.clone(),
                status: change.status.to_string(),
                expected: "no other in-flight change for the same target".to_string(),
            }
            .into());
        }

        change.status = ChangeStatus::InFlight;
        changes.update(&change).await?;
        Ok(change)
    }

    /// The server acknowledged the change; remove it.
    ///
    /// Unknown ids are a no-op so replaying an acknowledgement is harmless.
    pub async fn mark_applied(&self, id: &str) -> SyncResult<bool> {
        let _guard = self.write_lock.lock().await;
        let removed = self.db.changes().delete(id).await?;
        if removed {
            debug!(id, "Change applied");
        }
        Ok(removed)
    }

    /// Permanently failed; kept in the queue so it stays visible.
    pub async fn mark_failed(&self, id: &str, reason: &str) -> SyncResult<()> {
        self.set_status(id, ChangeStatus::Failed, Some(reason)).await?;
        warn!(id, reason, "Change failed");
        Ok(())
    }

    /// Park a change for manual conflict resolution.
    pub async fn hold(&self, id: &str, reason: &str) -> SyncResult<()> {
        self.set_status(id, ChangeStatus::NeedsAttention, Some(reason))
            .await?;
        warn!(id, reason, "Change needs attention");
        Ok(())
    }

    /// Count a transient failure and put the change back in line.
    pub async fn record_transient_failure(
        &self,
        id: &str,
        reason: &str,
    ) -> SyncResult<PendingChange> {
        let _guard = self.write_lock.lock().await;
        let changes = self.db.changes();
        let mut change = changes.get(id).await?;
        change.attempts += 1;
        change.status = ChangeStatus::Pending;
        change.last_error = Some(reason.to_string());
        changes.update(&change).await?;
        Ok(change)
    }

    /// Replace what will be sent for a change and mark it as a forced overwrite.
    pub async fn resubmit(
        &self,
        id: &str,
        target: ChangeTarget,
        payload: Value,
    ) -> SyncResult<PendingChange> {
        let _guard = self.write_lock.lock().await;
        let changes = self.db.changes();
        let mut change = changes.get(id).await?;
        change.target = target;
        change.payload = payload;
        change.force = true;
        changes.update(&change).await?;
        Ok(change)
    }

    /// Put a failed or held change back in line with a fresh attempt budget.
    pub async fn retry(&self, id: &str) -> SyncResult<PendingChange> {
        let _guard = self.write_lock.lock().await;
        let changes = self.db.changes();
        let mut change = changes.get(id).await?;
        require_status(
            &change,
            &[ChangeStatus::Failed, ChangeStatus::NeedsAttention],
            "failed or needs_attention",
        )?;

        change.status = ChangeStatus::Pending;
        change.attempts = 0;
        change.last_error = None;
        changes.update(&change).await?;
        info!(id, "Change requeued");
        Ok(change)
    }

    /// Drop a change without sending it.
    pub async fn discard(&self, id: &str) -> SyncResult<bool> {
        let _guard = self.write_lock.lock().await;
        let removed = self.db.changes().delete(id).await?;
        if removed {
            info!(id, "Change discarded");
        }
        Ok(removed)
    }

    /// Settle a held conflict. Returns the requeued change when local wins.
    pub async fn resolve(&self, id: &str, keep: Keep) -> SyncResult<Option<PendingChange>> {
        let _guard = self.write_lock.lock().await;
        let changes = self.db.changes();
        let mut change = changes.get(id).await?;
        require_status(&change, &[ChangeStatus::NeedsAttention], "needs_attention")?;

        match keep {
            Keep::Server => {
                changes.delete(id).await?;
                info!(id, "Conflict resolved in favour of the server");
                Ok(None)
            }
            Keep::Local => {
                change.status = ChangeStatus::Pending;
                change.force = true;
                change.attempts = 0;
                change.last_error = None;
                changes.update(&change).await?;
                info!(id, "Conflict resolved in favour of the local change");
                Ok(Some(change))
            }
        }
    }

    async fn set_status(&self, id: &str, status: ChangeStatus, reason: Option<&str>) -> SyncResult<()> {
        let _guard = self.write_lock.lock().await;
        let changes = self.db.changes();
        let mut change = changes.get(id).await?;
        change.status = status;
        change.last_error = reason.map(str::to_string);
        changes.update(&change).await?;
        Ok(())
    }
}

fn require_status(
    change: &PendingChange,
    allowed: &[ChangeStatus],
    expected: &str,
) -> Result<(), DbError> {
    if allowed.contains(&change.status) {
        Ok(())
    } else {
        Err(DbError::InvalidState {
            id: change.id.clone(),
            status: change.status.to_string(),
            expected: expected.to_string(),
        })
    }
}
