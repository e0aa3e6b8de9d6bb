//! Domain models for the local sync store.
//!
//! These models are storage-agnostic and represent the records the sync
//! engine persists between process restarts.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Stable identifier of a queued change (UUID v4, reused across retries).
pub type ChangeId = String;

/// Create/update/delete semantics of a queued mutation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeMethod {
    Create,
    Update,
    Delete,
}

impl std::fmt::Display for ChangeMethod {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ChangeMethod::Create => write!(f, "create"),
            ChangeMethod::Update => write!(f, "update"),
            ChangeMethod::Delete => write!(f, "delete"),
        }
    }
}

impl std::str::FromStr for ChangeMethod {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "create" | "post" => Ok(ChangeMethod::Create),
            "update" | "put" | "patch" => Ok(ChangeMethod::Update),
            "delete" => Ok(ChangeMethod::Delete),
            _ => Err(format!("Invalid ChangeMethod: {}", s)),
        }
    }
}

/// Logical resource a change applies to, e.g. `PUT /api/parts/1`.
///
/// Two changes with equal targets coalesce while the earlier one is still
/// pending.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ChangeTarget {
    pub resource: String,
    pub method: ChangeMethod,
}

impl ChangeTarget {
    pub fn new(resource: impl Into<String>, method: ChangeMethod) -> Self {
        Self {
            resource: resource.into(),
            method,
        }
    }

    pub fn create(resource: impl Into<String>) -> Self {
        Self::new(resource, ChangeMethod::Create)
    }

    pub fn update(resource: impl Into<String>) -> Self {
        Self::new(resource, ChangeMethod::Update)
    }

    pub fn delete(resource: impl Into<String>) -> Self {
        Self::new(resource, ChangeMethod::Delete)
    }

    /// Whether a later change may replace an earlier pending one.
    ///
    /// Creates address a collection, so each one is a distinct record.
    pub fn coalesces(&self) -> bool {
        self.method != ChangeMethod::Create
    }
}

impl std::fmt::Display for ChangeTarget {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} {}", self.method, self.resource)
    }
}

/// Lifecycle state of a queued change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ChangeStatus {
    #[default]
    Pending,
    InFlight,
    Failed,
    /// Held by a manual conflict resolution; never retried automatically.
    NeedsAttention,
    Applied,
}

impl std::fmt::Display for ChangeStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ChangeStatus::Pending => "pending",
            ChangeStatus::InFlight => "in_flight",
            ChangeStatus::Failed => "failed",
            ChangeStatus::NeedsAttention => "needs_attention",
            ChangeStatus::Applied => "applied",
        };
        write!(f, "{}", s)
    }
}

impl std::str::FromStr for ChangeStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(ChangeStatus::Pending),
            "in_flight" => Ok(ChangeStatus::InFlight),
            "failed" => Ok(ChangeStatus::Failed),
            "needs_attention" => Ok(ChangeStatus::NeedsAttention),
            "applied" => Ok(ChangeStatus::Applied),
            _ => Err(format!("Invalid ChangeStatus: {}", s)),
        }
    }
}

/// One queued local mutation not yet confirmed by the server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PendingChange {
    pub id: ChangeId,
    pub target: ChangeTarget,
    pub payload: serde_json::Value,
    pub enqueued_at: DateTime<Utc>,
    pub attempts: u32,
    pub status: ChangeStatus,
    /// Queue position; refreshed when a newer change coalesces into this one.
    pub seq: i64,
    pub last_error: Option<String>,
    /// Overwrite server state unconditionally on the next submission.
    #[serde(default)]
    pub force: bool,
}

impl PendingChange {
    /// Build a fresh pending change with a new id.
    pub fn new(target: ChangeTarget, payload: serde_json::Value, now: DateTime<Utc>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            target,
            payload,
            enqueued_at: now,
            attempts: 0,
            status: ChangeStatus::Pending,
            seq: 0,
            last_error: None,
            force: false,
        }
    }

    pub fn is_pending(&self) -> bool {
        self.status == ChangeStatus::Pending
    }
}

/// Per-status queue counts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueCounts {
    pub pending: usize,
    pub in_flight: usize,
    pub failed: usize,
    pub needs_attention: usize,
}

impl QueueCounts {
    /// Changes still waiting on the server (pending or in flight).
    pub fn outstanding(&self) -> usize {
        self.pending + self.in_flight
    }

    pub fn total(&self) -> usize {
        self.pending + self.in_flight + self.failed + self.needs_attention
    }
}

/// Why a flush cycle ended early.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "detail", rename_all = "snake_case")]
pub enum SessionOutcome {
    Completed,
    /// Stopped at a transiently failing item; a retry is scheduled.
    Interrupted(String),
    /// Cancelled by a disconnect or shutdown.
    Aborted(String),
    Failed(String),
}

impl SessionOutcome {
    pub fn is_completed(&self) -> bool {
        matches!(self, SessionOutcome::Completed)
    }
}

/// Record of one flush cycle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncSession {
    pub id: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub attempted: usize,
    pub succeeded: usize,
    pub conflicted: usize,
    pub failed: usize,
    pub outcome: SessionOutcome,
    /// Message returned by the server-side reconciliation trigger, if called.
    pub server_message: Option<String>,
}

impl SyncSession {
    pub fn start(now: DateTime<Utc>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            started_at: now,
            finished_at: None,
            attempted: 0,
            succeeded: 0,
            conflicted: 0,
            failed: 0,
            outcome: SessionOutcome::Completed,
            server_message: None,
        }
    }

    pub fn finish(&mut self, outcome: SessionOutcome, now: DateTime<Utc>) {
        self.outcome = outcome;
        self.finished_at = Some(now);
    }
}
