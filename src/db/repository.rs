//! Repository traits for data access abstraction.
//!
//! These traits define the contract for persisting the sync engine's state,
//! allowing the storage backend to be swapped without touching the engine.

use std::future::Future;

use crate::db::{
    DbResult,
    models::{ChangeTarget, PendingChange, SyncSession},
};

/// Durable storage for queued changes.
pub trait ChangeRepository {
    /// Insert a new change.
    fn insert(&self, change: &PendingChange) -> impl Future<Output = DbResult<()>> + Send;

    /// Overwrite every mutable column of an existing change.
    fn update(&self, change: &PendingChange) -> impl Future<Output = DbResult<()>> + Send;

    /// Get a change by ID.
    fn get(&self, id: &str) -> impl Future<Output = DbResult<PendingChange>> + Send;

    /// Find the pending (not yet submitted) change for a target, if any.
    fn find_pending(
        &self,
        target: &ChangeTarget,
    ) -> impl Future<Output = DbResult<Option<PendingChange>>> + Send;

    /// All changes in queue order.
    fn list(&self) -> impl Future<Output = DbResult<Vec<PendingChange>>> + Send;

    /// Delete a change. Returns false when it did not exist.
    fn delete(&self, id: &str) -> impl Future<Output = DbResult<bool>> + Send;

    /// Next queue position.
    fn next_seq(&self) -> impl Future<Output = DbResult<i64>> + Send;

    /// Return every in-flight change to pending. Returns the number reset.
    fn reset_in_flight(&self) -> impl Future<Output = DbResult<u64>> + Send;
}

/// History of finished flush cycles.
pub trait SessionRepository {
    /// Persist a finished session.
    fn record(&self, session: &SyncSession) -> impl Future<Output = DbResult<()>> + Send;

    /// Most recent sessions, newest first.
    fn recent(&self, limit: usize) -> impl Future<Output = DbResult<Vec<SyncSession>>> + Send;
}

/// Storage backend giving access to the repositories.
///
/// Repositories are handed out through associated types, avoiding dynamic
/// dispatch.
pub trait Database: Send + Sync {
    type Changes<'a>: ChangeRepository + Send + Sync
    where
        Self: 'a;
    type Sessions<'a>: SessionRepository + Send + Sync
    where
        Self: 'a;

    /// Apply pending schema migrations.
    fn migrate(&self) -> impl Future<Output = DbResult<()>> + Send;

    fn changes(&self) -> Self::Changes<'_>;

    fn sessions(&self) -> Self::Sessions<'_>;
}
