//! Failure taxonomy of the sync engine.
//!
//! Every failure the engine can observe is one of these variants; the
//! orchestrator decides retry/fail/resolve purely from the variant.

use miette::Diagnostic;
use thiserror::Error;

use crate::db::DbError;
use crate::sync::conflict::ServerVersion;

/// Errors that can occur while synchronizing.
#[derive(Error, Diagnostic, Debug)]
pub enum SyncError {
    #[error("Network error: {message}")]
    #[diagnostic(code(maintsync::sync::transient_network))]
    TransientNetwork { message: String },

    #[error("Server rejected the change ({status}): {message}")]
    #[diagnostic(
        code(maintsync::sync::rejected),
        help("The change is kept as failed; fix it and retry, or discard it.")
    )]
    ServerRejection4xx { status: u16, message: String },

    #[error("Server error ({status}): {message}")]
    #[diagnostic(code(maintsync::sync::server_error))]
    ServerRejection5xx { status: u16, message: String },

    #[error("Conflict: the server holds a newer or divergent version")]
    #[diagnostic(code(maintsync::sync::conflict))]
    ConflictDetected(ServerVersion),

    #[error("Realtime channel timed out after {waited_ms}ms")]
    #[diagnostic(code(maintsync::sync::channel_timeout))]
    ChannelTimeout { waited_ms: u64 },

    #[error("Gave up after {attempts} attempts: {last_error}")]
    #[diagnostic(
        code(maintsync::sync::max_retries),
        help("Retry it manually once the server is reachable, or discard it.")
    )]
    MaxRetriesExceeded { attempts: u32, last_error: String },

    #[error("Storage error: {0}")]
    #[diagnostic(code(maintsync::sync::storage))]
    Storage(#[from] DbError),

    #[error("Cancelled: {reason}")]
    #[diagnostic(code(maintsync::sync::cancelled))]
    Cancelled { reason: String },
}

impl SyncError {
    /// Classify a non-success HTTP status.
    pub fn from_status(status: u16, message: impl Into<String>) -> Self {
        let message = message.into();
        match status {
            408 | 429 => SyncError::TransientNetwork {
                message: format!("{}: {}", status, message),
            },
            400..=499 => SyncError::ServerRejection4xx { status, message },
            _ => SyncError::ServerRejection5xx { status, message },
        }
    }

    /// Worth retrying later with backoff.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            SyncError::TransientNetwork { .. }
                | SyncError::ServerRejection5xx { .. }
                | SyncError::ChannelTimeout { .. }
        )
    }

    /// Will fail the same way on every retry.
    pub fn is_permanent(&self) -> bool {
        matches!(
            self,
            SyncError::ServerRejection4xx { .. } | SyncError::MaxRetriesExceeded { .. }
        )
    }
}

pub type SyncResult<T> = Result<T, SyncError>;
