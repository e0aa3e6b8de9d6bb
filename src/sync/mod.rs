//! Offline-first synchronization engine.
//!
//! Local mutations go into a durable [`PendingChangeQueue`]. The
//! [`SyncOrchestrator`] drains it against the server whenever the
//! [`ConnectivityMonitor`] reports the server reachable or the
//! [`RealtimeChannel`] relays a server signal. Conflicts go through the
//! [`ConflictResolver`], and everything is observable via [`SyncStatusReporter`].

mod backoff;
mod clock;
mod conflict;
mod connectivity;
mod engine;
mod error;
mod event;
mod orchestrator;
mod paths;
mod queue;
pub mod realtime;
mod status;

#[cfg(test)]
mod queue_test;
#[cfg(test)]
pub(crate) mod testing;

pub use backoff::{Backoff, BackoffPolicy};
#[cfg(test)]
pub use clock::MockClock;
pub use clock::{Clock, SystemClock};
pub use conflict::{ConflictResolver, ConflictStrategy, Resolution, ServerVersion, merge_payload};
pub use connectivity::{
    ConnectionState, ConnectivityMonitor, MonitorConfig, NetworkHint, transition,
};
pub use engine::{SyncEngine, SyncHandle};
pub use error::{SyncError, SyncResult};
pub use event::{FlushReason, SyncEvent};
pub use orchestrator::{CycleReport, FlushConfig, Flusher, SyncOrchestrator};
pub use paths::{get_data_dir, get_db_path};
pub use queue::{Keep, PendingChangeQueue};
pub use realtime::{ChannelCommand, ChannelState, DisconnectReason, RealtimeChannel, RealtimeConfig};
pub use status::{SyncStatus, SyncStatusReporter};
