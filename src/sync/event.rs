//! Events delivered to the orchestrator's control loop.

use serde::Serialize;

use super::connectivity::ConnectionState;

/// Why a flush was requested. Used for logging and backoff decisions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FlushReason {
    /// ConnectionState entered Online.
    Reconnected,
    /// The server sent a `sync` event over the realtime channel.
    ServerSignal,
    /// The realtime channel came back; signals may have been missed.
    ChannelRestored,
    LocalChange,
    Manual,
    /// A scheduled retry after a transient failure.
    Retry,
    /// Requests absorbed while the previous cycle was running.
    FollowUp,
    /// A confirming probe while online. Starts a cycle only if rows are pending,
    /// so changes queued by another process still go out.
    Sweep,
}

impl FlushReason {
    /// Whether this request may start a cycle before a scheduled retry is due.
    pub fn overrides_backoff(&self) -> bool {
        matches!(
            self,
            FlushReason::Reconnected | FlushReason::Manual | FlushReason::Retry
        )
    }
}

impl std::fmt::Display for FlushReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            FlushReason::Reconnected => "reconnected",
            FlushReason::ServerSignal => "server_signal",
            FlushReason::ChannelRestored => "channel_restored",
            FlushReason::LocalChange => "local_change",
            FlushReason::Manual => "manual",
            FlushReason::Retry => "retry",
            FlushReason::FollowUp => "follow_up",
            FlushReason::Sweep => "sweep",
        };
        write!(f, "{}", s)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncEvent {
    /// The connectivity monitor changed state.
    Connectivity(ConnectionState),
    FlushRequested(FlushReason),
    /// The realtime channel completed its handshake.
    ChannelUp,
    /// The realtime channel dropped; a running cycle must stop.
    ChannelDown,
}
