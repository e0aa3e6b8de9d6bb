//! Conflict resolution between a queued local change and the server's copy.
//!
//! The strategy is configured once per engine. Resolving never talks to the
//! server; it only decides what the orchestrator does next.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::db::{ChangeMethod, ChangeTarget, PendingChange};

/// Policy applied when local and server state diverged.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictStrategy {
    /// Discard the local change.
    #[default]
    ServerWins,
    /// Overwrite the server unconditionally.
    ClientWins,
    /// Later timestamp wins; ties go to the server.
    NewestWins,
    /// Hold the change until a person decides.
    ManualResolution,
}

impl std::fmt::Display for ConflictStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ConflictStrategy::ServerWins => "server_wins",
            ConflictStrategy::ClientWins => "client_wins",
            ConflictStrategy::NewestWins => "newest_wins",
            ConflictStrategy::ManualResolution => "manual",
        };
        write!(f, "{}", s)
    }
}

impl std::str::FromStr for ConflictStrategy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().replace('-', "_").as_str() {
            "server_wins" | "server" => Ok(ConflictStrategy::ServerWins),
            "client_wins" | "client" => Ok(ConflictStrategy::ClientWins),
            "newest_wins" | "newest" => Ok(ConflictStrategy::NewestWins),
            "manual" | "manual_resolution" => Ok(ConflictStrategy::ManualResolution),
            _ => Err(format!("Invalid ConflictStrategy: {}", s)),
        }
    }
}

/// The server's view of an entity, as returned with a conflict response.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ServerVersion {
    #[serde(default)]
    pub current: Option<Value>,
    #[serde(default)]
    pub updated_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub deleted: bool,
}

impl ServerVersion {
    /// The entity no longer exists server-side.
    pub fn deleted() -> Self {
        Self {
            current: None,
            updated_at: None,
            deleted: true,
        }
    }
}

/// What to do with a conflicting change.
#[derive(Debug, Clone, PartialEq)]
pub enum Resolution {
    /// Submit again with the force flag, overwriting server state.
    Resubmit {
        target: ChangeTarget,
        payload: Value,
    },
    /// Drop the local change; the server copy stands.
    Discard,
    /// Park the change for manual resolution.
    Hold { reason: String },
}

/// Applies the configured [`ConflictStrategy`].
#[derive(Debug, Clone, Copy)]
pub struct ConflictResolver {
    strategy: ConflictStrategy,
}

impl ConflictResolver {
    pub fn new(strategy: ConflictStrategy) -> Self {
        Self { strategy }
    }

    pub fn strategy(&self) -> ConflictStrategy {
        self.strategy
    }

    pub fn resolve(&self, local: &PendingChange, server: &ServerVersion) -> Resolution {
        // Both sides want the entity gone: nothing diverges.
        if local.target.method == ChangeMethod::Delete && server.deleted {
            return Resolution::Discard;
        }

        match self.strategy {
            ConflictStrategy::ServerWins => Resolution::Discard,
            ConflictStrategy::ClientWins => client_wins(local, server),
            ConflictStrategy::NewestWins => match server.updated_at {
                Some(server_ts) if local.enqueued_at > server_ts => client_wins(local, server),
                _ => Resolution::Discard,
            },
            ConflictStrategy::ManualResolution => Resolution::Hold {
                reason: describe(local, server),
            },
        }
    }
}

fn client_wins(local: &PendingChange, server: &ServerVersion) -> Resolution {
    let payload = match local.target.method {
        ChangeMethod::Update if !server.deleted => {
            merge_payload(server.current.as_ref(), &local.payload)
        }
        _ => local.payload.clone(),
    };

    Resolution::Resubmit {
        target: local.target.clone(),
        payload,
    }
}

/// Overlay the local field set on the server's current fields.
///
/// Non-object values are not merged; the local value is taken as is.
pub fn merge_payload(server: Option<&Value>, local: &Value) -> Value {
    match (server, local) {
        (Some(Value::Object(server_fields)), Value::Object(local_fields)) => {
            let mut merged = server_fields.clone();
            for (key, value) in local_fields {
                merged.insert(key.clone(), value.clone());
            }
            Value::Object(merged)
        }
        _ => local.clone(),
    }
}

fn describe(local: &PendingChange, server: &ServerVersion) -> String {
    let server_side = if server.deleted {
        "deleted on the server".to_string()
    } else {
        match server.updated_at {
            Some(ts) => format!("modified on the server at {}", ts.to_rfc3339()),
            None => "modified on the server".to_string(),
        }
    };
    format!(
        "local {} queued at {} conflicts: entity {}",
        local.target,
        local.enqueued_at.to_rfc3339(),
        server_side
    )
}
