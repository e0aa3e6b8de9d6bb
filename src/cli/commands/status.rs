//! One-shot status: local queue, last sync, and what the server reports.

use serde::Serialize;
use tabled::{Table, Tabled};

use crate::api::{ConnectionStatus, RemoteSyncStatus, SyncServer};
use crate::cli::commands::history::describe_outcome;
use crate::cli::error::CliResult;
use crate::cli::utils::{apply_table_style, format_time};
use crate::db::{Database, QueueCounts, SessionRepository, SyncSession};
use crate::sync::PendingChangeQueue;

#[derive(Debug, Serialize)]
pub(crate) struct StatusReport {
    pub(crate) queue: QueueCounts,
    pub(crate) last_session: Option<SyncSession>,
    pub(crate) server: ServerReport,
}

#[derive(Debug, Serialize)]
pub(crate) struct ServerReport {
    pub(crate) reachable: bool,
    pub(crate) connection: Option<ConnectionStatus>,
    pub(crate) sync: Option<RemoteSyncStatus>,
    pub(crate) error: Option<String>,
}

#[derive(Tabled)]
struct Row {
    #[tabled(rename = "Field")]
    field: &'static str,
    #[tabled(rename = "Value")]
    value: String,
}

fn row(field: &'static str, value: impl Into<String>) -> Row {
    Row {
        field,
        value: value.into(),
    }
}

pub(crate) async fn server_report<S: SyncServer>(server: &S) -> ServerReport {
    let connection = match server.connection_status().await {
        Ok(status) => status,
        Err(e) => {
            return ServerReport {
                reachable: false,
                connection: None,
                sync: None,
                error: Some(e.to_string()),
            };
        }
    };

    let (sync, error) = match server.sync_status().await {
        Ok(sync) => (Some(sync), None),
        Err(e) => (None, Some(e.to_string())),
    };
    ServerReport {
        reachable: true,
        connection: Some(connection),
        sync,
        error,
    }
}

/// Show local and remote sync status.
pub async fn show<D: Database, S: SyncServer>(
    db: &D,
    queue: &PendingChangeQueue<D>,
    server: &S,
    format: &str,
) -> CliResult<String> {
    let report = StatusReport {
        queue: queue.counts().await?,
        last_session: db.sessions().recent(1).await?.into_iter().next(),
        server: server_report(server).await,
    };

    match format {
        "json" => Ok(serde_json::to_string_pretty(&report)?),
        _ => Ok(format_table(&report)),
    }
}

pub(crate) fn format_table(report: &StatusReport) -> String {
    let q = &report.queue;
    let mut rows = vec![
        row("Pending", q.pending.to_string()),
        row("In flight", q.in_flight.to_string()),
        row("Failed", q.failed.to_string()),
        row("Needs attention", q.needs_attention.to_string()),
    ];

    match &report.last_session {
        Some(session) => {
            rows.push(row("Last sync", format_time(session.finished_at)));
            rows.push(row("Last outcome", describe_outcome(&session.outcome)));
        }
        None => rows.push(row("Last sync", "never")),
    }

    let server = &report.server;
    let connection = match &server.connection {
        Some(c) if c.is_connected() => "connected".to_string(),
        Some(c) if c.offline_mode => format!("{} (offline mode)", c.status),
        Some(c) => c.status.clone(),
        None => "unreachable".to_string(),
    };
    rows.push(row("Server", connection));
    if let Some(sync) = &server.sync {
        rows.push(row("Server last sync", format_time(sync.last_sync)));
        rows.push(row("Server pending", sync.pending_sync.total.to_string()));
    }
    if let Some(error) = &server.error {
        rows.push(row("Server error", error.clone()));
    }

    let mut table = Table::new(rows);
    apply_table_style(&mut table);
    table.to_string()
}
