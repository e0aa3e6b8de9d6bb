//! Inspect and edit the local pending-change queue.
//!
//! These commands work on the database directly and never talk to the
//! server; a running `msync run` picks the changes up on its next liveness probe.

use tabled::{Table, Tabled};

use crate::cli::error::{CliError, CliResult};
use crate::cli::utils::{apply_table_style, format_time, parse_payload, truncate_with_ellipsis};
use crate::db::{ChangeMethod, ChangeStatus, ChangeTarget, Database, PendingChange};
use crate::sync::{Keep, PendingChangeQueue};

#[derive(Tabled)]
pub(crate) struct ChangeDisplay {
    #[tabled(rename = "ID")]
    pub(crate) id: String,
    #[tabled(rename = "Target")]
    pub(crate) target: String,
    #[tabled(rename = "Status")]
    pub(crate) status: String,
    #[tabled(rename = "Attempts")]
    pub(crate) attempts: u32,
    #[tabled(rename = "Queued")]
    pub(crate) queued: String,
    #[tabled(rename = "Last error")]
    pub(crate) last_error: String,
}

impl From<&PendingChange> for ChangeDisplay {
    fn from(change: &PendingChange) -> Self {
        let mut target = change.target.to_string();
        if change.force {
            target.push_str(" (force)");
        }
        Self {
            id: change.id.clone(),
            target: truncate_with_ellipsis(&target, 48),
            status: change.status.to_string(),
            attempts: change.attempts,
            queued: format_time(Some(change.enqueued_at)),
            last_error: change
                .last_error
                .as_deref()
                .map(|e| truncate_with_ellipsis(e, 40))
                .unwrap_or_else(|| "-".to_string()),
        }
    }
}

/// List queued changes, optionally filtered by status.
pub async fn list<D: Database>(
    queue: &PendingChangeQueue<D>,
    status: Option<&str>,
    format: &str,
) -> CliResult<String> {
    let filter = status
        .map(|s| s.parse::<ChangeStatus>().map_err(|e| CliError::invalid("status", e)))
        .transpose()?;

    let changes: Vec<PendingChange> = queue
        .all()
        .await?
        .into_iter()
        .filter(|c| filter.is_none_or(|f| c.status == f))
        .collect();

    match format {
        "json" => Ok(serde_json::to_string_pretty(&changes)?),
        _ => Ok(format_table(&changes)),
    }
}

pub(crate) fn format_table(changes: &[PendingChange]) -> String {
    if changes.is_empty() {
        return "No queued changes.".to_string();
    }

    let rows: Vec<ChangeDisplay> = changes.iter().map(|c| c.into()).collect();
    let mut table = Table::new(rows);
    apply_table_style(&mut table);
    table.to_string()
}

/// Queue a change by hand.
pub async fn add<D: Database>(
    queue: &PendingChangeQueue<D>,
    method: &str,
    resource: &str,
    payload: Option<&str>,
) -> CliResult<String> {
    let method = method
        .parse::<ChangeMethod>()
        .map_err(|e| CliError::invalid("method", e))?;
    if !resource.starts_with('/') {
        return Err(CliError::invalid(
            "resource",
            format!("'{}' must be a path starting with '/'", resource),
        ));
    }
    let payload = parse_payload(payload)?;

    let before = queue.all().await?.len();
    let change = queue
        .enqueue(ChangeTarget::new(resource, method), payload)
        .await?;
    if queue.all().await?.len() == before {
        Ok(format!(
            "✓ Updated queued change {} ({})",
            change.id, change.target
        ))
    } else {
        Ok(format!("✓ Queued {} ({})", change.id, change.target))
    }
}

/// Give a failed or held change a fresh attempt budget.
pub async fn retry<D: Database>(queue: &PendingChangeQueue<D>, id: &str) -> CliResult<String> {
    let change = queue.retry(id).await?;
    Ok(format!("✓ Requeued {} ({})", change.id, change.target))
}

/// Drop a change without sending it.
pub async fn discard<D: Database>(queue: &PendingChangeQueue<D>, id: &str) -> CliResult<String> {
    if queue.discard(id).await? {
        Ok(format!("✓ Discarded {}", id))
    } else {
        Ok(format!("ℹ No queued change {}", id))
    }
}

/// Settle a held conflict.
pub async fn resolve<D: Database>(
    queue: &PendingChangeQueue<D>,
    id: &str,
    keep: &str,
) -> CliResult<String> {
    let keep = keep
        .parse::<Keep>()
        .map_err(|e| CliError::invalid("side", e))?;
    match queue.resolve(id, keep).await? {
        Some(change) => Ok(format!(
            "✓ Local change kept; {} will overwrite the server on the next sync",
            change.target
        )),
        None => Ok(format!("✓ Server version kept; discarded {}", id)),
    }
}
