//! Run the sync engine in the foreground.

use std::path::Path;
use std::time::Duration;

use tokio::time::timeout;
use tracing::info;

use crate::cli::commands::history::describe_outcome;
use crate::cli::error::CliResult;
use crate::cli::utils::format_time;
use crate::config::Config;
use crate::db::Database;
use crate::sync::{SyncEngine, SyncHandle, SyncStatus};

#[derive(Debug, Clone, Copy)]
pub struct RunOptions {
    /// Open the realtime channel for server-initiated syncs.
    pub realtime: bool,
    /// Exit after the first finished flush cycle.
    pub once: bool,
    /// How long `once` waits for a cycle to finish.
    pub timeout: Duration,
}

impl Default for RunOptions {
    fn default() -> Self {
        Self {
            realtime: true,
            once: false,
            timeout: Duration::from_secs(60),
        }
    }
}

pub async fn run(config: Config, options: RunOptions) -> CliResult<String> {
    ensure_parent_dir(&config.db_path)?;
    let engine = SyncEngine::open(config).await?;
    let handle = if options.realtime {
        engine.start_online().await?
    } else {
        engine.start().await?
    };
    drive(&handle, options).await
}

/// Block until done according to `options`, then shut the engine down.
pub async fn drive<D: Database>(handle: &SyncHandle<D>, options: RunOptions) -> CliResult<String> {
    let note = if options.once {
        wait_for_cycle(handle, options.timeout).await
    } else {
        follow(handle).await?;
        None
    };

    handle.shutdown().await;
    let mut output = summary(&handle.status());
    if let Some(note) = note {
        output.push_str(&format!("\n{}", note));
    }
    Ok(output)
}

async fn wait_for_cycle<D: Database>(handle: &SyncHandle<D>, limit: Duration) -> Option<String> {
    let mut rx = handle.subscribe();
    let finished = timeout(
        limit,
        rx.wait_for(|s| s.last_session.is_some() && !s.in_progress),
    )
    .await;
    match finished {
        Ok(Ok(_)) => None,
        _ => Some(format!(
            "ℹ No sync finished within {}s; changes stay queued",
            limit.as_secs()
        )),
    }
}

/// Log state changes until Ctrl-C.
async fn follow<D: Database>(handle: &SyncHandle<D>) -> CliResult<()> {
    let mut rx = handle.subscribe();
    let mut last = rx.borrow().clone();
    info!("Sync running; press Ctrl-C to stop");

    loop {
        tokio::select! {
            result = tokio::signal::ctrl_c() => {
                result?;
                info!("Stopping");
                return Ok(());
            }
            changed = rx.changed() => {
                if changed.is_err() {
                    return Ok(());
                }
                let current = rx.borrow_and_update().clone();
                if current.connection != last.connection {
                    info!(connection = %current.connection, "Connection changed");
                }
                if current.channel != last.channel {
                    info!(channel = %current.channel, "Realtime channel changed");
                }
                if current.pending_count() != last.pending_count() {
                    info!(pending = current.pending_count(), "Queue changed");
                }
                last = current;
            }
        }
    }
}

pub(crate) fn summary(status: &SyncStatus) -> String {
    let q = &status.queue;
    let mut out = format!(
        "Queue: {} pending, {} failed, {} need attention\nLast sync: {}",
        q.outstanding(),
        q.failed,
        q.needs_attention,
        format_time(status.last_sync)
    );
    if let Some(session) = &status.last_session {
        out.push_str(&format!(
            "\nLast cycle: {} ({} sent, {} ok, {} conflicts, {} failed)",
            describe_outcome(&session.outcome),
            session.attempted,
            session.succeeded,
            session.conflicted,
            session.failed
        ));
    }
    if let Some(error) = &status.last_error {
        out.push_str(&format!("\nLast error: {}", error));
    }
    out
}

fn ensure_parent_dir(path: &Path) -> std::io::Result<()> {
    match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => std::fs::create_dir_all(parent),
        _ => Ok(()),
    }
}
