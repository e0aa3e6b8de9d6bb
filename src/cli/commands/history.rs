//! Recent flush cycles.

use tabled::{Table, Tabled};

use crate::cli::error::CliResult;
use crate::cli::utils::{apply_table_style, format_time, truncate_with_ellipsis};
use crate::db::{Database, SessionOutcome, SessionRepository, SyncSession};

#[derive(Tabled)]
pub(crate) struct SessionDisplay {
    #[tabled(rename = "Started")]
    pub(crate) started: String,
    #[tabled(rename = "Outcome")]
    pub(crate) outcome: String,
    #[tabled(rename = "Sent")]
    pub(crate) attempted: usize,
    #[tabled(rename = "OK")]
    pub(crate) succeeded: usize,
    #[tabled(rename = "Conflicts")]
    pub(crate) conflicted: usize,
    #[tabled(rename = "Failed")]
    pub(crate) failed: usize,
    #[tabled(rename = "Server")]
    pub(crate) server_message: String,
}

pub(crate) fn describe_outcome(outcome: &SessionOutcome) -> String {
    match outcome {
        SessionOutcome::Completed => "completed".to_string(),
        SessionOutcome::Interrupted(why) => format!("interrupted: {}", why),
        SessionOutcome::Aborted(why) => format!("aborted: {}", why),
        SessionOutcome::Failed(why) => format!("failed: {}", why),
    }
}

impl From<&SyncSession> for SessionDisplay {
    fn from(session: &SyncSession) -> Self {
        Self {
            started: format_time(Some(session.started_at)),
            outcome: truncate_with_ellipsis(&describe_outcome(&session.outcome), 40),
            attempted: session.attempted,
            succeeded: session.succeeded,
            conflicted: session.conflicted,
            failed: session.failed,
            server_message: session
                .server_message
                .as_deref()
                .map(|m| truncate_with_ellipsis(m, 30))
                .unwrap_or_else(|| "-".to_string()),
        }
    }
}

/// Most recent sessions, newest first.
pub async fn list<D: Database>(db: &D, limit: usize, format: &str) -> CliResult<String> {
    let sessions = db.sessions().recent(limit).await?;

    match format {
        "json" => Ok(serde_json::to_string_pretty(&sessions)?),
        _ => Ok(format_table(&sessions)),
    }
}

pub(crate) fn format_table(sessions: &[SyncSession]) -> String {
    if sessions.is_empty() {
        return "No sync sessions recorded yet.".to_string();
    }

    let rows: Vec<SessionDisplay> = sessions.iter().map(|s| s.into()).collect();
    let mut table = Table::new(rows);
    apply_table_style(&mut table);
    table.to_string()
}
