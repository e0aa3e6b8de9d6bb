//! SQLite SessionRepository implementation.

use sqlx::{Row, SqlitePool};

use crate::db::{DbError, DbResult, SessionOutcome, SessionRepository, SyncSession};

/// SQLx-backed flush history.
pub struct SqliteSessionRepository<'a> {
    pub(crate) pool: &'a SqlitePool,
}

impl<'a> SessionRepository for SqliteSessionRepository<'a> {
    async fn record(&self, session: &SyncSession) -> DbResult<()> {
        let outcome = serde_json::to_string(&session.outcome).map_err(|e| DbError::Database {
            message: format!("Failed to serialize outcome: {}", e),
        })?;

        sqlx::query(
            r#"
            INSERT INTO sync_session
                (id, started_at, finished_at, attempted, succeeded, conflicted, failed, outcome, server_message)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(id) DO UPDATE SET
                finished_at = excluded.finished_at,
                attempted = excluded.attempted,
                succeeded = excluded.succeeded,
                conflicted = excluded.conflicted,
                failed = excluded.failed,
                outcome = excluded.outcome,
                server_message = excluded.server_message
            "#,
        )
        .bind(&session.id)
        .bind(session.started_at)
        .bind(session.finished_at)
        .bind(session.attempted as i64)
        .bind(session.succeeded as i64)
        .bind(session.conflicted as i64)
        .bind(session.failed as i64)
        .bind(outcome)
        .bind(&session.server_message)
        .execute(self.pool)
        .await?;

        Ok(())
    }

    async fn recent(&self, limit: usize) -> DbResult<Vec<SyncSession>> {
        let rows = sqlx::query(
            "SELECT id, started_at, finished_at, attempted, succeeded, conflicted, failed, outcome, server_message
             FROM sync_session ORDER BY started_at DESC LIMIT ?",
        )
        .bind(limit as i64)
        .fetch_all(self.pool)
        .await?;

        rows.into_iter()
            .map(|row| {
                let outcome_json: String = row.try_get("outcome")?;
                let outcome: SessionOutcome =
                    serde_json::from_str(&outcome_json).map_err(|e| DbError::InvalidData {
                        message: format!("Invalid session outcome: {}", e),
                    })?;

                Ok(SyncSession {
                    id: row.try_get("id")?,
                    started_at: row.try_get("started_at")?,
                    finished_at: row.try_get("finished_at")?,
                    attempted: row.try_get::<i64, _>("attempted")? as usize,
                    succeeded: row.try_get::<i64, _>("succeeded")? as usize,
                    conflicted: row.try_get::<i64, _>("conflicted")? as usize,
                    failed: row.try_get::<i64, _>("failed")? as usize,
                    outcome,
                    server_message: row.try_get("server_message")?,
                })
            })
            .collect()
    }
}
