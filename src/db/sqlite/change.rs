//! SQLite ChangeRepository implementation.

use chrono::{DateTime, Utc};
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};

use crate::db::utils::{parse_column, parse_json_column};
use crate::db::{
    ChangeMethod, ChangeRepository, ChangeStatus, ChangeTarget, DbError, DbResult, PendingChange,
};

const COLUMNS: &str = "id, seq, resource, method, payload, enqueued_at, attempts, status, last_error, force_overwrite";

/// SQLx-backed queue storage.
pub struct SqliteChangeRepository<'a> {
    pub(crate) pool: &'a SqlitePool,
}

fn row_to_change(row: &SqliteRow) -> DbResult<PendingChange> {
    let method: String = row.try_get("method")?;
    let status: String = row.try_get("status")?;
    let payload: String = row.try_get("payload")?;
    let enqueued_at: DateTime<Utc> = row.try_get("enqueued_at")?;
    let attempts: i64 = row.try_get("attempts")?;

    Ok(PendingChange {
        id: row.try_get("id")?,
        target: ChangeTarget {
            resource: row.try_get("resource")?,
            method: parse_column::<ChangeMethod>("method", &method)?,
        },
        payload: parse_json_column("payload", &payload)?,
        enqueued_at,
        attempts: u32::try_from(attempts).unwrap_or(0),
        status: parse_column::<ChangeStatus>("status", &status)?,
        seq: row.try_get("seq")?,
        last_error: row.try_get("last_error")?,
        force: row.try_get::<bool, _>("force_overwrite")?,
    })
}

impl<'a> ChangeRepository for SqliteChangeRepository<'a> {
    async fn insert(&self, change: &PendingChange) -> DbResult<()> {
        sqlx::query(
            r#"
            INSERT INTO pending_change
                (id, seq, resource, method, payload, enqueued_at, attempts, status, last_error, force_overwrite)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&change.id)
        .bind(change.seq)
        .bind(&change.target.resource)
        .bind(change.target.method.to_string())
        .bind(change.payload.to_string())
        .bind(change.enqueued_at)
        .bind(i64::from(change.attempts))
        .bind(change.status.to_string())
        .bind(&change.last_error)
        .bind(change.force)
        .execute(self.pool)
        .await?;

        Ok(())
    }

    async fn update(&self, change: &PendingChange) -> DbResult<()> {
        let result = sqlx::query(
            r#"
            UPDATE pending_change
            SET seq = ?, resource = ?, method = ?, payload = ?, enqueued_at = ?,
                attempts = ?, status = ?, last_error = ?, force_overwrite = ?
            WHERE id = ?
            "#,
        )
        .bind(change.seq)
        .bind(&change.target.resource)
        .bind(change.target.method.to_string())
        .bind(change.payload.to_string())
        .bind(change.enqueued_at)
        .bind(i64::from(change.attempts))
        .bind(change.status.to_string())
        .bind(&change.last_error)
        .bind(change.force)
        .bind(&change.id)
        .execute(self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(DbError::NotFound {
                entity_type: "PendingChange".to_string(),
                id: change.id.clone(),
            });
        }

        Ok(())
    }

    async fn get(&self, id: &str) -> DbResult<PendingChange> {
        let sql = format!("SELECT {} FROM pending_change WHERE id = ?", COLUMNS);
        let row = sqlx::query(&sql).bind(id).fetch_optional(self.pool).await?;

        match row {
            Some(row) => row_to_change(&row),
            None => Err(DbError::NotFound {
                entity_type: "PendingChange".to_string(),
                id: id.to_string(),
            }),
        }
    }

    async fn find_pending(&self, target: &ChangeTarget) -> DbResult<Option<PendingChange>> {
        let sql = format!(
            "SELECT {} FROM pending_change
             WHERE resource = ? AND method = ? AND status = 'pending'
             ORDER BY seq DESC LIMIT 1",
            COLUMNS
        );
        let row = sqlx::query(&sql)
            .bind(&target.resource)
            .bind(target.method.to_string())
            .fetch_optional(self.pool)
            .await?;

        row.as_ref().map(row_to_change).transpose()
    }

    async fn list(&self) -> DbResult<Vec<PendingChange>> {
        let sql = format!(
            "SELECT {} FROM pending_change ORDER BY seq ASC, enqueued_at ASC",
            COLUMNS
        );
        let rows = sqlx::query(&sql).fetch_all(self.pool).await?;

        rows.iter().map(row_to_change).collect()
    }

    async fn delete(&self, id: &str) -> DbResult<bool> {
        let result = sqlx::query("DELETE FROM pending_change WHERE id = ?")
            .bind(id)
            .execute(self.pool)
            .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn next_seq(&self) -> DbResult<i64> {
        let max: Option<i64> = sqlx::query_scalar("SELECT MAX(seq) FROM pending_change")
            .fetch_one(self.pool)
            .await?;

        Ok(max.unwrap_or(0) + 1)
    }

    async fn reset_in_flight(&self) -> DbResult<u64> {
        let result = sqlx::query(
            "UPDATE pending_change SET status = 'pending' WHERE status = 'in_flight'",
        )
        .execute(self.pool)
        .await?;

        Ok(result.rows_affected())
    }
}
