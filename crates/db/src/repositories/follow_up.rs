use chrono::{DateTime, Utc};
use sqlx::{sqlite::SqliteRow, Row};

use parley_core::domain::follow_up::{FollowUpId, ScheduledFollowUp};
use parley_core::domain::thread::ThreadId;

use super::codec::{
    encode_optional_timestamp, encode_timestamp, parse_optional_timestamp, parse_timestamp,
};
use super::{FollowUpRepository, RepositoryError};
use crate::DbPool;

const FOLLOW_UP_COLUMNS: &str = "id, thread_id, due_at, cancelled_at, fired_at, created_at";

pub struct SqlFollowUpRepository {
    pool: DbPool,
}

impl SqlFollowUpRepository {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }
}

#[async_trait::async_trait]
impl FollowUpRepository for SqlFollowUpRepository {
    async fn schedule_if_absent(
        &self,
        candidate: ScheduledFollowUp,
    ) -> Result<ScheduledFollowUp, RepositoryError> {
        // The partial unique index on active rows turns a second insert into a no-op.
        sqlx::query(
            "INSERT INTO scheduled_follow_up (
                id,
                thread_id,
                due_at,
                cancelled_at,
                fired_at,
                created_at
             ) VALUES (?, ?, ?, ?, ?, ?)
             ON CONFLICT DO NOTHING",
        )
        .bind(&candidate.id.0)
        .bind(&candidate.thread_id.0)
        .bind(encode_timestamp(candidate.due_at))
        .bind(encode_optional_timestamp(candidate.cancelled_at))
        .bind(encode_optional_timestamp(candidate.fired_at))
        .bind(encode_timestamp(candidate.created_at))
        .execute(&self.pool)
        .await?;

        self.find_active(&candidate.thread_id).await?.ok_or_else(|| {
            RepositoryError::Conflict(format!(
                "follow-up {} for thread {} was not stored",
                candidate.id.0, candidate.thread_id
            ))
        })
    }

    async fn find_by_id(
        &self,
        id: &FollowUpId,
    ) -> Result<Option<ScheduledFollowUp>, RepositoryError> {
        let row = sqlx::query(&format!(
            "SELECT {FOLLOW_UP_COLUMNS} FROM scheduled_follow_up WHERE id = ?"
        ))
        .bind(&id.0)
        .fetch_optional(&self.pool)
        .await?;

        row.map(follow_up_from_row).transpose()
    }

    async fn find_active(
        &self,
        thread_id: &ThreadId,
    ) -> Result<Option<ScheduledFollowUp>, RepositoryError> {
        let row = sqlx::query(&format!(
            "SELECT {FOLLOW_UP_COLUMNS} FROM scheduled_follow_up
             WHERE thread_id = ? AND cancelled_at IS NULL AND fired_at IS NULL"
        ))
        .bind(&thread_id.0)
        .fetch_optional(&self.pool)
        .await?;

        row.map(follow_up_from_row).transpose()
    }

    async fn cancel_active(
        &self,
        thread_id: &ThreadId,
        now: DateTime<Utc>,
    ) -> Result<bool, RepositoryError> {
        let result = sqlx::query(
            "UPDATE scheduled_follow_up
             SET cancelled_at = ?
             WHERE thread_id = ? AND cancelled_at IS NULL AND fired_at IS NULL",
        )
        .bind(encode_timestamp(now))
        .bind(&thread_id.0)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn list_due(
        &self,
        now: DateTime<Utc>,
        limit: u32,
    ) -> Result<Vec<ScheduledFollowUp>, RepositoryError> {
        let rows = sqlx::query(&format!(
            "SELECT {FOLLOW_UP_COLUMNS} FROM scheduled_follow_up
             WHERE cancelled_at IS NULL AND fired_at IS NULL AND due_at <= ?
             ORDER BY due_at ASC, id ASC
             LIMIT ?"
        ))
        .bind(encode_timestamp(now))
        .bind(i64::from(limit))
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(follow_up_from_row).collect()
    }

    async fn mark_fired(&self, id: &FollowUpId, now: DateTime<Utc>) -> Result<bool, RepositoryError> {
        let result = sqlx::query(
            "UPDATE scheduled_follow_up
             SET fired_at = ?
             WHERE id = ? AND cancelled_at IS NULL AND fired_at IS NULL",
        )
        .bind(encode_timestamp(now))
        .bind(&id.0)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }
}

fn follow_up_from_row(row: SqliteRow) -> Result<ScheduledFollowUp, RepositoryError> {
    Ok(ScheduledFollowUp {
        id: FollowUpId(row.try_get("id")?),
        thread_id: ThreadId(row.try_get("thread_id")?),
        due_at: parse_timestamp("due_at", row.try_get("due_at")?)?,
        cancelled_at: parse_optional_timestamp("cancelled_at", row.try_get("cancelled_at")?)?,
        fired_at: parse_optional_timestamp("fired_at", row.try_get("fired_at")?)?,
        created_at: parse_timestamp("created_at", row.try_get("created_at")?)?,
    })
}
