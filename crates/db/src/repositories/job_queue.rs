use chrono::{DateTime, Utc};
use sqlx::{sqlite::SqliteRow, Row};

use parley_core::domain::follow_up::FollowUpId;
use parley_core::domain::job::{CycleJob, CycleJobId, JobKind, JobState, JobTransition};
use parley_core::domain::thread::{ThreadId, ThreadStage};

use super::codec::{
    encode_optional_timestamp, encode_timestamp, parse_enum, parse_optional_timestamp,
    parse_timestamp, parse_u32,
};
use super::{EnqueueOutcome, JobQueueRepository, RepositoryError};
use crate::DbPool;

const JOB_COLUMNS: &str = "id,
    thread_id,
    kind,
    expected_stage,
    follow_up_id,
    state,
    retry_count,
    max_retries,
    available_at,
    claimed_by,
    claimed_at,
    last_error,
    correlation_id,
    state_version,
    created_at,
    updated_at";

pub struct SqlJobQueueRepository {
    pool: DbPool,
}

impl SqlJobQueueRepository {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    async fn find_pending(
        &self,
        thread_id: &ThreadId,
        kind: JobKind,
    ) -> Result<Option<CycleJob>, RepositoryError> {
        let row = sqlx::query(&format!(
            "SELECT {JOB_COLUMNS} FROM cycle_job
             WHERE thread_id = ? AND kind = ?
               AND state IN ('queued', 'running', 'retryable_failed')"
        ))
        .bind(&thread_id.0)
        .bind(kind.as_str())
        .fetch_optional(&self.pool)
        .await?;

        row.map(job_from_row).transpose()
    }
}

#[async_trait::async_trait]
impl JobQueueRepository for SqlJobQueueRepository {
    async fn find_by_id(&self, id: &CycleJobId) -> Result<Option<CycleJob>, RepositoryError> {
        let row = sqlx::query(&format!("SELECT {JOB_COLUMNS} FROM cycle_job WHERE id = ?"))
            .bind(&id.0)
            .fetch_optional(&self.pool)
            .await?;

        row.map(job_from_row).transpose()
    }

    async fn enqueue(&self, job: CycleJob) -> Result<EnqueueOutcome, RepositoryError> {
        let result = sqlx::query(
            "INSERT INTO cycle_job (
                id,
                thread_id,
                kind,
                expected_stage,
                follow_up_id,
                state,
                retry_count,
                max_retries,
                available_at,
                claimed_by,
                claimed_at,
                last_error,
                correlation_id,
                state_version,
                created_at,
                updated_at
             ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
             ON CONFLICT DO NOTHING",
        )
        .bind(&job.id.0)
        .bind(&job.thread_id.0)
        .bind(job.kind.as_str())
        .bind(job.expected_stage.as_str())
        .bind(job.follow_up_id.as_ref().map(|id| id.0.as_str()))
        .bind(job.state.as_str())
        .bind(i64::from(job.retry_count))
        .bind(i64::from(job.max_retries))
        .bind(encode_timestamp(job.available_at))
        .bind(job.claimed_by.as_deref())
        .bind(encode_optional_timestamp(job.claimed_at))
        .bind(job.last_error.as_deref())
        .bind(&job.correlation_id)
        .bind(i64::from(job.state_version))
        .bind(encode_timestamp(job.created_at))
        .bind(encode_timestamp(job.updated_at))
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 1 {
            return Ok(EnqueueOutcome::Enqueued(job));
        }

        match self.find_pending(&job.thread_id, job.kind).await? {
            Some(existing) => Ok(EnqueueOutcome::AlreadyPending(existing)),
            None => Err(RepositoryError::Conflict(format!("cycle job {} already exists", job.id.0))),
        }
    }

    async fn list_claimable(
        &self,
        now: DateTime<Utc>,
        limit: u32,
    ) -> Result<Vec<CycleJob>, RepositoryError> {
        let rows = sqlx::query(&format!(
            "SELECT {JOB_COLUMNS} FROM cycle_job
             WHERE state IN ('queued', 'retryable_failed') AND available_at <= ?
             ORDER BY available_at ASC, created_at ASC
             LIMIT ?"
        ))
        .bind(encode_timestamp(now))
        .bind(i64::from(limit))
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(job_from_row).collect()
    }

    async fn list_running(&self) -> Result<Vec<CycleJob>, RepositoryError> {
        let rows = sqlx::query(&format!(
            "SELECT {JOB_COLUMNS} FROM cycle_job
             WHERE state = 'running'
             ORDER BY claimed_at ASC"
        ))
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(job_from_row).collect()
    }

    async fn list_for_thread(&self, thread_id: &ThreadId) -> Result<Vec<CycleJob>, RepositoryError> {
        let rows = sqlx::query(&format!(
            "SELECT {JOB_COLUMNS} FROM cycle_job
             WHERE thread_id = ?
             ORDER BY created_at ASC, id ASC"
        ))
        .bind(&thread_id.0)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(job_from_row).collect()
    }

    async fn save_if_version(
        &self,
        job: CycleJob,
        expected_version: u32,
    ) -> Result<bool, RepositoryError> {
        let result = sqlx::query(
            "UPDATE cycle_job SET
                expected_stage = ?,
                state = ?,
                retry_count = ?,
                max_retries = ?,
                available_at = ?,
                claimed_by = ?,
                claimed_at = ?,
                last_error = ?,
                state_version = ?,
                updated_at = ?
             WHERE id = ? AND state_version = ?",
        )
        .bind(job.expected_stage.as_str())
        .bind(job.state.as_str())
        .bind(i64::from(job.retry_count))
        .bind(i64::from(job.max_retries))
        .bind(encode_timestamp(job.available_at))
        .bind(job.claimed_by.as_deref())
        .bind(encode_optional_timestamp(job.claimed_at))
        .bind(job.last_error.as_deref())
        .bind(i64::from(job.state_version))
        .bind(encode_timestamp(job.updated_at))
        .bind(&job.id.0)
        .bind(i64::from(expected_version))
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    async fn append_transition(&self, transition: JobTransition) -> Result<(), RepositoryError> {
        sqlx::query(
            "INSERT INTO cycle_job_transition (
                job_id,
                thread_id,
                from_state,
                to_state,
                reason,
                error_class,
                context_json,
                correlation_id,
                state_version,
                occurred_at
             ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&transition.job_id.0)
        .bind(&transition.thread_id.0)
        .bind(transition.from_state.as_ref().map(JobState::as_str))
        .bind(transition.to_state.as_str())
        .bind(&transition.reason)
        .bind(transition.error_class.as_deref())
        .bind(&transition.context_json)
        .bind(&transition.correlation_id)
        .bind(i64::from(transition.state_version))
        .bind(encode_timestamp(transition.occurred_at))
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn list_transitions(
        &self,
        job_id: &CycleJobId,
    ) -> Result<Vec<JobTransition>, RepositoryError> {
        let rows = sqlx::query(
            "SELECT
                job_id,
                thread_id,
                from_state,
                to_state,
                reason,
                error_class,
                context_json,
                correlation_id,
                state_version,
                occurred_at
             FROM cycle_job_transition
             WHERE job_id = ?
             ORDER BY id ASC",
        )
        .bind(&job_id.0)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(transition_from_row).collect()
    }
}

fn job_from_row(row: SqliteRow) -> Result<CycleJob, RepositoryError> {
    Ok(CycleJob {
        id: CycleJobId(row.try_get("id")?),
        thread_id: ThreadId(row.try_get("thread_id")?),
        kind: parse_enum("job kind", row.try_get("kind")?, JobKind::parse)?,
        expected_stage: parse_enum(
            "expected stage",
            row.try_get("expected_stage")?,
            ThreadStage::parse,
        )?,
        follow_up_id: row.try_get::<Option<String>, _>("follow_up_id")?.map(FollowUpId),
        state: parse_enum("job state", row.try_get("state")?, JobState::parse)?,
        retry_count: parse_u32("retry_count", row.try_get("retry_count")?)?,
        max_retries: parse_u32("max_retries", row.try_get("max_retries")?)?,
        available_at: parse_timestamp("available_at", row.try_get("available_at")?)?,
        claimed_by: row.try_get("claimed_by")?,
        claimed_at: parse_optional_timestamp("claimed_at", row.try_get("claimed_at")?)?,
        last_error: row.try_get("last_error")?,
        correlation_id: row.try_get("correlation_id")?,
        state_version: parse_u32("state_version", row.try_get("state_version")?)?,
        created_at: parse_timestamp("created_at", row.try_get("created_at")?)?,
        updated_at: parse_timestamp("updated_at", row.try_get("updated_at")?)?,
    })
}

fn transition_from_row(row: SqliteRow) -> Result<JobTransition, RepositoryError> {
    let from_state = row
        .try_get::<Option<String>, _>("from_state")?
        .map(|value| parse_enum("from_state", value, JobState::parse))
        .transpose()?;

    Ok(JobTransition {
        job_id: CycleJobId(row.try_get("job_id")?),
        thread_id: ThreadId(row.try_get("thread_id")?),
        from_state,
        to_state: parse_enum("to_state", row.try_get("to_state")?, JobState::parse)?,
        reason: row.try_get("reason")?,
        error_class: row.try_get("error_class")?,
        context_json: row.try_get("context_json")?,
        correlation_id: row.try_get("correlation_id")?,
        state_version: parse_u32("state_version", row.try_get("state_version")?)?,
        occurred_at: parse_timestamp("occurred_at", row.try_get("occurred_at")?)?,
    })
}
