//! Deterministic state machine for the cycle job queue.
//!
//! Every transition returns the updated job plus a [`JobTransition`] record
//! so callers can persist both atomically.

use chrono::{DateTime, Duration, Utc};
use thiserror::Error;
use uuid::Uuid;

use crate::domain::follow_up::FollowUpId;
use crate::domain::job::{CycleJob, CycleJobId, JobKind, JobState, JobTransition};
use crate::domain::thread::{ThreadId, ThreadStage};

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct JobEngineConfig {
    /// How long before a claimed job is considered stale
    pub claim_timeout_seconds: i64,
    pub default_max_retries: u32,
    pub retry_backoff_multiplier: u32,
    pub retry_base_delay_seconds: i64,
}

impl Default for JobEngineConfig {
    fn default() -> Self {
        Self {
            claim_timeout_seconds: 300,
            default_max_retries: 3,
            retry_backoff_multiplier: 2,
            retry_base_delay_seconds: 5,
        }
    }
}

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum JobError {
    #[error("invalid job transition from {from:?} to {to:?}")]
    InvalidTransition { from: JobState, to: JobState },
    #[error("job {0} already claimed by {1}")]
    ClaimConflict(CycleJobId, String),
    #[error("job not yet available: {0}")]
    NotYetAvailable(CycleJobId),
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RetryPolicy {
    Retry,
    FailTerminal,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct JobStep {
    pub job: CycleJob,
    pub transition: JobTransition,
}

#[derive(Clone, Debug, Default)]
pub struct JobEngine {
    config: JobEngineConfig,
}

impl JobEngine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_config(config: JobEngineConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &JobEngineConfig {
        &self.config
    }

    pub fn create_job(
        &self,
        thread_id: ThreadId,
        kind: JobKind,
        expected_stage: ThreadStage,
        follow_up_id: Option<FollowUpId>,
        correlation_id: impl Into<String>,
        now: DateTime<Utc>,
    ) -> JobStep {
        let job = CycleJob {
            id: CycleJobId(Uuid::new_v4().to_string()),
            thread_id,
            kind,
            expected_stage,
            follow_up_id,
            state: JobState::Queued,
            retry_count: 0,
            max_retries: self.config.default_max_retries,
            available_at: now,
            claimed_by: None,
            claimed_at: None,
            last_error: None,
            correlation_id: correlation_id.into(),
            state_version: 1,
            created_at: now,
            updated_at: now,
        };
        let transition = record(
            &job,
            None,
            "job_enqueued",
            None,
            serde_json::json!({ "kind": kind.as_str(), "expected_stage": expected_stage.as_str() }),
            now,
        );
        JobStep { job, transition }
    }

    /// Queued|RetryableFailed -> Running. A running job whose claim has gone
    /// stale may be stolen.
    pub fn claim(
        &self,
        mut job: CycleJob,
        worker_id: impl Into<String>,
        now: DateTime<Utc>,
    ) -> Result<JobStep, JobError> {
        let worker_id = worker_id.into();
        match job.state {
            JobState::Queued | JobState::RetryableFailed => {}
            JobState::Running => {
                if let Some(claimed_at) = job.claimed_at {
                    if now < claimed_at + Duration::seconds(self.config.claim_timeout_seconds) {
                        return Err(JobError::ClaimConflict(
                            job.id.clone(),
                            job.claimed_by.clone().unwrap_or_default(),
                        ));
                    }
                }
            }
            JobState::Completed | JobState::FailedTerminal => {
                return Err(JobError::InvalidTransition { from: job.state, to: JobState::Running });
            }
        }
        if now < job.available_at {
            return Err(JobError::NotYetAvailable(job.id.clone()));
        }

        let from = job.state;
        job.state = JobState::Running;
        job.claimed_by = Some(worker_id.clone());
        job.claimed_at = Some(now);
        job.state_version += 1;
        job.updated_at = now;

        let transition = record(
            &job,
            Some(from),
            "job_claimed",
            None,
            serde_json::json!({
                "worker_id": worker_id,
                "claim_timeout_seconds": self.config.claim_timeout_seconds,
            }),
            now,
        );
        Ok(JobStep { job, transition })
    }

    pub fn complete(&self, mut job: CycleJob, now: DateTime<Utc>) -> Result<JobStep, JobError> {
        validate(&job, JobState::Completed)?;
        let from = job.state;
        job.state = JobState::Completed;
        job.state_version += 1;
        job.updated_at = now;
        job.claimed_by = None;
        job.claimed_at = None;

        let transition =
            record(&job, Some(from), "job_completed", None, serde_json::json!({}), now);
        Ok(JobStep { job, transition })
    }

    /// Running -> RetryableFailed with exponential backoff, or
    /// FailedTerminal once retries are exhausted.
    pub fn fail(
        &self,
        mut job: CycleJob,
        error: impl Into<String>,
        error_class: impl Into<String>,
        retry_policy: RetryPolicy,
        now: DateTime<Utc>,
    ) -> Result<JobStep, JobError> {
        validate(&job, JobState::RetryableFailed)?;
        let error = error.into();
        let error_class = error_class.into();
        let from = job.state;

        let should_retry =
            matches!(retry_policy, RetryPolicy::Retry) && job.retry_count < job.max_retries;

        job.last_error = Some(error.clone());
        job.state_version += 1;
        job.updated_at = now;
        job.claimed_by = None;
        job.claimed_at = None;

        let transition = if should_retry {
            let available_at = now + self.backoff(job.retry_count);
            job.state = JobState::RetryableFailed;
            job.retry_count += 1;
            job.available_at = available_at;
            record(
                &job,
                Some(from),
                "job_failed_retryable",
                Some(error_class.clone()),
                serde_json::json!({
                    "retry_count": job.retry_count,
                    "max_retries": job.max_retries,
                    "next_available_at": available_at,
                    "error": error,
                }),
                now,
            )
        } else {
            job.state = JobState::FailedTerminal;
            record(
                &job,
                Some(from),
                "job_failed_terminal",
                Some(error_class.clone()),
                serde_json::json!({
                    "retry_count": job.retry_count,
                    "max_retries": job.max_retries,
                    "error": error,
                }),
                now,
            )
        };

        Ok(JobStep { job, transition })
    }

    /// Delay before the attempt following `retry_count` earlier retries.
    pub fn backoff(&self, retry_count: u32) -> Duration {
        let factor = i64::from(self.config.retry_backoff_multiplier.saturating_pow(retry_count));
        Duration::seconds(self.config.retry_base_delay_seconds.saturating_mul(factor))
    }

    /// Running jobs whose claim is older than the claim timeout.
    pub fn stale_jobs(&self, jobs: Vec<CycleJob>, now: DateTime<Utc>) -> Vec<CycleJob> {
        let threshold = now - Duration::seconds(self.config.claim_timeout_seconds);
        jobs.into_iter()
            .filter(|job| {
                job.state == JobState::Running
                    && job.claimed_at.is_some_and(|claimed_at| claimed_at < threshold)
            })
            .collect()
    }

    /// Returns a stale running job to the queue without spending a retry.
    pub fn release_stale(&self, mut job: CycleJob, now: DateTime<Utc>) -> Result<JobStep, JobError> {
        if job.state != JobState::Running {
            return Err(JobError::InvalidTransition { from: job.state, to: JobState::Queued });
        }
        let previous_worker = job.claimed_by.take();
        job.state = JobState::Queued;
        job.claimed_at = None;
        job.available_at = now;
        job.state_version += 1;
        job.updated_at = now;

        let transition = record(
            &job,
            Some(JobState::Running),
            "job_claim_expired",
            None,
            serde_json::json!({ "previous_worker": previous_worker }),
            now,
        );
        Ok(JobStep { job, transition })
    }
}

fn validate(job: &CycleJob, to: JobState) -> Result<(), JobError> {
    let valid = matches!(
        (job.state, to),
        (JobState::Running, JobState::Completed)
            | (JobState::Running, JobState::RetryableFailed)
            | (JobState::Running, JobState::FailedTerminal)
    );
    if valid {
        Ok(())
    } else {
        Err(JobError::InvalidTransition { from: job.state, to })
    }
}

fn record(
    job: &CycleJob,
    from_state: Option<JobState>,
    reason: &str,
    error_class: Option<String>,
    context: serde_json::Value,
    now: DateTime<Utc>,
) -> JobTransition {
    JobTransition {
        job_id: job.id.clone(),
        thread_id: job.thread_id.clone(),
        from_state,
        to_state: job.state,
        reason: reason.to_string(),
        error_class,
        context_json: context.to_string(),
        correlation_id: job.correlation_id.clone(),
        state_version: job.state_version,
        occurred_at: now,
    }
}
