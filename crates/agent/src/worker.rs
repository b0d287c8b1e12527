//! Queue worker: releases stale claims, promotes due follow-ups, then claims
//! and processes a batch of jobs.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::{info, warn};

use parley_core::domain::job::{CycleJob, JobKind, JobState};
use parley_core::errors::{ApplicationError, DomainError};
use parley_core::job_engine::{JobStep, RetryPolicy};
use parley_db::repositories::EnqueueOutcome;

use crate::runtime::{JobOutcome, NegotiationRuntime};

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct WorkerSettings {
    pub worker_id: String,
    pub batch_size: u32,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct WorkerReport {
    pub released: usize,
    pub promoted: usize,
    pub claimed: usize,
    pub completed: usize,
    pub retried: usize,
    pub failed: usize,
    pub requeued: usize,
}

impl WorkerReport {
    pub fn is_idle(&self) -> bool {
        self.released == 0 && self.promoted == 0 && self.claimed == 0
    }
}

pub struct JobRunner {
    runtime: Arc<NegotiationRuntime>,
    settings: WorkerSettings,
}

impl JobRunner {
    pub fn new(runtime: Arc<NegotiationRuntime>, settings: WorkerSettings) -> Self {
        Self { runtime, settings }
    }

    pub fn runtime(&self) -> &NegotiationRuntime {
        &self.runtime
    }

    pub async fn run_once(&self, now: DateTime<Utc>) -> Result<WorkerReport, ApplicationError> {
        let mut report = WorkerReport {
            released: self.release_stale_claims(now).await?,
            promoted: self.runtime.promote_due_follow_ups(now, self.settings.batch_size).await?,
            ..WorkerReport::default()
        };

        let repositories = self.runtime.repositories();
        let engine = self.runtime.job_engine();
        for queued in repositories.jobs.list_claimable(now, self.settings.batch_size).await? {
            let expected_version = queued.state_version;
            let job_id = queued.id.clone();
            let step = match engine.claim(queued, self.settings.worker_id.as_str(), now) {
                Ok(step) => step,
                Err(error) => {
                    warn!(event_name = "worker.claim_rejected", job_id = %job_id.0, error = %error, "job not claimable");
                    continue;
                }
            };
            if !self.persist(step.clone(), expected_version).await? {
                // Another worker claimed it first.
                continue;
            }
            report.claimed += 1;
            self.process(step.job, now, &mut report).await?;
        }

        if !report.is_idle() {
            info!(
                event_name = "worker.batch_finished",
                worker_id = %self.settings.worker_id,
                released = report.released,
                promoted = report.promoted,
                claimed = report.claimed,
                completed = report.completed,
                retried = report.retried,
                failed = report.failed,
                requeued = report.requeued,
                "worker batch finished"
            );
        }
        Ok(report)
    }

    async fn process(
        &self,
        job: CycleJob,
        now: DateTime<Utc>,
        report: &mut WorkerReport,
    ) -> Result<(), ApplicationError> {
        let engine = self.runtime.job_engine();
        let version = job.state_version;

        match self.runtime.process_job(&job, now).await {
            Ok(outcome) => {
                let thread_id = job.thread_id.clone();
                let correlation_id = job.correlation_id.clone();
                let step = engine.complete(job, now).map_err(DomainError::from)?;
                self.persist(step, version).await?;
                report.completed += 1;

                if let Some(stage) = outcome.requeue_stage() {
                    let queued = self
                        .runtime
                        .enqueue(&thread_id, JobKind::DecisionCycle, stage, None, &correlation_id, now)
                        .await?;
                    if matches!(queued, EnqueueOutcome::Enqueued(_)) {
                        report.requeued += 1;
                    }
                }
                if let JobOutcome::Cycle(cycle) = &outcome {
                    info!(
                        event_name = "worker.job_completed",
                        correlation_id = %correlation_id,
                        thread_id = %thread_id,
                        outcome = ?cycle,
                        "cycle job completed"
                    );
                }
            }
            Err(error) => {
                let policy =
                    if error.is_retryable() { RetryPolicy::Retry } else { RetryPolicy::FailTerminal };
                warn!(
                    event_name = "worker.job_failed",
                    correlation_id = %job.correlation_id,
                    thread_id = %job.thread_id,
                    job_id = %job.id.0,
                    error_class = error.error_class(),
                    error = %error,
                    "job failed"
                );
                let step = engine
                    .fail(job, error.to_string(), error.error_class(), policy, now)
                    .map_err(DomainError::from)?;
                if step.job.state == JobState::RetryableFailed {
                    report.retried += 1;
                } else {
                    report.failed += 1;
                }
                self.persist(step, version).await?;
            }
        }
        Ok(())
    }

    async fn release_stale_claims(&self, now: DateTime<Utc>) -> Result<usize, ApplicationError> {
        let repositories = self.runtime.repositories();
        let engine = self.runtime.job_engine();
        let running = repositories.jobs.list_running().await?;

        let mut released = 0;
        for job in engine.stale_jobs(running, now) {
            let expected_version = job.state_version;
            let job_id = job.id.clone();
            let step = engine.release_stale(job, now).map_err(DomainError::from)?;
            if self.persist(step, expected_version).await? {
                warn!(event_name = "worker.claim_expired", job_id = %job_id.0, "stale claim released");
                released += 1;
            }
        }
        Ok(released)
    }

    /// Writes the job if nobody else touched it, then records the transition.
    async fn persist(&self, step: JobStep, expected_version: u32) -> Result<bool, ApplicationError> {
        let jobs = &self.runtime.repositories().jobs;
        if !jobs.save_if_version(step.job, expected_version).await? {
            return Ok(false);
        }
        jobs.append_transition(step.transition).await?;
        Ok(true)
    }
}
