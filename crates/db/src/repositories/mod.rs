use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;

use parley_core::domain::commitment::Commitment;
use parley_core::domain::decision::DecisionLogEntry;
use parley_core::domain::follow_up::{FollowUpId, ScheduledFollowUp};
use parley_core::domain::job::{CycleJob, CycleJobId, JobTransition};
use parley_core::domain::message::NegotiationMessage;
use parley_core::domain::policy::AgentPolicy;
use parley_core::domain::scenario::ScenarioCandidate;
use parley_core::domain::thread::{
    NegotiationThread, StageGuard, TalentId, ThreadId, ThreadStage,
};
use parley_core::errors::ApplicationError;

mod codec;
pub mod commitment;
pub mod decision_log;
pub mod follow_up;
pub mod job_queue;
pub mod memory;
pub mod message;
pub mod policy;
pub mod thread;

pub use commitment::SqlCommitmentRepository;
pub use decision_log::SqlDecisionLogRepository;
pub use follow_up::SqlFollowUpRepository;
pub use job_queue::SqlJobQueueRepository;
pub use memory::{
    InMemoryCandidateRepository, InMemoryCommitmentRepository, InMemoryDecisionLogRepository,
    InMemoryFollowUpRepository, InMemoryJobQueueRepository, InMemoryMessageRepository,
    InMemoryPolicyRepository, InMemoryThreadRepository,
};
pub use message::{SqlCandidateRepository, SqlMessageRepository};
pub use policy::SqlPolicyRepository;
pub use thread::SqlThreadRepository;

use crate::DbPool;

#[derive(Debug, Error)]
pub enum RepositoryError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("decode error: {0}")]
    Decode(String),
    #[error("conflict: {0}")]
    Conflict(String),
}

impl From<RepositoryError> for ApplicationError {
    fn from(error: RepositoryError) -> Self {
        ApplicationError::Persistence(error.to_string())
    }
}

#[async_trait]
pub trait ThreadRepository: Send + Sync {
    async fn find_by_id(&self, id: &ThreadId) -> Result<Option<NegotiationThread>, RepositoryError>;

    async fn list_by_stage(
        &self,
        stage: ThreadStage,
    ) -> Result<Vec<NegotiationThread>, RepositoryError>;

    /// Inserts or fully replaces the thread row.
    async fn save(&self, thread: NegotiationThread) -> Result<(), RepositoryError>;

    /// Moves the thread to `next` only if the stored stage and version still
    /// equal `expected`. Returns the new guard when the write landed.
    async fn compare_and_set_stage(
        &self,
        id: &ThreadId,
        expected: StageGuard,
        next: ThreadStage,
        now: DateTime<Utc>,
    ) -> Result<Option<StageGuard>, RepositoryError>;
}

#[async_trait]
pub trait MessageRepository: Send + Sync {
    async fn append(&self, message: NegotiationMessage) -> Result<(), RepositoryError>;

    /// Conversation history, oldest first.
    async fn list_for_thread(
        &self,
        thread_id: &ThreadId,
    ) -> Result<Vec<NegotiationMessage>, RepositoryError>;
}

#[async_trait]
pub trait CandidateRepository: Send + Sync {
    /// Drops every stored candidate for the thread and stores `ranked` in its
    /// given order.
    async fn replace_for_thread(
        &self,
        thread_id: &ThreadId,
        ranked: Vec<ScenarioCandidate>,
    ) -> Result<(), RepositoryError>;

    async fn list_for_thread(
        &self,
        thread_id: &ThreadId,
    ) -> Result<Vec<ScenarioCandidate>, RepositoryError>;
}

#[async_trait]
pub trait PolicyRepository: Send + Sync {
    async fn find_for_talent(
        &self,
        talent_id: &TalentId,
    ) -> Result<Option<AgentPolicy>, RepositoryError>;

    async fn save(&self, policy: AgentPolicy) -> Result<(), RepositoryError>;
}

#[async_trait]
pub trait CommitmentRepository: Send + Sync {
    async fn list_for_talent(
        &self,
        talent_id: &TalentId,
    ) -> Result<Vec<Commitment>, RepositoryError>;

    async fn save(&self, commitment: Commitment) -> Result<(), RepositoryError>;
}

/// Append-only; rows are never updated or deleted.
#[async_trait]
pub trait DecisionLogRepository: Send + Sync {
    /// Fails with `Conflict` if the thread already has an entry at this
    /// sequence.
    async fn append(&self, entry: DecisionLogEntry) -> Result<(), RepositoryError>;

    async fn latest_for_thread(
        &self,
        thread_id: &ThreadId,
    ) -> Result<Option<DecisionLogEntry>, RepositoryError>;

    /// Entries ordered by sequence.
    async fn list_for_thread(
        &self,
        thread_id: &ThreadId,
    ) -> Result<Vec<DecisionLogEntry>, RepositoryError>;
}

#[async_trait]
pub trait FollowUpRepository: Send + Sync {
    /// Stores `candidate` unless the thread already has an active follow-up,
    /// in which case the existing one is returned untouched.
    async fn schedule_if_absent(
        &self,
        candidate: ScheduledFollowUp,
    ) -> Result<ScheduledFollowUp, RepositoryError>;

    async fn find_by_id(&self, id: &FollowUpId)
        -> Result<Option<ScheduledFollowUp>, RepositoryError>;

    async fn find_active(
        &self,
        thread_id: &ThreadId,
    ) -> Result<Option<ScheduledFollowUp>, RepositoryError>;

    /// Returns whether an active follow-up was cancelled.
    async fn cancel_active(
        &self,
        thread_id: &ThreadId,
        now: DateTime<Utc>,
    ) -> Result<bool, RepositoryError>;

    async fn list_due(
        &self,
        now: DateTime<Utc>,
        limit: u32,
    ) -> Result<Vec<ScheduledFollowUp>, RepositoryError>;

    /// Marks the follow-up fired only while it is still active.
    async fn mark_fired(&self, id: &FollowUpId, now: DateTime<Utc>)
        -> Result<bool, RepositoryError>;
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum EnqueueOutcome {
    Enqueued(CycleJob),
    /// A job of the same kind is already pending for the thread.
    AlreadyPending(CycleJob),
}

impl EnqueueOutcome {
    pub fn job(&self) -> &CycleJob {
        match self {
            Self::Enqueued(job) | Self::AlreadyPending(job) => job,
        }
    }
}

#[async_trait]
pub trait JobQueueRepository: Send + Sync {
    async fn find_by_id(&self, id: &CycleJobId) -> Result<Option<CycleJob>, RepositoryError>;

    async fn enqueue(&self, job: CycleJob) -> Result<EnqueueOutcome, RepositoryError>;

    /// Queued or retryable jobs whose `available_at` has passed, oldest first.
    async fn list_claimable(
        &self,
        now: DateTime<Utc>,
        limit: u32,
    ) -> Result<Vec<CycleJob>, RepositoryError>;

    async fn list_running(&self) -> Result<Vec<CycleJob>, RepositoryError>;

    async fn list_for_thread(&self, thread_id: &ThreadId) -> Result<Vec<CycleJob>, RepositoryError>;

    /// Writes `job` only if the stored row still carries `expected_version`.
    async fn save_if_version(
        &self,
        job: CycleJob,
        expected_version: u32,
    ) -> Result<bool, RepositoryError>;

    async fn append_transition(&self, transition: JobTransition) -> Result<(), RepositoryError>;

    async fn list_transitions(&self, job_id: &CycleJobId)
        -> Result<Vec<JobTransition>, RepositoryError>;
}

/// Every repository the pipeline needs, behind trait objects.
#[derive(Clone)]
pub struct RepositorySet {
    pub threads: Arc<dyn ThreadRepository>,
    pub messages: Arc<dyn MessageRepository>,
    pub candidates: Arc<dyn CandidateRepository>,
    pub policies: Arc<dyn PolicyRepository>,
    pub commitments: Arc<dyn CommitmentRepository>,
    pub decisions: Arc<dyn DecisionLogRepository>,
    pub follow_ups: Arc<dyn FollowUpRepository>,
    pub jobs: Arc<dyn JobQueueRepository>,
}

impl RepositorySet {
    pub fn sql(pool: DbPool) -> Self {
        Self {
            threads: Arc::new(SqlThreadRepository::new(pool.clone())),
            messages: Arc::new(SqlMessageRepository::new(pool.clone())),
            candidates: Arc::new(SqlCandidateRepository::new(pool.clone())),
            policies: Arc::new(SqlPolicyRepository::new(pool.clone())),
            commitments: Arc::new(SqlCommitmentRepository::new(pool.clone())),
            decisions: Arc::new(SqlDecisionLogRepository::new(pool.clone())),
            follow_ups: Arc::new(SqlFollowUpRepository::new(pool.clone())),
            jobs: Arc::new(SqlJobQueueRepository::new(pool)),
        }
    }

    pub fn in_memory() -> Self {
        Self {
            threads: Arc::new(InMemoryThreadRepository::default()),
            messages: Arc::new(InMemoryMessageRepository::default()),
            candidates: Arc::new(InMemoryCandidateRepository::default()),
            policies: Arc::new(InMemoryPolicyRepository::default()),
            commitments: Arc::new(InMemoryCommitmentRepository::default()),
            decisions: Arc::new(InMemoryDecisionLogRepository::default()),
            follow_ups: Arc::new(InMemoryFollowUpRepository::default()),
            jobs: Arc::new(InMemoryJobQueueRepository::default()),
        }
    }
}
