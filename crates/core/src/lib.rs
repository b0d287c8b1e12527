//! Domain model and deterministic engines for the negotiation decision
//! pipeline. Nothing in this crate performs I/O apart from config loading.

pub mod audit;
pub mod config;
pub mod domain;
pub mod errors;
pub mod job_engine;
pub mod negotiation;

pub use domain::commitment::{Commitment, CommitmentId};
pub use domain::decision::{DecisionDraft, DecisionId, DecisionLogEntry, DecisionType};
pub use domain::follow_up::{FollowUpId, ScheduledFollowUp};
pub use domain::job::{CycleJob, CycleJobId, JobKind, JobState, JobTransition};
pub use domain::message::{MessageId, MessageSender, MessageStatus, NegotiationMessage};
pub use domain::policy::AgentPolicy;
pub use domain::scenario::{Archetype, DealContext, OutcomePrediction, ScenarioCandidate};
pub use domain::thread::{
    DealTerms, NegotiationThread, StageGuard, TalentId, ThreadId, ThreadStage,
};
pub use errors::{ApplicationError, DomainError, InterfaceError};
pub use job_engine::{JobEngine, JobEngineConfig, JobError, JobStep, RetryPolicy};
