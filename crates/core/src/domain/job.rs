use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::follow_up::FollowUpId;
use crate::domain::thread::{ThreadId, ThreadStage};

#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CycleJobId(pub String);

impl fmt::Display for CycleJobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobKind {
    DecisionCycle,
    FollowUp,
}

impl JobKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::DecisionCycle => "decision_cycle",
            Self::FollowUp => "follow_up",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "decision_cycle" => Some(Self::DecisionCycle),
            "follow_up" => Some(Self::FollowUp),
            _ => None,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    Queued,
    Running,
    RetryableFailed,
    FailedTerminal,
    Completed,
}

impl JobState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Running => "running",
            Self::RetryableFailed => "retryable_failed",
            Self::FailedTerminal => "failed_terminal",
            Self::Completed => "completed",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "queued" => Some(Self::Queued),
            "running" => Some(Self::Running),
            "retryable_failed" => Some(Self::RetryableFailed),
            "failed_terminal" => Some(Self::FailedTerminal),
            "completed" => Some(Self::Completed),
            _ => None,
        }
    }

    /// Jobs that may still run count against the one-per-thread-and-kind limit.
    pub fn is_pending(&self) -> bool {
        matches!(self, Self::Queued | Self::Running | Self::RetryableFailed)
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::FailedTerminal)
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CycleJob {
    pub id: CycleJobId,
    pub thread_id: ThreadId,
    pub kind: JobKind,
    pub expected_stage: ThreadStage,
    pub follow_up_id: Option<FollowUpId>,
    pub state: JobState,
    pub retry_count: u32,
    pub max_retries: u32,
    pub available_at: DateTime<Utc>,
    pub claimed_by: Option<String>,
    pub claimed_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub correlation_id: String,
    pub state_version: u32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobTransition {
    pub job_id: CycleJobId,
    pub thread_id: ThreadId,
    pub from_state: Option<JobState>,
    pub to_state: JobState,
    pub reason: String,
    pub error_class: Option<String>,
    pub context_json: String,
    pub correlation_id: String,
    pub state_version: u32,
    pub occurred_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::{JobKind, JobState};

    #[test]
    fn job_state_round_trips_from_storage_encoding() {
        let cases = [
            JobState::Queued,
            JobState::Running,
            JobState::RetryableFailed,
            JobState::FailedTerminal,
            JobState::Completed,
        ];

        for state in cases {
            assert_eq!(JobState::parse(state.as_str()), Some(state));
        }
        assert_eq!(JobKind::parse("follow_up"), Some(JobKind::FollowUp));
        assert_eq!(JobKind::parse("quote_sync"), None);
    }
}
