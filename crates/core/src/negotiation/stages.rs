use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::audit::{AuditCategory, AuditContext, AuditEvent, AuditOutcome, AuditSink};
use crate::domain::thread::ThreadStage;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum StageEvent {
    CandidatesSimulated,
    SelectionCompleted,
    AllCandidatesBlocked,
    ReplyDispatched,
    FollowUpScheduled,
    BrandReplied,
    ConversationReopened,
    FollowUpFired,
    OperatorResumed,
    /// A cycle failed part-way; return to the stage it started from.
    CycleFailed { origin: ThreadStage },
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum StageAction {
    ScoreAndFilterCandidates,
    GateAndCompose,
    RecordHalt,
    NotifyOps,
    ScheduleFollowUp,
    CancelFollowUp,
    EnqueueDecisionCycle,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageTransition {
    pub from: ThreadStage,
    pub to: ThreadStage,
    pub event: StageEvent,
    pub actions: Vec<StageAction>,
}

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum StageTransitionError {
    #[error("invalid transition from {stage} using event {event:?}")]
    InvalidTransition { stage: ThreadStage, event: StageEvent },
    #[error("cycle cannot roll back from {stage} to {origin}")]
    InvalidRollback { stage: ThreadStage, origin: ThreadStage },
}

/// Pure transition table for a negotiation thread.
pub fn transition(
    current: ThreadStage,
    event: StageEvent,
) -> Result<StageTransition, StageTransitionError> {
    use StageAction::{
        CancelFollowUp, EnqueueDecisionCycle, GateAndCompose, NotifyOps, RecordHalt,
        ScheduleFollowUp, ScoreAndFilterCandidates,
    };
    use StageEvent as E;
    use ThreadStage as S;

    let (to, actions) = match (current, event) {
        (S::Open | S::FollowUpFired, E::CandidatesSimulated) => {
            (S::Simulated, vec![ScoreAndFilterCandidates])
        }
        (S::Simulated, E::SelectionCompleted) => (S::Decided, vec![GateAndCompose]),
        (S::Decided, E::AllCandidatesBlocked) => (S::Halted, vec![RecordHalt, NotifyOps]),
        (S::Decided, E::ReplyDispatched) => (S::Dispatched, vec![ScheduleFollowUp]),
        (S::Dispatched, E::FollowUpScheduled) => (S::FollowUpScheduled, Vec::new()),
        (S::Replied | S::Halted, E::BrandReplied) => {
            return Err(StageTransitionError::InvalidTransition { stage: current, event });
        }
        (_, E::BrandReplied) => (S::Replied, vec![CancelFollowUp]),
        (S::Replied, E::ConversationReopened) => (S::Open, vec![EnqueueDecisionCycle]),
        (S::FollowUpScheduled, E::FollowUpFired) => (S::FollowUpFired, vec![EnqueueDecisionCycle]),
        (S::Halted, E::OperatorResumed) => (S::Open, vec![EnqueueDecisionCycle]),
        (S::Simulated | S::Decided, E::CycleFailed { origin }) => {
            if !origin.starts_cycle() {
                return Err(StageTransitionError::InvalidRollback { stage: current, origin });
            }
            (origin, Vec::new())
        }
        _ => return Err(StageTransitionError::InvalidTransition { stage: current, event }),
    };

    Ok(StageTransition { from: current, to, event, actions })
}

#[derive(Clone, Copy, Debug, Default)]
pub struct StageMachine;

impl StageMachine {
    pub fn apply(
        &self,
        current: ThreadStage,
        event: StageEvent,
    ) -> Result<StageTransition, StageTransitionError> {
        transition(current, event)
    }

    pub fn apply_with_audit<S>(
        &self,
        current: ThreadStage,
        event: StageEvent,
        sink: &S,
        audit: &AuditContext,
    ) -> Result<StageTransition, StageTransitionError>
    where
        S: AuditSink + ?Sized,
    {
        let result = self.apply(current, event);
        match &result {
            Ok(outcome) => sink.emit(
                AuditEvent::new(
                    audit,
                    "stage.transition_applied",
                    AuditCategory::Stage,
                    AuditOutcome::Success,
                )
                .with_metadata("from", outcome.from.as_str())
                .with_metadata("to", outcome.to.as_str())
                .with_metadata("event", format!("{:?}", outcome.event)),
            ),
            Err(error) => sink.emit(
                AuditEvent::new(
                    audit,
                    "stage.transition_rejected",
                    AuditCategory::Stage,
                    AuditOutcome::Rejected,
                )
                .with_metadata("error", error.to_string()),
            ),
        }
        result
    }
}
