//! Deterministic negotiation engines: scoring, conflict detection,
//! selection, policy gating, thread stages and the decision-log chain.

pub mod conflicts;
pub mod decision_chain;
pub mod policy_gate;
pub mod scoring;
pub mod selector;
pub mod stages;

pub use conflicts::{
    CommitmentLedger, ConflictDetector, ConflictFinding, ConflictKind, ConflictVerdict,
    EngagementWindow,
};
pub use decision_chain::{ChainVerification, GENESIS_HASH};
pub use policy_gate::{DispatchMode, GateDecision, GateReason, PolicyGate};
pub use scoring::{ScenarioScorer, ScoringWeights, TIE_EPSILON};
pub use selector::{BlockedCandidate, DecisionSelector, Selection};
pub use stages::{StageAction, StageEvent, StageMachine, StageTransition, StageTransitionError};
