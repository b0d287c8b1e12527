//! Agent runtime for the negotiation pipeline.
//!
//! This crate wires the deterministic engines in `parley-core` to the
//! outside world:
//! - Asks an outcome oracle to predict each archetype concurrently (`simulator`)
//! - Composes the outbound reply and checks it against the floor (`composer`, `guardrails`)
//! - Drives one decision cycle per thread through compare-and-set stage writes (`runtime`)
//! - Claims and processes queued cycle and follow-up jobs (`worker`)
//!
//! # Safety Principle
//!
//! The model only predicts and phrases. Which strategy wins, whether a reply
//! is sent or drafted, and whether a cycle halts are all decided by the core
//! engines.

pub mod composer;
pub mod guardrails;
pub mod llm;
pub mod oracle;
pub mod ports;
pub mod runtime;
pub mod simulator;
pub mod worker;

pub use composer::{ComposedOutcome, ReplyComposer};
pub use llm::{HttpLlmClient, LlmClient, LlmError};
pub use oracle::{LlmOracle, OracleError, OutcomeOracle, ReplyOracle, ScriptedOracle};
pub use ports::{MailTransport, OpsNotifier, TracingMailTransport, TracingOpsNotifier};
pub use runtime::{BrandReplyOutcome, CycleOutcome, FollowUpOutcome, JobOutcome, NegotiationRuntime};
pub use simulator::{ScenarioSimulator, SimulatorSettings};
pub use worker::{JobRunner, WorkerReport, WorkerSettings};
