//! The negotiation runtime: one decision cycle per thread, driven by queue
//! jobs, with every stage change applied as a compare-and-set.

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use rust_decimal::Decimal;
use serde::Serialize;
use tracing::{info, warn};
use uuid::Uuid;

use parley_core::audit::{
    AuditCategory, AuditContext, AuditEvent, AuditOutcome, AuditSink, NoopAuditSink,
};
use parley_core::config::NegotiationConfig;
use parley_core::domain::decision::{DecisionDraft, DecisionId, DecisionLogEntry, DecisionType};
use parley_core::domain::follow_up::{FollowUpId, ScheduledFollowUp};
use parley_core::domain::job::{CycleJob, CycleJobId, JobKind};
use parley_core::domain::message::{MessageId, MessageSender, MessageStatus, NegotiationMessage};
use parley_core::domain::policy::AgentPolicy;
use parley_core::domain::scenario::{Archetype, DealContext, ScenarioCandidate};
use parley_core::domain::thread::{NegotiationThread, StageGuard, ThreadId, ThreadStage};
use parley_core::errors::{ApplicationError, DomainError};
use parley_core::job_engine::JobEngine;
use parley_core::negotiation::{
    decision_chain, BlockedCandidate, CommitmentLedger, ConflictFinding, DecisionSelector,
    DispatchMode, PolicyGate, ScenarioScorer, Selection, StageEvent, StageMachine,
};
use parley_db::repositories::{EnqueueOutcome, RepositorySet};

use crate::composer::ReplyComposer;
use crate::oracle::{OutcomeOracle, ReplyOracle, ReplyRequest};
use crate::ports::{MailTransport, OpsNotice, OpsNoticeKind, OpsNotifier, OutboundMail};
use crate::simulator::{ScenarioSimulator, SimulatorSettings};

const ACTOR: &str = "negotiation-runtime";
const REPLY_RACE_ATTEMPTS: usize = 3;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RuntimeSettings {
    pub follow_up_delay: Duration,
    pub ops_value_threshold: Decimal,
}

impl RuntimeSettings {
    pub fn from_config(config: &NegotiationConfig) -> Self {
        Self {
            follow_up_delay: Duration::hours(i64::from(config.follow_up_delay_hours)),
            ops_value_threshold: config.ops_value_threshold,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum CycleOutcome {
    Dispatched {
        decision_id: DecisionId,
        decision_type: DecisionType,
        archetype: Archetype,
        anchor_rate: Decimal,
        follow_up_id: FollowUpId,
        used_fallback: bool,
    },
    Halted {
        decision_id: DecisionId,
        blocked: usize,
    },
    /// The thread was already dispatched; only the follow-up was scheduled.
    SchedulingCompleted {
        follow_up_id: FollowUpId,
    },
    /// The thread is no longer where the job expected it. Nothing was done.
    Stale {
        expected: ThreadStage,
        actual: ThreadStage,
    },
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum FollowUpOutcome {
    Fired { follow_up_id: FollowUpId, cycle_job_id: CycleJobId },
    Skipped { reason: String },
}

#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum JobOutcome {
    Cycle(CycleOutcome),
    FollowUp(FollowUpOutcome),
}

impl JobOutcome {
    /// Stage a fresh decision cycle should start from, when the job went
    /// stale on a thread that has since been reopened.
    pub fn requeue_stage(&self) -> Option<ThreadStage> {
        match self {
            Self::Cycle(CycleOutcome::Stale { actual, .. }) if actual.starts_cycle() => Some(*actual),
            _ => None,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct BrandReplyOutcome {
    pub message_id: MessageId,
    pub follow_up_cancelled: bool,
    pub stage: ThreadStage,
    pub cycle_job_id: Option<CycleJobId>,
}

/// Everything one decision cycle reads up front.
struct CycleInput<'a> {
    thread: &'a NegotiationThread,
    policy: AgentPolicy,
    context: DealContext,
    audit: AuditContext,
    correlation_id: &'a str,
    now: DateTime<Utc>,
}

pub struct NegotiationRuntime {
    repositories: RepositorySet,
    simulator: ScenarioSimulator,
    composer: ReplyComposer,
    mail: Arc<dyn MailTransport>,
    ops: Arc<dyn OpsNotifier>,
    audit: Arc<dyn AuditSink>,
    scorer: ScenarioScorer,
    selector: DecisionSelector,
    gate: PolicyGate,
    stages: StageMachine,
    jobs: JobEngine,
    settings: RuntimeSettings,
}

impl NegotiationRuntime {
    pub fn new(
        repositories: RepositorySet,
        outcome_oracle: Arc<dyn OutcomeOracle>,
        reply_oracle: Arc<dyn ReplyOracle>,
        mail: Arc<dyn MailTransport>,
        ops: Arc<dyn OpsNotifier>,
        config: &NegotiationConfig,
    ) -> Self {
        Self {
            repositories,
            simulator: ScenarioSimulator::new(outcome_oracle, SimulatorSettings::from_config(config)),
            composer: ReplyComposer::new(reply_oracle),
            mail,
            ops,
            audit: Arc::new(NoopAuditSink),
            scorer: ScenarioScorer::default(),
            selector: DecisionSelector::default(),
            gate: PolicyGate,
            stages: StageMachine,
            jobs: JobEngine::new(),
            settings: RuntimeSettings::from_config(config),
        }
    }

    pub fn with_audit_sink(mut self, audit: Arc<dyn AuditSink>) -> Self {
        self.audit = audit;
        self
    }

    pub fn with_job_engine(mut self, jobs: JobEngine) -> Self {
        self.jobs = jobs;
        self
    }

    pub fn repositories(&self) -> &RepositorySet {
        &self.repositories
    }

    pub fn job_engine(&self) -> &JobEngine {
        &self.jobs
    }

    pub fn settings(&self) -> &RuntimeSettings {
        &self.settings
    }

    /// Queues a decision cycle for a thread that can start (or finish) one.
    pub async fn enqueue_cycle(
        &self,
        thread_id: &ThreadId,
        correlation_id: &str,
        now: DateTime<Utc>,
    ) -> Result<EnqueueOutcome, ApplicationError> {
        let thread = self.load_thread(thread_id).await?;
        if !(thread.stage.starts_cycle() || thread.stage == ThreadStage::Dispatched) {
            return Err(DomainError::StageMismatch {
                thread_id: thread.id,
                expected: ThreadStage::Open,
                actual: thread.stage,
            }
            .into());
        }
        self.enqueue(&thread.id, JobKind::DecisionCycle, thread.stage, None, correlation_id, now)
            .await
    }

    /// Runs one decision cycle for a thread the job expected at `expected`.
    pub async fn run_cycle(
        &self,
        thread_id: &ThreadId,
        expected: ThreadStage,
        correlation_id: &str,
        now: DateTime<Utc>,
    ) -> Result<CycleOutcome, ApplicationError> {
        let thread = self.load_thread(thread_id).await?;
        let audit = AuditContext::new(Some(thread.id.clone()), correlation_id, ACTOR);

        if thread.stage == ThreadStage::Dispatched {
            return self.finish_scheduling(&thread.id, thread.guard(), &audit, now).await;
        }
        if thread.stage != expected || !expected.starts_cycle() {
            info!(
                event_name = "cycle.stale",
                correlation_id,
                thread_id = %thread.id,
                expected = expected.as_str(),
                actual = thread.stage.as_str(),
                "thread moved on; skipping cycle"
            );
            return Ok(CycleOutcome::Stale { expected, actual: thread.stage });
        }

        let policy = self
            .repositories
            .policies
            .find_for_talent(&thread.talent_id)
            .await?
            .unwrap_or_else(|| AgentPolicy::safe_default(thread.talent_id.clone()));
        let history = self.repositories.messages.list_for_thread(&thread.id).await?;
        let context = DealContext::from_thread(&thread, &history);

        info!(
            event_name = "cycle.started",
            correlation_id,
            thread_id = %thread.id,
            stage = thread.stage.as_str(),
            round = context.round_number,
            "decision cycle started"
        );

        let candidates = self.simulator.simulate(&context, policy.negotiation_ceiling_pct).await;
        let ranked =
            self.scorer.rank(candidates, thread.terms.floor_rate, thread.terms.target_rate);

        let origin = thread.stage;
        let Some(mut guard) = self
            .advance(&thread.id, thread.guard(), StageEvent::CandidatesSimulated, &audit, now)
            .await?
        else {
            return self.stale(&thread.id, origin).await;
        };

        let input = CycleInput { thread: &thread, policy, context, audit, correlation_id, now };
        match self.decide_and_dispatch(&input, ranked, &mut guard).await {
            Ok(outcome) => Ok(outcome),
            Err(error) => {
                warn!(
                    event_name = "cycle.failed",
                    correlation_id,
                    thread_id = %thread.id,
                    stage = guard.stage.as_str(),
                    error_class = error.error_class(),
                    error = %error,
                    "decision cycle failed"
                );
                if matches!(guard.stage, ThreadStage::Simulated | ThreadStage::Decided) {
                    self.roll_back(&thread.id, guard, origin, &input.audit, now).await;
                }
                Err(error)
            }
        }
    }

    async fn decide_and_dispatch(
        &self,
        input: &CycleInput<'_>,
        ranked: Vec<ScenarioCandidate>,
        guard: &mut StageGuard,
    ) -> Result<CycleOutcome, ApplicationError> {
        let thread = input.thread;
        self.repositories.candidates.replace_for_thread(&thread.id, ranked.clone()).await?;

        let commitments = self.repositories.commitments.list_for_talent(&thread.talent_id).await?;
        let ledger = CommitmentLedger::new(thread.talent_id.clone(), commitments);
        let selection = self.selector.select(
            &ranked,
            &thread.terms,
            &ledger,
            input.policy.exclusivity_buffer_days,
            input.now.date_naive(),
        );

        *guard = match self
            .advance(&thread.id, *guard, StageEvent::SelectionCompleted, &input.audit, input.now)
            .await?
        {
            Some(next) => next,
            None => return self.stale(&thread.id, ThreadStage::Simulated).await,
        };

        let degraded: Vec<String> =
            ranked.iter().filter_map(|candidate| candidate.degraded_reason.clone()).collect();

        match selection {
            Selection::Halt { blocked } => self.halt(input, &blocked, degraded, guard).await,
            Selection::Chosen { candidate, warnings, passed_over } => {
                let mut reasoning = vec![format!(
                    "selected {} (score {:.2}, anchor {})",
                    candidate.archetype, candidate.score, candidate.anchor_rate
                )];
                reasoning.extend(passed_over.iter().map(describe_blocked));
                reasoning.extend(
                    warnings.iter().map(|finding| format!("warning: {}", describe_finding(finding))),
                );
                reasoning.extend(degraded);
                self.dispatch(input, candidate, reasoning, guard).await
            }
        }
    }

    async fn halt(
        &self,
        input: &CycleInput<'_>,
        blocked: &[BlockedCandidate],
        degraded: Vec<String>,
        guard: &mut StageGuard,
    ) -> Result<CycleOutcome, ApplicationError> {
        let thread = input.thread;
        let mut reasoning =
            vec![format!("halted: all {} candidates blocked by existing commitments", blocked.len())];
        reasoning.extend(blocked.iter().map(describe_blocked));
        reasoning.extend(degraded);

        let entry = self
            .append_decision(
                DecisionDraft {
                    thread_id: thread.id.clone(),
                    decision_type: DecisionType::Halt,
                    reasoning,
                    chosen_candidate: None,
                    generated_message: None,
                    policy_compliant: None,
                },
                &input.audit,
                input.now,
            )
            .await?;

        *guard = match self
            .advance(&thread.id, *guard, StageEvent::AllCandidatesBlocked, &input.audit, input.now)
            .await?
        {
            Some(next) => next,
            None => return self.stale(&thread.id, ThreadStage::Decided).await,
        };

        self.ops
            .notify(OpsNotice {
                kind: OpsNoticeKind::Halt,
                thread_id: thread.id.clone(),
                correlation_id: input.correlation_id.to_string(),
                summary: format!(
                    "{} with {}: every strategy conflicts with an existing commitment",
                    thread.talent_id, thread.brand_name
                ),
                anchor_rate: None,
            })
            .await;

        info!(
            event_name = "cycle.halted",
            correlation_id = input.correlation_id,
            thread_id = %thread.id,
            blocked = blocked.len(),
            "cycle halted; operator action required"
        );
        Ok(CycleOutcome::Halted { decision_id: entry.id, blocked: blocked.len() })
    }

    async fn dispatch(
        &self,
        input: &CycleInput<'_>,
        candidate: ScenarioCandidate,
        mut reasoning: Vec<String>,
        guard: &mut StageGuard,
    ) -> Result<CycleOutcome, ApplicationError> {
        let thread = input.thread;
        let gate = self.gate.evaluate(&input.policy, candidate.anchor_rate, thread.terms.floor_rate);
        let margin = gate
            .margin_pct
            .map_or_else(|| "n/a".to_string(), |margin| format!("{:.2}%", margin));
        reasoning.push(format!("policy gate: {} (margin {margin})", gate.reason.describe()));

        let request = ReplyRequest {
            thread_id: thread.id.clone(),
            brand_name: thread.brand_name.clone(),
            archetype: candidate.archetype,
            tone_hint: candidate.archetype.tone_hint().to_string(),
            justification: if candidate.script_stub.is_empty() {
                reasoning[0].clone()
            } else {
                candidate.script_stub.clone()
            },
            persona: input.policy.persona.clone(),
            subject: thread.reply_subject(),
            anchor_rate: candidate.anchor_rate,
            floor_rate: thread.terms.floor_rate,
            predicted_close_days: candidate.predicted_close_days,
            deliverables: thread.terms.deliverables.clone(),
            history: input.context.history.clone(),
        };
        let composed = self.composer.compose(&request).await;
        if let Some(reason) = &composed.fallback_reason {
            reasoning.push(reason.clone());
        }

        let mail = OutboundMail {
            thread_id: thread.id.clone(),
            to: thread.brand_email.clone(),
            subject: composed.reply.subject.clone(),
            body: composed.reply.body.clone(),
        };
        let status = match gate.mode {
            DispatchMode::Send => {
                self.mail.send(&mail).await?;
                MessageStatus::Sent
            }
            DispatchMode::Draft => {
                self.mail.create_draft(&mail).await?;
                MessageStatus::Draft
            }
        };

        self.repositories
            .messages
            .append(NegotiationMessage {
                id: MessageId(Uuid::new_v4().to_string()),
                thread_id: thread.id.clone(),
                sender: MessageSender::Ai,
                subject: mail.subject.clone(),
                body: mail.body.clone(),
                status,
                created_at: input.now,
            })
            .await?;

        let decision_type = gate.mode.decision_type();
        let anchor_rate = candidate.anchor_rate;
        let archetype = candidate.archetype;
        let entry = self
            .append_decision(
                DecisionDraft {
                    thread_id: thread.id.clone(),
                    decision_type,
                    reasoning,
                    chosen_candidate: Some(candidate),
                    generated_message: Some(mail.body),
                    policy_compliant: Some(gate.policy_compliant),
                },
                &input.audit,
                input.now,
            )
            .await?;

        *guard = match self
            .advance(&thread.id, *guard, StageEvent::ReplyDispatched, &input.audit, input.now)
            .await?
        {
            Some(next) => next,
            None => return self.stale(&thread.id, ThreadStage::Decided).await,
        };

        if anchor_rate >= self.settings.ops_value_threshold {
            self.ops
                .notify(OpsNotice {
                    kind: OpsNoticeKind::HighValue,
                    thread_id: thread.id.clone(),
                    correlation_id: input.correlation_id.to_string(),
                    summary: format!(
                        "{} decision for {} anchored at {anchor_rate}",
                        decision_type.as_str(),
                        thread.brand_name
                    ),
                    anchor_rate: Some(anchor_rate),
                })
                .await;
        }

        info!(
            event_name = "cycle.dispatched",
            correlation_id = input.correlation_id,
            thread_id = %thread.id,
            decision_type = decision_type.as_str(),
            archetype = archetype.as_str(),
            used_fallback = composed.used_fallback(),
            "reply dispatched"
        );

        match self.finish_scheduling(&thread.id, *guard, &input.audit, input.now).await? {
            CycleOutcome::SchedulingCompleted { follow_up_id } => Ok(CycleOutcome::Dispatched {
                decision_id: entry.id,
                decision_type,
                archetype,
                anchor_rate,
                follow_up_id,
                used_fallback: composed.used_fallback(),
            }),
            other => Ok(other),
        }
    }

    /// Dispatched -> FollowUpScheduled with exactly one active follow-up.
    async fn finish_scheduling(
        &self,
        thread_id: &ThreadId,
        guard: StageGuard,
        audit: &AuditContext,
        now: DateTime<Utc>,
    ) -> Result<CycleOutcome, ApplicationError> {
        let follow_up = self
            .repositories
            .follow_ups
            .schedule_if_absent(ScheduledFollowUp {
                id: FollowUpId(Uuid::new_v4().to_string()),
                thread_id: thread_id.clone(),
                due_at: now + self.settings.follow_up_delay,
                cancelled_at: None,
                fired_at: None,
                created_at: now,
            })
            .await?;

        if self.advance(thread_id, guard, StageEvent::FollowUpScheduled, audit, now).await?.is_some()
        {
            info!(
                event_name = "follow_up.scheduled",
                correlation_id = %audit.correlation_id,
                thread_id = %thread_id,
                follow_up_id = %follow_up.id.0,
                due_at = %follow_up.due_at,
                "follow-up scheduled"
            );
            return Ok(CycleOutcome::SchedulingCompleted { follow_up_id: follow_up.id });
        }

        // A reply landed between dispatch and scheduling; it must not be
        // chased by this follow-up.
        let current = self.load_thread(thread_id).await?;
        if current.stage != ThreadStage::FollowUpScheduled {
            self.repositories.follow_ups.cancel_active(thread_id, now).await?;
        }
        Ok(CycleOutcome::Stale { expected: ThreadStage::Dispatched, actual: current.stage })
    }

    /// Records an inbound brand message, cancels any pending follow-up and
    /// reopens the thread for a fresh cycle. A halted thread keeps its stage
    /// and waits for an operator resume.
    pub async fn record_brand_reply(
        &self,
        thread_id: &ThreadId,
        subject: &str,
        body: &str,
        correlation_id: &str,
        now: DateTime<Utc>,
    ) -> Result<BrandReplyOutcome, ApplicationError> {
        let mut thread = self.load_thread(thread_id).await?;
        let audit = AuditContext::new(Some(thread.id.clone()), correlation_id, ACTOR);

        let mut attempts = 0;
        let replied = loop {
            match thread.stage {
                ThreadStage::Halted => {
                    return self
                        .record_reply_on_halted(&thread.id, subject, body, correlation_id, now)
                        .await;
                }
                ThreadStage::Replied => break thread.guard(),
                _ => {}
            }
            match self.advance(&thread.id, thread.guard(), StageEvent::BrandReplied, &audit, now).await?
            {
                Some(next) => break next,
                None if attempts + 1 < REPLY_RACE_ATTEMPTS => {
                    attempts += 1;
                    thread = self.load_thread(thread_id).await?;
                }
                None => {
                    let current = self.load_thread(thread_id).await?;
                    return Err(DomainError::StageMismatch {
                        thread_id: current.id,
                        expected: thread.stage,
                        actual: current.stage,
                    }
                    .into());
                }
            }
        };

        // A lost race must leave no message behind.
        let message_id = self.append_brand_message(&thread.id, subject, body, now).await?;

        let follow_up_cancelled = self.repositories.follow_ups.cancel_active(&thread.id, now).await?;
        if follow_up_cancelled {
            info!(
                event_name = "follow_up.cancelled",
                correlation_id,
                thread_id = %thread.id,
                "pending follow-up cancelled by brand reply"
            );
        }

        let (stage, cycle_job_id) = match self
            .advance(&thread.id, replied, StageEvent::ConversationReopened, &audit, now)
            .await?
        {
            Some(open) => {
                let queued = self
                    .enqueue(&thread.id, JobKind::DecisionCycle, open.stage, None, correlation_id, now)
                    .await?;
                (open.stage, Some(queued.job().id.clone()))
            }
            None => (ThreadStage::Replied, None),
        };

        Ok(BrandReplyOutcome { message_id, follow_up_cancelled, stage, cycle_job_id })
    }

    async fn record_reply_on_halted(
        &self,
        thread_id: &ThreadId,
        subject: &str,
        body: &str,
        correlation_id: &str,
        now: DateTime<Utc>,
    ) -> Result<BrandReplyOutcome, ApplicationError> {
        let message_id = self.append_brand_message(thread_id, subject, body, now).await?;
        let follow_up_cancelled = self.repositories.follow_ups.cancel_active(thread_id, now).await?;
        info!(
            event_name = "thread.reply_while_halted",
            correlation_id,
            thread_id = %thread_id,
            follow_up_cancelled,
            "brand reply recorded; thread stays halted until an operator resumes it"
        );
        Ok(BrandReplyOutcome {
            message_id,
            follow_up_cancelled,
            stage: ThreadStage::Halted,
            cycle_job_id: None,
        })
    }

    async fn append_brand_message(
        &self,
        thread_id: &ThreadId,
        subject: &str,
        body: &str,
        now: DateTime<Utc>,
    ) -> Result<MessageId, ApplicationError> {
        let message_id = MessageId(Uuid::new_v4().to_string());
        self.repositories
            .messages
            .append(NegotiationMessage {
                id: message_id.clone(),
                thread_id: thread_id.clone(),
                sender: MessageSender::Brand,
                subject: subject.to_string(),
                body: body.to_string(),
                status: MessageStatus::Received,
                created_at: now,
            })
            .await?;
        Ok(message_id)
    }

    /// Operator override for a halted thread: back to Open with a new cycle.
    pub async fn resume_halted(
        &self,
        thread_id: &ThreadId,
        correlation_id: &str,
        now: DateTime<Utc>,
    ) -> Result<EnqueueOutcome, ApplicationError> {
        let thread = self.load_thread(thread_id).await?;
        if thread.stage != ThreadStage::Halted {
            return Err(DomainError::StageMismatch {
                thread_id: thread.id,
                expected: ThreadStage::Halted,
                actual: thread.stage,
            }
            .into());
        }

        let audit = AuditContext::new(Some(thread.id.clone()), correlation_id, ACTOR);
        let Some(open) = self
            .advance(&thread.id, thread.guard(), StageEvent::OperatorResumed, &audit, now)
            .await?
        else {
            let current = self.load_thread(thread_id).await?;
            return Err(DomainError::StageMismatch {
                thread_id: current.id,
                expected: ThreadStage::Halted,
                actual: current.stage,
            }
            .into());
        };

        info!(event_name = "thread.resumed", correlation_id, thread_id = %thread.id, "halted thread resumed");
        self.enqueue(&thread.id, JobKind::DecisionCycle, open.stage, None, correlation_id, now).await
    }

    /// Turns due follow-ups into follow-up jobs. Returns how many were newly
    /// queued.
    pub async fn promote_due_follow_ups(
        &self,
        now: DateTime<Utc>,
        limit: u32,
    ) -> Result<usize, ApplicationError> {
        let due = self.repositories.follow_ups.list_due(now, limit).await?;
        let mut promoted = 0;
        for follow_up in due {
            let correlation_id = format!("follow-up-{}", follow_up.id.0);
            let outcome = self
                .enqueue(
                    &follow_up.thread_id,
                    JobKind::FollowUp,
                    ThreadStage::FollowUpScheduled,
                    Some(follow_up.id.clone()),
                    &correlation_id,
                    now,
                )
                .await?;
            if matches!(outcome, EnqueueOutcome::Enqueued(_)) {
                promoted += 1;
            }
        }
        Ok(promoted)
    }

    /// Fires a due follow-up after re-checking it and the thread are both
    /// still where the job expects.
    pub async fn fire_follow_up(
        &self,
        job: &CycleJob,
        now: DateTime<Utc>,
    ) -> Result<FollowUpOutcome, ApplicationError> {
        let skip = |reason: String| -> Result<FollowUpOutcome, ApplicationError> {
            info!(
                event_name = "follow_up.skipped",
                correlation_id = %job.correlation_id,
                thread_id = %job.thread_id,
                reason = %reason,
                "follow-up not fired"
            );
            Ok(FollowUpOutcome::Skipped { reason })
        };

        let Some(follow_up_id) = job.follow_up_id.clone() else {
            return Err(DomainError::InvariantViolation(format!(
                "follow-up job {} carries no follow-up id",
                job.id.0
            ))
            .into());
        };
        let Some(follow_up) = self.repositories.follow_ups.find_by_id(&follow_up_id).await? else {
            return skip(format!("follow-up {} no longer exists", follow_up_id.0));
        };
        if follow_up.cancelled_at.is_some() {
            return skip("follow-up was cancelled".to_string());
        }
        if follow_up.fired_at.is_some() {
            return skip("follow-up already fired".to_string());
        }

        let thread = self.load_thread(&job.thread_id).await?;
        if thread.stage != job.expected_stage {
            return skip(format!("thread is at {}", thread.stage));
        }
        if !self.repositories.follow_ups.mark_fired(&follow_up_id, now).await? {
            return skip("follow-up was cancelled before it fired".to_string());
        }

        let audit = AuditContext::new(Some(thread.id.clone()), job.correlation_id.clone(), ACTOR);
        let Some(fired) =
            self.advance(&thread.id, thread.guard(), StageEvent::FollowUpFired, &audit, now).await?
        else {
            return skip("thread moved before the follow-up fired".to_string());
        };

        let queued = self
            .enqueue(&thread.id, JobKind::DecisionCycle, fired.stage, None, &job.correlation_id, now)
            .await?;
        info!(
            event_name = "follow_up.fired",
            correlation_id = %job.correlation_id,
            thread_id = %thread.id,
            follow_up_id = %follow_up_id.0,
            "follow-up fired; decision cycle queued"
        );
        Ok(FollowUpOutcome::Fired { follow_up_id, cycle_job_id: queued.job().id.clone() })
    }

    pub async fn process_job(
        &self,
        job: &CycleJob,
        now: DateTime<Utc>,
    ) -> Result<JobOutcome, ApplicationError> {
        match job.kind {
            JobKind::DecisionCycle => self
                .run_cycle(&job.thread_id, job.expected_stage, &job.correlation_id, now)
                .await
                .map(JobOutcome::Cycle),
            JobKind::FollowUp => self.fire_follow_up(job, now).await.map(JobOutcome::FollowUp),
        }
    }

    pub(crate) async fn enqueue(
        &self,
        thread_id: &ThreadId,
        kind: JobKind,
        expected_stage: ThreadStage,
        follow_up_id: Option<FollowUpId>,
        correlation_id: &str,
        now: DateTime<Utc>,
    ) -> Result<EnqueueOutcome, ApplicationError> {
        let step = self.jobs.create_job(
            thread_id.clone(),
            kind,
            expected_stage,
            follow_up_id,
            correlation_id,
            now,
        );
        let outcome = self.repositories.jobs.enqueue(step.job).await?;
        if matches!(outcome, EnqueueOutcome::Enqueued(_)) {
            self.repositories.jobs.append_transition(step.transition).await?;
        }
        Ok(outcome)
    }

    async fn load_thread(&self, thread_id: &ThreadId) -> Result<NegotiationThread, ApplicationError> {
        self.repositories
            .threads
            .find_by_id(thread_id)
            .await?
            .ok_or_else(|| DomainError::ThreadNotFound(thread_id.clone()).into())
    }

    async fn stale(
        &self,
        thread_id: &ThreadId,
        expected: ThreadStage,
    ) -> Result<CycleOutcome, ApplicationError> {
        let current = self.load_thread(thread_id).await?;
        info!(
            event_name = "cycle.stage_race_lost",
            thread_id = %thread_id,
            expected = expected.as_str(),
            actual = current.stage.as_str(),
            "another writer moved the thread"
        );
        Ok(CycleOutcome::Stale { expected, actual: current.stage })
    }

    /// Validates the event against the stage table, then writes it only if
    /// the stored guard still matches. `None` means another writer won.
    async fn advance(
        &self,
        thread_id: &ThreadId,
        guard: StageGuard,
        event: StageEvent,
        audit: &AuditContext,
        now: DateTime<Utc>,
    ) -> Result<Option<StageGuard>, ApplicationError> {
        let transition = self
            .stages
            .apply_with_audit(guard.stage, event, self.audit.as_ref(), audit)
            .map_err(DomainError::from)?;
        Ok(self
            .repositories
            .threads
            .compare_and_set_stage(thread_id, guard, transition.to, now)
            .await?)
    }

    async fn roll_back(
        &self,
        thread_id: &ThreadId,
        guard: StageGuard,
        origin: ThreadStage,
        audit: &AuditContext,
        now: DateTime<Utc>,
    ) {
        match self.advance(thread_id, guard, StageEvent::CycleFailed { origin }, audit, now).await {
            Ok(Some(_)) => info!(
                event_name = "cycle.rolled_back",
                thread_id = %thread_id,
                to = origin.as_str(),
                "thread returned to its starting stage"
            ),
            Ok(None) => warn!(
                event_name = "cycle.rollback_skipped",
                thread_id = %thread_id,
                "thread moved before rollback"
            ),
            Err(error) => warn!(
                event_name = "cycle.rollback_failed",
                thread_id = %thread_id,
                error = %error,
                "could not roll thread back"
            ),
        }
    }

    async fn append_decision(
        &self,
        draft: DecisionDraft,
        audit: &AuditContext,
        now: DateTime<Utc>,
    ) -> Result<DecisionLogEntry, ApplicationError> {
        let previous = self.repositories.decisions.latest_for_thread(&draft.thread_id).await?;
        let entry = decision_chain::seal(draft, previous.as_ref(), now);
        self.repositories.decisions.append(entry.clone()).await?;

        self.audit.emit(
            AuditEvent::new(audit, "decision.recorded", AuditCategory::Decision, AuditOutcome::Success)
                .with_metadata("decision_type", entry.decision_type.as_str())
                .with_metadata("sequence", entry.sequence.to_string())
                .with_metadata("entry_hash", entry.entry_hash.clone()),
        );
        Ok(entry)
    }
}

fn describe_finding(finding: &ConflictFinding) -> String {
    match &finding.commitment_id {
        Some(commitment) => format!("{:?} with {}: {}", finding.kind, commitment.0, finding.detail),
        None => format!("{:?}: {}", finding.kind, finding.detail),
    }
}

fn describe_blocked(blocked: &BlockedCandidate) -> String {
    let findings: Vec<String> = blocked.findings.iter().map(describe_finding).collect();
    format!("{} (score {:.2}) blocked: {}", blocked.archetype, blocked.score, findings.join("; "))
}
