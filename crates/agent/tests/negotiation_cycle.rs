use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};

use parley_agent::oracle::ScriptedOracle;
use parley_agent::ports::{DeliveryKind, MailError, OpsNoticeKind, RecordingMailTransport, RecordingOpsNotifier};
use parley_agent::runtime::{CycleOutcome, NegotiationRuntime};
use parley_agent::worker::{JobRunner, WorkerSettings};
use parley_core::config::NegotiationConfig;
use parley_core::domain::decision::DecisionType;
use parley_core::domain::job::{JobKind, JobState};
use parley_core::domain::message::{MessageSender, MessageStatus};
use parley_core::domain::thread::{NegotiationThread, StageGuard, ThreadId, ThreadStage};
use parley_core::errors::{ApplicationError, DomainError};
use parley_core::negotiation::decision_chain;
use parley_db::fixtures::DemoSeedDataset;
use parley_db::repositories::{
    EnqueueOutcome, RepositoryError, RepositorySet, ThreadRepository,
};

const AUTOSEND: &str = "T-DEMO-AUTOSEND";
const SANDBOX: &str = "T-DEMO-SANDBOX";
const HALT: &str = "T-DEMO-HALT";

struct Harness {
    runner: JobRunner,
    runtime: Arc<NegotiationRuntime>,
    mail: Arc<RecordingMailTransport>,
    ops: Arc<RecordingOpsNotifier>,
    oracle: Arc<ScriptedOracle>,
    start: DateTime<Utc>,
}

impl Harness {
    async fn seeded() -> Self {
        Self::seeded_with_threads(|threads| threads).await
    }

    /// Seeds the demo data, then lets the test wrap the thread repository.
    async fn seeded_with_threads(
        wrap: impl FnOnce(Arc<dyn ThreadRepository>) -> Arc<dyn ThreadRepository>,
    ) -> Self {
        let start = DateTime::parse_from_rfc3339("2026-03-01T09:00:00Z")
            .expect("timestamp")
            .with_timezone(&Utc);
        let mut repositories = RepositorySet::in_memory();
        DemoSeedDataset::load(&repositories, start).await.expect("seed");
        repositories.threads = wrap(repositories.threads.clone());

        let oracle = Arc::new(ScriptedOracle::new());
        let mail = Arc::new(RecordingMailTransport::new());
        let ops = Arc::new(RecordingOpsNotifier::new());
        let runtime = Arc::new(NegotiationRuntime::new(
            repositories,
            oracle.clone(),
            oracle.clone(),
            mail.clone(),
            ops.clone(),
            &NegotiationConfig::default(),
        ));
        let runner = JobRunner::new(
            runtime.clone(),
            WorkerSettings { worker_id: "worker-test".to_string(), batch_size: 10 },
        );
        Self { runner, runtime, mail, ops, oracle, start }
    }

    fn repositories(&self) -> &RepositorySet {
        self.runtime.repositories()
    }

    async fn stage(&self, thread: &str) -> ThreadStage {
        self.repositories()
            .threads
            .find_by_id(&id(thread))
            .await
            .expect("load thread")
            .expect("thread exists")
            .stage
    }

    async fn dispatch(&self, thread: &str) {
        self.runtime.enqueue_cycle(&id(thread), "corr-test", self.start).await.expect("enqueue");
        self.runner.run_once(self.start).await.expect("run worker");
    }
}

fn id(thread: &str) -> ThreadId {
    ThreadId(thread.to_string())
}

/// Delegates to the wrapped store, but lets a test decide what happens to
/// one stage write.
struct InterceptedThreads {
    inner: Arc<dyn ThreadRepository>,
    intercept: ThreadStage,
    behaviour: Interception,
    fired: AtomicBool,
}

#[derive(Clone, Copy)]
enum Interception {
    /// Every write to the stage loses to another writer.
    AlwaysLose,
    /// A brand reply lands just before the first write to the stage.
    ReplyFirst,
}

impl InterceptedThreads {
    fn wrap(
        inner: Arc<dyn ThreadRepository>,
        intercept: ThreadStage,
        behaviour: Interception,
    ) -> Arc<dyn ThreadRepository> {
        Arc::new(Self { inner, intercept, behaviour, fired: AtomicBool::new(false) })
    }
}

#[async_trait]
impl ThreadRepository for InterceptedThreads {
    async fn find_by_id(&self, id: &ThreadId) -> Result<Option<NegotiationThread>, RepositoryError> {
        self.inner.find_by_id(id).await
    }

    async fn list_by_stage(
        &self,
        stage: ThreadStage,
    ) -> Result<Vec<NegotiationThread>, RepositoryError> {
        self.inner.list_by_stage(stage).await
    }

    async fn save(&self, thread: NegotiationThread) -> Result<(), RepositoryError> {
        self.inner.save(thread).await
    }

    async fn compare_and_set_stage(
        &self,
        id: &ThreadId,
        expected: StageGuard,
        next: ThreadStage,
        now: DateTime<Utc>,
    ) -> Result<Option<StageGuard>, RepositoryError> {
        if next == self.intercept {
            match self.behaviour {
                Interception::AlwaysLose => return Ok(None),
                Interception::ReplyFirst if !self.fired.swap(true, Ordering::SeqCst) => {
                    self.inner.compare_and_set_stage(id, expected, ThreadStage::Replied, now).await?;
                }
                Interception::ReplyFirst => {}
            }
        }
        self.inner.compare_and_set_stage(id, expected, next, now).await
    }
}

#[tokio::test]
async fn compliant_auto_send_thread_sends_and_schedules_one_follow_up() {
    let harness = Harness::seeded().await;
    harness.dispatch(AUTOSEND).await;

    assert_eq!(harness.stage(AUTOSEND).await, ThreadStage::FollowUpScheduled);

    let deliveries = harness.mail.deliveries();
    assert_eq!(deliveries.len(), 1);
    assert_eq!(deliveries[0].0, DeliveryKind::Sent);
    assert_eq!(deliveries[0].1.subject, "Re: Lumen Skincare x talent-ava");

    let repositories = harness.repositories();
    let decisions = repositories.decisions.list_for_thread(&id(AUTOSEND)).await.expect("decisions");
    assert_eq!(decisions.len(), 1);
    assert_eq!(decisions[0].decision_type, DecisionType::Send);
    assert_eq!(decisions[0].policy_compliant, Some(true));
    assert!(decision_chain::verify(&id(AUTOSEND), &decisions).valid);

    let messages = repositories.messages.list_for_thread(&id(AUTOSEND)).await.expect("messages");
    let last = messages.last().expect("ai reply stored");
    assert_eq!(last.sender, MessageSender::Ai);
    assert_eq!(last.status, MessageStatus::Sent);

    let candidates = repositories.candidates.list_for_thread(&id(AUTOSEND)).await.expect("candidates");
    assert_eq!(candidates.len(), 3);

    let follow_up = repositories
        .follow_ups
        .find_active(&id(AUTOSEND))
        .await
        .expect("follow-up")
        .expect("active follow-up");
    assert_eq!(follow_up.due_at, harness.start + Duration::hours(48));
    assert!(harness.ops.notices().is_empty());
}

#[tokio::test]
async fn sandbox_policy_only_drafts() {
    let harness = Harness::seeded().await;
    harness.dispatch(SANDBOX).await;

    let deliveries = harness.mail.deliveries();
    assert_eq!(deliveries.len(), 1);
    assert_eq!(deliveries[0].0, DeliveryKind::Drafted);

    let decisions =
        harness.repositories().decisions.list_for_thread(&id(SANDBOX)).await.expect("decisions");
    assert_eq!(decisions[0].decision_type, DecisionType::Draft);
    assert!(decisions[0].reasoning.contains("sandbox mode forces draft"));
    assert_eq!(harness.stage(SANDBOX).await, ThreadStage::FollowUpScheduled);
}

#[tokio::test]
async fn exclusivity_on_every_candidate_halts_without_a_reply() {
    let harness = Harness::seeded().await;
    harness.dispatch(HALT).await;

    assert_eq!(harness.stage(HALT).await, ThreadStage::Halted);
    assert!(harness.mail.deliveries().is_empty());
    assert_eq!(harness.oracle.compose_calls(), 0);

    let repositories = harness.repositories();
    assert_eq!(repositories.follow_ups.find_active(&id(HALT)).await.expect("follow-up"), None);

    let decisions = repositories.decisions.list_for_thread(&id(HALT)).await.expect("decisions");
    assert_eq!(decisions.len(), 1);
    assert_eq!(decisions[0].decision_type, DecisionType::Halt);
    assert_eq!(decisions[0].policy_compliant, None);
    assert!(decisions[0].chosen_candidate.is_none());
    assert!(decisions[0].reasoning.contains("C-DEMO-GAMING-EXCL"));

    let notices = harness.ops.notices();
    assert_eq!(notices.len(), 1);
    assert_eq!(notices[0].kind, OpsNoticeKind::Halt);
}

#[tokio::test]
async fn operator_can_resume_a_halted_thread_only_once() {
    let harness = Harness::seeded().await;
    harness.dispatch(HALT).await;

    let queued = harness
        .runtime
        .resume_halted(&id(HALT), "corr-resume", harness.start)
        .await
        .expect("resume");
    assert!(matches!(queued, EnqueueOutcome::Enqueued(_)));
    assert_eq!(harness.stage(HALT).await, ThreadStage::Open);

    let error = harness
        .runtime
        .resume_halted(&id(HALT), "corr-resume", harness.start)
        .await
        .expect_err("thread is no longer halted");
    assert!(matches!(error, ApplicationError::Domain(DomainError::StageMismatch { .. })));
}

#[tokio::test]
async fn brand_reply_cancels_pending_follow_up_and_reopens_thread() {
    let harness = Harness::seeded().await;
    harness.dispatch(AUTOSEND).await;

    let reply_at = harness.start + Duration::hours(3);
    let outcome = harness
        .runtime
        .record_brand_reply(&id(AUTOSEND), "Re: Lumen", "Could you do £1,300?", "corr-reply", reply_at)
        .await
        .expect("record reply");

    assert!(outcome.follow_up_cancelled);
    assert_eq!(outcome.stage, ThreadStage::Open);
    assert!(outcome.cycle_job_id.is_some());

    let repositories = harness.repositories();
    assert_eq!(repositories.follow_ups.find_active(&id(AUTOSEND)).await.expect("active"), None);

    // Past the original due time the cancelled follow-up is never promoted.
    let later = harness.start + Duration::hours(60);
    assert_eq!(harness.runtime.promote_due_follow_ups(later, 10).await.expect("promote"), 0);

    let jobs = repositories.jobs.list_for_thread(&id(AUTOSEND)).await.expect("jobs");
    assert!(jobs.iter().all(|job| job.kind == JobKind::DecisionCycle));
}

#[tokio::test]
async fn due_follow_up_fires_once_and_starts_a_new_cycle() {
    let harness = Harness::seeded().await;
    harness.dispatch(AUTOSEND).await;

    let due = harness.start + Duration::hours(49);
    let first = harness.runner.run_once(due).await.expect("fire follow-up");
    assert_eq!(first.promoted, 1);
    assert_eq!(harness.stage(AUTOSEND).await, ThreadStage::FollowUpFired);

    harness.runner.run_once(due).await.expect("run follow-up cycle");
    assert_eq!(harness.stage(AUTOSEND).await, ThreadStage::FollowUpScheduled);

    let idle = harness.runner.run_once(due).await.expect("idle pass");
    assert_eq!(idle.promoted, 0);
    assert_eq!(idle.claimed, 0);

    assert_eq!(harness.mail.deliveries().len(), 2);
    let decisions =
        harness.repositories().decisions.list_for_thread(&id(AUTOSEND)).await.expect("decisions");
    assert_eq!(decisions.iter().map(|entry| entry.sequence).collect::<Vec<_>>(), vec![1, 2]);
    assert!(decision_chain::verify(&id(AUTOSEND), &decisions).valid);
}

#[tokio::test]
async fn cycle_for_a_stage_the_thread_has_left_is_a_no_op() {
    let harness = Harness::seeded().await;

    let outcome = harness
        .runtime
        .run_cycle(&id(AUTOSEND), ThreadStage::FollowUpFired, "corr-stale", harness.start)
        .await
        .expect("stale cycle");

    assert_eq!(
        outcome,
        CycleOutcome::Stale { expected: ThreadStage::FollowUpFired, actual: ThreadStage::Open }
    );
    assert_eq!(harness.oracle.predict_calls(), 0);
    assert!(harness.mail.deliveries().is_empty());
}

#[tokio::test]
async fn mail_outage_rolls_thread_back_and_retries_the_job() {
    let harness = Harness::seeded().await;
    harness.mail.fail_with(Some(MailError::Unavailable("smtp down".to_string())));
    harness.dispatch(AUTOSEND).await;

    assert_eq!(harness.stage(AUTOSEND).await, ThreadStage::Open);
    let repositories = harness.repositories();
    assert!(repositories.decisions.list_for_thread(&id(AUTOSEND)).await.expect("log").is_empty());

    let jobs = repositories.jobs.list_for_thread(&id(AUTOSEND)).await.expect("jobs");
    assert_eq!(jobs.len(), 1);
    assert_eq!(jobs[0].state, JobState::RetryableFailed);
    assert_eq!(jobs[0].retry_count, 1);

    harness.mail.fail_with(None);
    let retry_at = jobs[0].available_at;
    let report = harness.runner.run_once(retry_at).await.expect("retry");
    assert_eq!(report.completed, 1);
    assert_eq!(harness.stage(AUTOSEND).await, ThreadStage::FollowUpScheduled);
}

#[tokio::test]
async fn enqueue_rejects_a_halted_thread() {
    let harness = Harness::seeded().await;
    harness.dispatch(HALT).await;

    let error = harness
        .runtime
        .enqueue_cycle(&id(HALT), "corr-again", harness.start)
        .await
        .expect_err("halted threads need an operator");
    assert!(matches!(error, ApplicationError::Domain(DomainError::StageMismatch { .. })));
}

#[tokio::test]
async fn brand_reply_on_halted_thread_waits_for_the_operator() {
    let harness = Harness::seeded().await;
    harness.dispatch(HALT).await;

    let reply_at = harness.start + Duration::hours(2);
    let outcome = harness
        .runtime
        .record_brand_reply(&id(HALT), "Re: stream", "We can move the date back.", "corr-reply", reply_at)
        .await
        .expect("record reply");
    assert_eq!(outcome.stage, ThreadStage::Halted);
    assert_eq!(outcome.cycle_job_id, None);
    assert_eq!(harness.stage(HALT).await, ThreadStage::Halted);

    let repositories = harness.repositories();
    let messages = repositories.messages.list_for_thread(&id(HALT)).await.expect("messages");
    assert_eq!(messages.last().map(|message| message.body.as_str()), Some("We can move the date back."));

    let report = harness.runner.run_once(reply_at).await.expect("worker pass");
    assert_eq!(report.claimed, 0);
    assert_eq!(harness.stage(HALT).await, ThreadStage::Halted);
    let decisions = repositories.decisions.list_for_thread(&id(HALT)).await.expect("decisions");
    assert_eq!(decisions.len(), 1);
    assert!(harness.mail.deliveries().is_empty());
}

#[tokio::test]
async fn cycle_on_dispatched_thread_only_schedules_the_follow_up() {
    let harness = Harness::seeded().await;
    let repositories = harness.repositories();
    let thread = repositories.threads.find_by_id(&id(AUTOSEND)).await.expect("load").expect("thread");
    repositories
        .threads
        .compare_and_set_stage(&thread.id, thread.guard(), ThreadStage::Dispatched, harness.start)
        .await
        .expect("cas")
        .expect("stage written");

    let outcome = harness
        .runtime
        .run_cycle(&id(AUTOSEND), ThreadStage::Open, "corr-resume-scheduling", harness.start)
        .await
        .expect("cycle");

    let active = repositories
        .follow_ups
        .find_active(&id(AUTOSEND))
        .await
        .expect("follow-up")
        .expect("one active follow-up");
    assert_eq!(outcome, CycleOutcome::SchedulingCompleted { follow_up_id: active.id });
    assert_eq!(harness.stage(AUTOSEND).await, ThreadStage::FollowUpScheduled);
    assert_eq!(harness.oracle.predict_calls(), 0);
    assert!(harness.mail.deliveries().is_empty());
}

#[tokio::test]
async fn reply_between_dispatch_and_scheduling_cancels_the_follow_up() {
    let harness = Harness::seeded_with_threads(|threads| {
        InterceptedThreads::wrap(threads, ThreadStage::FollowUpScheduled, Interception::ReplyFirst)
    })
    .await;

    let outcome = harness
        .runtime
        .run_cycle(&id(AUTOSEND), ThreadStage::Open, "corr-race", harness.start)
        .await
        .expect("cycle");
    assert_eq!(
        outcome,
        CycleOutcome::Stale { expected: ThreadStage::Dispatched, actual: ThreadStage::Replied }
    );
    assert_eq!(harness.mail.deliveries().len(), 1);

    let repositories = harness.repositories();
    assert_eq!(repositories.follow_ups.find_active(&id(AUTOSEND)).await.expect("active"), None);
    let later = harness.start + Duration::hours(60);
    assert_eq!(harness.runtime.promote_due_follow_ups(later, 10).await.expect("promote"), 0);
}

#[tokio::test]
async fn lost_reply_races_leave_history_untouched() {
    let harness = Harness::seeded_with_threads(|threads| {
        InterceptedThreads::wrap(threads, ThreadStage::Replied, Interception::AlwaysLose)
    })
    .await;
    let repositories = harness.repositories();
    let before = repositories.messages.list_for_thread(&id(AUTOSEND)).await.expect("messages");

    let error = harness
        .runtime
        .record_brand_reply(&id(AUTOSEND), "Re: Lumen", "Any update?", "corr-lost", harness.start)
        .await
        .expect_err("every stage write loses");
    assert!(matches!(error, ApplicationError::Domain(DomainError::StageMismatch { .. })));

    let after = repositories.messages.list_for_thread(&id(AUTOSEND)).await.expect("messages");
    assert_eq!(after.len(), before.len());
    assert_eq!(harness.stage(AUTOSEND).await, ThreadStage::Open);
}
