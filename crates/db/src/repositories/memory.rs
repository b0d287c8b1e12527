use std::collections::HashMap;

use chrono::{DateTime, Utc};
use tokio::sync::RwLock;

use parley_core::domain::commitment::Commitment;
use parley_core::domain::decision::DecisionLogEntry;
use parley_core::domain::follow_up::{FollowUpId, ScheduledFollowUp};
use parley_core::domain::job::{CycleJob, CycleJobId, JobState, JobTransition};
use parley_core::domain::message::NegotiationMessage;
use parley_core::domain::policy::AgentPolicy;
use parley_core::domain::scenario::ScenarioCandidate;
use parley_core::domain::thread::{
    NegotiationThread, StageGuard, TalentId, ThreadId, ThreadStage,
};

use super::{
    CandidateRepository, CommitmentRepository, DecisionLogRepository, EnqueueOutcome,
    FollowUpRepository, JobQueueRepository, MessageRepository, PolicyRepository,
    RepositoryError, ThreadRepository,
};

#[derive(Default)]
pub struct InMemoryThreadRepository {
    threads: RwLock<HashMap<String, NegotiationThread>>,
}

#[async_trait::async_trait]
impl ThreadRepository for InMemoryThreadRepository {
    async fn find_by_id(&self, id: &ThreadId) -> Result<Option<NegotiationThread>, RepositoryError> {
        let threads = self.threads.read().await;
        Ok(threads.get(&id.0).cloned())
    }

    async fn list_by_stage(
        &self,
        stage: ThreadStage,
    ) -> Result<Vec<NegotiationThread>, RepositoryError> {
        let threads = self.threads.read().await;
        let mut matching: Vec<_> =
            threads.values().filter(|thread| thread.stage == stage).cloned().collect();
        matching.sort_by(|a, b| a.updated_at.cmp(&b.updated_at).then_with(|| a.id.cmp(&b.id)));
        Ok(matching)
    }

    async fn save(&self, thread: NegotiationThread) -> Result<(), RepositoryError> {
        let mut threads = self.threads.write().await;
        threads.insert(thread.id.0.clone(), thread);
        Ok(())
    }

    async fn compare_and_set_stage(
        &self,
        id: &ThreadId,
        expected: StageGuard,
        next: ThreadStage,
        now: DateTime<Utc>,
    ) -> Result<Option<StageGuard>, RepositoryError> {
        let mut threads = self.threads.write().await;
        let Some(thread) = threads.get_mut(&id.0) else {
            return Ok(None);
        };
        if thread.guard() != expected {
            return Ok(None);
        }
        thread.stage = next;
        thread.stage_version = expected.stage_version.saturating_add(1);
        thread.updated_at = now;
        Ok(Some(thread.guard()))
    }
}

#[derive(Default)]
pub struct InMemoryMessageRepository {
    messages: RwLock<Vec<NegotiationMessage>>,
}

#[async_trait::async_trait]
impl MessageRepository for InMemoryMessageRepository {
    async fn append(&self, message: NegotiationMessage) -> Result<(), RepositoryError> {
        let mut messages = self.messages.write().await;
        if messages.iter().any(|existing| existing.id == message.id) {
            return Err(RepositoryError::Conflict(format!("message {} already exists", message.id.0)));
        }
        messages.push(message);
        Ok(())
    }

    async fn list_for_thread(
        &self,
        thread_id: &ThreadId,
    ) -> Result<Vec<NegotiationMessage>, RepositoryError> {
        let messages = self.messages.read().await;
        let mut history: Vec<_> =
            messages.iter().filter(|message| &message.thread_id == thread_id).cloned().collect();
        // Stable sort keeps insertion order for equal timestamps.
        history.sort_by_key(|message| message.created_at);
        Ok(history)
    }
}

#[derive(Default)]
pub struct InMemoryCandidateRepository {
    candidates: RwLock<HashMap<String, Vec<ScenarioCandidate>>>,
}

#[async_trait::async_trait]
impl CandidateRepository for InMemoryCandidateRepository {
    async fn replace_for_thread(
        &self,
        thread_id: &ThreadId,
        ranked: Vec<ScenarioCandidate>,
    ) -> Result<(), RepositoryError> {
        let mut candidates = self.candidates.write().await;
        candidates.insert(thread_id.0.clone(), ranked);
        Ok(())
    }

    async fn list_for_thread(
        &self,
        thread_id: &ThreadId,
    ) -> Result<Vec<ScenarioCandidate>, RepositoryError> {
        let candidates = self.candidates.read().await;
        Ok(candidates.get(&thread_id.0).cloned().unwrap_or_default())
    }
}

#[derive(Default)]
pub struct InMemoryPolicyRepository {
    policies: RwLock<HashMap<String, AgentPolicy>>,
}

#[async_trait::async_trait]
impl PolicyRepository for InMemoryPolicyRepository {
    async fn find_for_talent(
        &self,
        talent_id: &TalentId,
    ) -> Result<Option<AgentPolicy>, RepositoryError> {
        let policies = self.policies.read().await;
        Ok(policies.get(&talent_id.0).cloned())
    }

    async fn save(&self, policy: AgentPolicy) -> Result<(), RepositoryError> {
        let mut policies = self.policies.write().await;
        policies.insert(policy.talent_id.0.clone(), policy);
        Ok(())
    }
}

#[derive(Default)]
pub struct InMemoryCommitmentRepository {
    commitments: RwLock<HashMap<String, Commitment>>,
}

#[async_trait::async_trait]
impl CommitmentRepository for InMemoryCommitmentRepository {
    async fn list_for_talent(
        &self,
        talent_id: &TalentId,
    ) -> Result<Vec<Commitment>, RepositoryError> {
        let commitments = self.commitments.read().await;
        let mut listed: Vec<_> = commitments
            .values()
            .filter(|commitment| &commitment.talent_id == talent_id)
            .cloned()
            .collect();
        listed.sort_by(|a, b| a.start_date.cmp(&b.start_date).then_with(|| a.id.0.cmp(&b.id.0)));
        Ok(listed)
    }

    async fn save(&self, commitment: Commitment) -> Result<(), RepositoryError> {
        let mut commitments = self.commitments.write().await;
        commitments.insert(commitment.id.0.clone(), commitment);
        Ok(())
    }
}

#[derive(Default)]
pub struct InMemoryDecisionLogRepository {
    entries: RwLock<HashMap<String, Vec<DecisionLogEntry>>>,
}

#[async_trait::async_trait]
impl DecisionLogRepository for InMemoryDecisionLogRepository {
    async fn append(&self, entry: DecisionLogEntry) -> Result<(), RepositoryError> {
        let mut entries = self.entries.write().await;
        let chain = entries.entry(entry.thread_id.0.clone()).or_default();
        if chain.iter().any(|existing| existing.sequence == entry.sequence) {
            return Err(RepositoryError::Conflict(format!(
                "decision log for thread {} already has sequence {}",
                entry.thread_id, entry.sequence
            )));
        }
        chain.push(entry);
        chain.sort_by_key(|existing| existing.sequence);
        Ok(())
    }

    async fn latest_for_thread(
        &self,
        thread_id: &ThreadId,
    ) -> Result<Option<DecisionLogEntry>, RepositoryError> {
        let entries = self.entries.read().await;
        Ok(entries.get(&thread_id.0).and_then(|chain| chain.last().cloned()))
    }

    async fn list_for_thread(
        &self,
        thread_id: &ThreadId,
    ) -> Result<Vec<DecisionLogEntry>, RepositoryError> {
        let entries = self.entries.read().await;
        Ok(entries.get(&thread_id.0).cloned().unwrap_or_default())
    }
}

#[derive(Default)]
pub struct InMemoryFollowUpRepository {
    follow_ups: RwLock<HashMap<String, ScheduledFollowUp>>,
}

#[async_trait::async_trait]
impl FollowUpRepository for InMemoryFollowUpRepository {
    async fn schedule_if_absent(
        &self,
        candidate: ScheduledFollowUp,
    ) -> Result<ScheduledFollowUp, RepositoryError> {
        let mut follow_ups = self.follow_ups.write().await;
        let active = follow_ups.values().find(|existing| {
            existing.thread_id == candidate.thread_id && existing.is_active()
        });
        if let Some(active) = active {
            return Ok(active.clone());
        }
        follow_ups.insert(candidate.id.0.clone(), candidate.clone());
        Ok(candidate)
    }

    async fn find_by_id(
        &self,
        id: &FollowUpId,
    ) -> Result<Option<ScheduledFollowUp>, RepositoryError> {
        let follow_ups = self.follow_ups.read().await;
        Ok(follow_ups.get(&id.0).cloned())
    }

    async fn find_active(
        &self,
        thread_id: &ThreadId,
    ) -> Result<Option<ScheduledFollowUp>, RepositoryError> {
        let follow_ups = self.follow_ups.read().await;
        Ok(follow_ups
            .values()
            .find(|existing| &existing.thread_id == thread_id && existing.is_active())
            .cloned())
    }

    async fn cancel_active(
        &self,
        thread_id: &ThreadId,
        now: DateTime<Utc>,
    ) -> Result<bool, RepositoryError> {
        let mut follow_ups = self.follow_ups.write().await;
        let mut cancelled = false;
        for follow_up in follow_ups.values_mut() {
            if &follow_up.thread_id == thread_id && follow_up.is_active() {
                follow_up.cancelled_at = Some(now);
                cancelled = true;
            }
        }
        Ok(cancelled)
    }

    async fn list_due(
        &self,
        now: DateTime<Utc>,
        limit: u32,
    ) -> Result<Vec<ScheduledFollowUp>, RepositoryError> {
        let follow_ups = self.follow_ups.read().await;
        let mut due: Vec<_> =
            follow_ups.values().filter(|follow_up| follow_up.is_due(now)).cloned().collect();
        due.sort_by(|a, b| a.due_at.cmp(&b.due_at).then_with(|| a.id.0.cmp(&b.id.0)));
        due.truncate(usize::try_from(limit).unwrap_or(usize::MAX));
        Ok(due)
    }

    async fn mark_fired(&self, id: &FollowUpId, now: DateTime<Utc>) -> Result<bool, RepositoryError> {
        let mut follow_ups = self.follow_ups.write().await;
        match follow_ups.get_mut(&id.0) {
            Some(follow_up) if follow_up.is_active() => {
                follow_up.fired_at = Some(now);
                Ok(true)
            }
            _ => Ok(false),
        }
    }
}

#[derive(Default)]
pub struct InMemoryJobQueueRepository {
    jobs: RwLock<HashMap<String, CycleJob>>,
    transitions: RwLock<Vec<JobTransition>>,
}

#[async_trait::async_trait]
impl JobQueueRepository for InMemoryJobQueueRepository {
    async fn find_by_id(&self, id: &CycleJobId) -> Result<Option<CycleJob>, RepositoryError> {
        let jobs = self.jobs.read().await;
        Ok(jobs.get(&id.0).cloned())
    }

    async fn enqueue(&self, job: CycleJob) -> Result<EnqueueOutcome, RepositoryError> {
        let mut jobs = self.jobs.write().await;
        let pending = jobs.values().find(|existing| {
            existing.thread_id == job.thread_id
                && existing.kind == job.kind
                && existing.state.is_pending()
        });
        if let Some(pending) = pending {
            return Ok(EnqueueOutcome::AlreadyPending(pending.clone()));
        }
        if jobs.contains_key(&job.id.0) {
            return Err(RepositoryError::Conflict(format!("cycle job {} already exists", job.id.0)));
        }
        jobs.insert(job.id.0.clone(), job.clone());
        Ok(EnqueueOutcome::Enqueued(job))
    }

    async fn list_claimable(
        &self,
        now: DateTime<Utc>,
        limit: u32,
    ) -> Result<Vec<CycleJob>, RepositoryError> {
        let jobs = self.jobs.read().await;
        let mut claimable: Vec<_> = jobs
            .values()
            .filter(|job| {
                matches!(job.state, JobState::Queued | JobState::RetryableFailed)
                    && job.available_at <= now
            })
            .cloned()
            .collect();
        claimable.sort_by(|a, b| {
            a.available_at.cmp(&b.available_at).then_with(|| a.created_at.cmp(&b.created_at))
        });
        claimable.truncate(usize::try_from(limit).unwrap_or(usize::MAX));
        Ok(claimable)
    }

    async fn list_running(&self) -> Result<Vec<CycleJob>, RepositoryError> {
        let jobs = self.jobs.read().await;
        let mut running: Vec<_> =
            jobs.values().filter(|job| job.state == JobState::Running).cloned().collect();
        running.sort_by_key(|job| job.claimed_at);
        Ok(running)
    }

    async fn list_for_thread(&self, thread_id: &ThreadId) -> Result<Vec<CycleJob>, RepositoryError> {
        let jobs = self.jobs.read().await;
        let mut listed: Vec<_> =
            jobs.values().filter(|job| &job.thread_id == thread_id).cloned().collect();
        listed.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.0.cmp(&b.id.0)));
        Ok(listed)
    }

    async fn save_if_version(
        &self,
        job: CycleJob,
        expected_version: u32,
    ) -> Result<bool, RepositoryError> {
        let mut jobs = self.jobs.write().await;
        match jobs.get_mut(&job.id.0) {
            Some(stored) if stored.state_version == expected_version => {
                *stored = job;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn append_transition(&self, transition: JobTransition) -> Result<(), RepositoryError> {
        let mut transitions = self.transitions.write().await;
        transitions.push(transition);
        Ok(())
    }

    async fn list_transitions(
        &self,
        job_id: &CycleJobId,
    ) -> Result<Vec<JobTransition>, RepositoryError> {
        let transitions = self.transitions.read().await;
        Ok(transitions.iter().filter(|transition| &transition.job_id == job_id).cloned().collect())
    }
}
