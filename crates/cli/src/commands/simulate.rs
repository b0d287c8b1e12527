//! Dry run of the full decision pipeline: demo threads in an in-memory store,
//! a scripted oracle, and mail/ops sinks that only record.

use std::sync::Arc;

use anyhow::{bail, Context};
use chrono::Utc;
use parley_agent::oracle::ScriptedOracle;
use parley_agent::ports::{DeliveryKind, RecordingMailTransport, RecordingOpsNotifier};
use parley_agent::runtime::NegotiationRuntime;
use parley_agent::worker::{JobRunner, WorkerSettings};
use parley_core::config::NegotiationConfig;
use parley_core::domain::thread::{ThreadId, ThreadStage};
use parley_core::negotiation::decision_chain;
use parley_db::{DemoSeedDataset, RepositorySet};
use serde::Serialize;

use crate::commands::{block_on_current_thread, CommandResult};

#[derive(Debug, Serialize)]
struct SimulationReport {
    command: &'static str,
    status: &'static str,
    threads: Vec<ThreadReport>,
}

#[derive(Debug, Serialize)]
struct ThreadReport {
    thread_id: String,
    scenario: &'static str,
    final_stage: ThreadStage,
    decision_type: Option<String>,
    chosen_archetype: Option<String>,
    anchor_rate: Option<String>,
    reasoning: Vec<String>,
    delivery: Option<String>,
    message: Option<String>,
    ops_notices: usize,
    chain_valid: bool,
}

pub fn run(thread: Option<&str>) -> CommandResult {
    let result = block_on_current_thread("simulate", simulate(thread));
    match result {
        Ok(Ok(threads)) => {
            let report = SimulationReport { command: "simulate", status: "ok", threads };
            match serde_json::to_string_pretty(&report) {
                Ok(output) => CommandResult { exit_code: 0, output },
                Err(error) => CommandResult::failure("simulate", "serialization", error.to_string(), 5),
            }
        }
        Ok(Err(error)) => {
            CommandResult::failure("simulate", "simulation", format!("{error:#}"), 4)
        }
        Err(failure) => failure,
    }
}

async fn simulate(only: Option<&str>) -> anyhow::Result<Vec<ThreadReport>> {
    let now = Utc::now();
    let repositories = RepositorySet::in_memory();
    let seeded = DemoSeedDataset::load(&repositories, now).await.context("loading demo dataset")?;

    let selected: Vec<_> = seeded
        .threads_seeded
        .iter()
        .filter(|seed| only.map_or(true, |thread_id| seed.thread_id == thread_id))
        .collect();
    if selected.is_empty() {
        bail!("unknown demo thread `{}`", only.unwrap_or_default());
    }

    let mut reports = Vec::with_capacity(selected.len());
    for seed in selected {
        // Fresh sinks per thread keep deliveries and notices attributable.
        let mail = Arc::new(RecordingMailTransport::new());
        let ops = Arc::new(RecordingOpsNotifier::new());
        let oracle = Arc::new(ScriptedOracle::new());
        let runtime = Arc::new(NegotiationRuntime::new(
            repositories.clone(),
            oracle.clone(),
            oracle,
            mail.clone(),
            ops.clone(),
            &NegotiationConfig::default(),
        ));

        let thread_id = ThreadId(seed.thread_id.to_string());
        let correlation_id = format!("simulate-{}", seed.thread_id);
        runtime
            .enqueue_cycle(&thread_id, &correlation_id, now)
            .await
            .with_context(|| format!("queueing cycle for {}", seed.thread_id))?;
        JobRunner::new(
            runtime.clone(),
            WorkerSettings { worker_id: "parley-simulate".to_string(), batch_size: 10 },
        )
        .run_once(now)
        .await
        .with_context(|| format!("running cycle for {}", seed.thread_id))?;

        let thread = repositories
            .threads
            .find_by_id(&thread_id)
            .await?
            .with_context(|| format!("thread {} disappeared", seed.thread_id))?;
        let decisions = repositories.decisions.list_for_thread(&thread_id).await?;
        let latest = decisions.last();
        let delivery = mail.deliveries().into_iter().last();

        reports.push(ThreadReport {
            thread_id: seed.thread_id.to_string(),
            scenario: seed.scenario,
            final_stage: thread.stage,
            decision_type: latest.map(|entry| entry.decision_type.as_str().to_string()),
            chosen_archetype: latest
                .and_then(|entry| entry.chosen_candidate.as_ref())
                .map(|candidate| candidate.archetype.as_str().to_string()),
            anchor_rate: latest
                .and_then(|entry| entry.chosen_candidate.as_ref())
                .map(|candidate| candidate.anchor_rate.to_string()),
            reasoning: latest
                .map(|entry| entry.reasoning.lines().map(ToString::to_string).collect())
                .unwrap_or_default(),
            delivery: delivery.as_ref().map(|(kind, _)| match kind {
                DeliveryKind::Sent => "sent".to_string(),
                DeliveryKind::Drafted => "drafted".to_string(),
            }),
            message: delivery.map(|(_, mail)| mail.body),
            ops_notices: ops.notices().len(),
            chain_valid: decision_chain::verify(&thread_id, &decisions).valid,
        });
    }
    Ok(reports)
}
