use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use parley_agent::runtime::NegotiationRuntime;
use parley_agent::worker::{JobRunner, WorkerSettings};
use parley_core::config::NegotiationConfig;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{error, info};

/// Polls the job queue until `shutdown` flips to true. A failed pass is
/// logged and retried on the next tick.
pub fn spawn(
    runtime: Arc<NegotiationRuntime>,
    config: &NegotiationConfig,
    mut shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    let settings = WorkerSettings {
        worker_id: format!("parley-server-{}", std::process::id()),
        batch_size: config.worker_batch_size,
    };
    let poll_interval = Duration::from_secs(config.worker_poll_interval_secs.max(1));
    let runner = JobRunner::new(runtime, settings);

    tokio::spawn(async move {
        info!(
            event_name = "system.worker.start",
            correlation_id = "worker",
            poll_interval_secs = poll_interval.as_secs(),
            "job worker started"
        );
        let mut ticker = tokio::time::interval(poll_interval);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(failure) = runner.run_once(Utc::now()).await {
                        error!(
                            event_name = "system.worker.pass_failed",
                            correlation_id = "worker",
                            error_class = failure.error_class(),
                            error = %failure,
                            "worker pass failed"
                        );
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        info!(event_name = "system.worker.stopped", correlation_id = "shutdown", "job worker stopped");
    })
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use chrono::Utc;
    use parley_agent::oracle::ScriptedOracle;
    use parley_agent::ports::{RecordingMailTransport, RecordingOpsNotifier};
    use parley_agent::runtime::NegotiationRuntime;
    use parley_core::config::NegotiationConfig;
    use parley_core::domain::thread::{ThreadId, ThreadStage};
    use parley_db::{DemoSeedDataset, RepositorySet};
    use tokio::sync::watch;

    #[tokio::test]
    async fn worker_drains_queue_and_stops_on_shutdown() {
        let repositories = RepositorySet::in_memory();
        DemoSeedDataset::load(&repositories, Utc::now()).await.expect("seed");
        let oracle = Arc::new(ScriptedOracle::new());
        let config = NegotiationConfig { worker_poll_interval_secs: 1, ..NegotiationConfig::default() };
        let runtime = Arc::new(NegotiationRuntime::new(
            repositories.clone(),
            oracle.clone(),
            oracle,
            Arc::new(RecordingMailTransport::new()),
            Arc::new(RecordingOpsNotifier::new()),
            &config,
        ));
        let thread_id = ThreadId("T-DEMO-SANDBOX".to_string());
        runtime.enqueue_cycle(&thread_id, "corr-worker", Utc::now()).await.expect("enqueue");

        let (stop, shutdown) = watch::channel(false);
        let handle = super::spawn(runtime, &config, shutdown);

        let mut stage = ThreadStage::Open;
        for _ in 0..50 {
            stage = repositories
                .threads
                .find_by_id(&thread_id)
                .await
                .expect("load")
                .expect("thread")
                .stage;
            if stage == ThreadStage::FollowUpScheduled {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        }
        assert_eq!(stage, ThreadStage::FollowUpScheduled);

        stop.send(true).expect("signal shutdown");
        handle.await.expect("worker task joins");
    }
}
