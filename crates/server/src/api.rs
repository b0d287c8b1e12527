//! Operator HTTP API.
//!
//! JSON Endpoints:
//! - `POST /api/v1/threads/{thread_id}/cycles` queue a decision cycle
//! - `POST /api/v1/threads/{thread_id}/replies` record an inbound brand reply
//! - `POST /api/v1/threads/{thread_id}/resume` resume a halted thread
//! - `GET  /api/v1/threads/{thread_id}/decisions` decision log plus chain verification

use std::sync::Arc;

use axum::{
    extract::{Path, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};
use uuid::Uuid;

use parley_agent::runtime::{BrandReplyOutcome, NegotiationRuntime};
use parley_core::domain::decision::DecisionLogEntry;
use parley_core::domain::job::{CycleJobId, JobKind, JobState};
use parley_core::domain::thread::{ThreadId, ThreadStage};
use parley_core::errors::{ApplicationError, DomainError, InterfaceError};
use parley_core::negotiation::{decision_chain, ChainVerification};
use parley_db::repositories::EnqueueOutcome;

const CORRELATION_HEADER: &str = "x-correlation-id";

#[derive(Clone)]
pub struct ApiState {
    runtime: Arc<NegotiationRuntime>,
}

impl ApiState {
    pub fn new(runtime: Arc<NegotiationRuntime>) -> Self {
        Self { runtime }
    }
}

#[derive(Debug, Deserialize)]
pub struct BrandReplyRequest {
    #[serde(default)]
    pub subject: String,
    pub body: String,
}

#[derive(Debug, PartialEq, Eq, Serialize)]
pub struct QueuedJobResponse {
    pub job_id: CycleJobId,
    pub kind: JobKind,
    pub state: JobState,
    pub expected_stage: ThreadStage,
    pub already_pending: bool,
    pub correlation_id: String,
}

impl QueuedJobResponse {
    fn from_outcome(outcome: &EnqueueOutcome, correlation_id: String) -> Self {
        let job = outcome.job();
        Self {
            job_id: job.id.clone(),
            kind: job.kind,
            state: job.state,
            expected_stage: job.expected_stage,
            already_pending: matches!(outcome, EnqueueOutcome::AlreadyPending(_)),
            correlation_id,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct BrandReplyResponse {
    #[serde(flatten)]
    pub outcome: BrandReplyOutcome,
    pub correlation_id: String,
}

#[derive(Debug, Serialize)]
pub struct DecisionLogResponse {
    pub thread_id: ThreadId,
    pub entries: Vec<DecisionLogEntry>,
    pub verification: ChainVerification,
}

#[derive(Debug, Serialize)]
pub struct ApiErrorBody {
    pub error: &'static str,
    pub correlation_id: String,
}

/// Domain and infrastructure failures mapped to a status code and a
/// user-safe message.
#[derive(Debug)]
pub struct ApiError(InterfaceError);

impl ApiError {
    fn new(error: ApplicationError, correlation_id: &str) -> Self {
        warn!(
            event_name = "api.request_failed",
            correlation_id,
            error_class = error.error_class(),
            error = %error,
            "operator request failed"
        );
        Self(error.into_interface(correlation_id))
    }

    pub fn status(&self) -> StatusCode {
        match &self.0 {
            InterfaceError::BadRequest { .. } => StatusCode::BAD_REQUEST,
            InterfaceError::NotFound { .. } => StatusCode::NOT_FOUND,
            InterfaceError::Conflict { .. } => StatusCode::CONFLICT,
            InterfaceError::ServiceUnavailable { .. } => StatusCode::SERVICE_UNAVAILABLE,
            InterfaceError::Internal { .. } => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn correlation_id(&self) -> &str {
        match &self.0 {
            InterfaceError::BadRequest { correlation_id, .. }
            | InterfaceError::NotFound { correlation_id, .. }
            | InterfaceError::Conflict { correlation_id, .. }
            | InterfaceError::ServiceUnavailable { correlation_id, .. }
            | InterfaceError::Internal { correlation_id, .. } => correlation_id,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = ApiErrorBody {
            error: self.0.user_message(),
            correlation_id: self.correlation_id().to_string(),
        };
        (self.status(), Json(body)).into_response()
    }
}

pub fn router(runtime: Arc<NegotiationRuntime>) -> Router {
    Router::new()
        .route("/api/v1/threads/{thread_id}/cycles", post(enqueue_cycle))
        .route("/api/v1/threads/{thread_id}/replies", post(record_brand_reply))
        .route("/api/v1/threads/{thread_id}/resume", post(resume_thread))
        .route("/api/v1/threads/{thread_id}/decisions", get(list_decisions))
        .with_state(ApiState::new(runtime))
}

fn correlation_id(headers: &HeaderMap) -> String {
    headers
        .get(CORRELATION_HEADER)
        .and_then(|value| value.to_str().ok())
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .map_or_else(|| format!("req-{}", Uuid::new_v4().simple()), ToString::to_string)
}

async fn enqueue_cycle(
    Path(thread_id): Path<String>,
    State(state): State<ApiState>,
    headers: HeaderMap,
) -> Result<(StatusCode, Json<QueuedJobResponse>), ApiError> {
    let correlation_id = correlation_id(&headers);
    let thread_id = ThreadId(thread_id);

    let outcome = state
        .runtime
        .enqueue_cycle(&thread_id, &correlation_id, Utc::now())
        .await
        .map_err(|error| ApiError::new(error, &correlation_id))?;

    info!(
        event_name = "api.cycle_enqueued",
        correlation_id = %correlation_id,
        thread_id = %thread_id,
        job_id = %outcome.job().id.0,
        "decision cycle queued"
    );
    Ok((StatusCode::ACCEPTED, Json(QueuedJobResponse::from_outcome(&outcome, correlation_id))))
}

async fn record_brand_reply(
    Path(thread_id): Path<String>,
    State(state): State<ApiState>,
    headers: HeaderMap,
    Json(request): Json<BrandReplyRequest>,
) -> Result<Json<BrandReplyResponse>, ApiError> {
    let correlation_id = correlation_id(&headers);
    if request.body.trim().is_empty() {
        return Err(ApiError::new(
            DomainError::InvariantViolation("brand reply body is empty".to_string()).into(),
            &correlation_id,
        ));
    }

    let outcome = state
        .runtime
        .record_brand_reply(
            &ThreadId(thread_id),
            request.subject.trim(),
            request.body.trim(),
            &correlation_id,
            Utc::now(),
        )
        .await
        .map_err(|error| ApiError::new(error, &correlation_id))?;

    Ok(Json(BrandReplyResponse { outcome, correlation_id }))
}

async fn resume_thread(
    Path(thread_id): Path<String>,
    State(state): State<ApiState>,
    headers: HeaderMap,
) -> Result<(StatusCode, Json<QueuedJobResponse>), ApiError> {
    let correlation_id = correlation_id(&headers);
    let outcome = state
        .runtime
        .resume_halted(&ThreadId(thread_id), &correlation_id, Utc::now())
        .await
        .map_err(|error| ApiError::new(error, &correlation_id))?;

    Ok((StatusCode::ACCEPTED, Json(QueuedJobResponse::from_outcome(&outcome, correlation_id))))
}

async fn list_decisions(
    Path(thread_id): Path<String>,
    State(state): State<ApiState>,
    headers: HeaderMap,
) -> Result<Json<DecisionLogResponse>, ApiError> {
    let correlation_id = correlation_id(&headers);
    let thread_id = ThreadId(thread_id);
    let repositories = state.runtime.repositories();

    let exists = repositories
        .threads
        .find_by_id(&thread_id)
        .await
        .map_err(|error| ApiError::new(error.into(), &correlation_id))?
        .is_some();
    if !exists {
        return Err(ApiError::new(DomainError::ThreadNotFound(thread_id).into(), &correlation_id));
    }

    let entries = repositories
        .decisions
        .list_for_thread(&thread_id)
        .await
        .map_err(|error| ApiError::new(error.into(), &correlation_id))?;
    let verification = decision_chain::verify(&thread_id, &entries);

    Ok(Json(DecisionLogResponse { thread_id, entries, verification }))
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use axum::body::Body;
    use axum::extract::{Path, State};
    use axum::http::{HeaderMap, HeaderValue, Request, StatusCode};
    use axum::Json;
    use chrono::Utc;
    use tower::ServiceExt;

    use parley_agent::oracle::ScriptedOracle;
    use parley_agent::ports::{RecordingMailTransport, RecordingOpsNotifier};
    use parley_agent::runtime::NegotiationRuntime;
    use parley_agent::worker::{JobRunner, WorkerSettings};
    use parley_core::config::NegotiationConfig;
    use parley_core::domain::thread::ThreadStage;
    use parley_db::{DemoSeedDataset, RepositorySet};

    use super::*;

    async fn seeded_runtime() -> Arc<NegotiationRuntime> {
        let repositories = RepositorySet::in_memory();
        DemoSeedDataset::load(&repositories, Utc::now()).await.expect("seed");
        let oracle = Arc::new(ScriptedOracle::new());
        Arc::new(NegotiationRuntime::new(
            repositories,
            oracle.clone(),
            oracle,
            Arc::new(RecordingMailTransport::new()),
            Arc::new(RecordingOpsNotifier::new()),
            &NegotiationConfig::default(),
        ))
    }

    fn headers(correlation_id: &str) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(CORRELATION_HEADER, HeaderValue::from_str(correlation_id).expect("header"));
        headers
    }

    async fn run_worker(runtime: &Arc<NegotiationRuntime>) {
        JobRunner::new(
            runtime.clone(),
            WorkerSettings { worker_id: "api-test".to_string(), batch_size: 10 },
        )
        .run_once(Utc::now())
        .await
        .expect("worker pass");
    }

    #[tokio::test]
    async fn enqueue_cycle_accepts_open_thread_and_reports_duplicates() {
        let runtime = seeded_runtime().await;
        let state = State(ApiState::new(runtime.clone()));

        let (status, Json(first)) = enqueue_cycle(
            Path("T-DEMO-AUTOSEND".to_string()),
            state.clone(),
            headers("corr-api-1"),
        )
        .await
        .expect("enqueue");
        assert_eq!(status, StatusCode::ACCEPTED);
        assert!(!first.already_pending);
        assert_eq!(first.expected_stage, ThreadStage::Open);
        assert_eq!(first.correlation_id, "corr-api-1");

        let (_, Json(second)) =
            enqueue_cycle(Path("T-DEMO-AUTOSEND".to_string()), state, headers("corr-api-2"))
                .await
                .expect("enqueue again");
        assert!(second.already_pending);
        assert_eq!(second.job_id, first.job_id);
    }

    #[tokio::test]
    async fn unknown_thread_maps_to_not_found_with_correlation_id() {
        let runtime = seeded_runtime().await;

        let error = enqueue_cycle(
            Path("T-MISSING".to_string()),
            State(ApiState::new(runtime)),
            headers("corr-missing"),
        )
        .await
        .expect_err("unknown thread");

        assert_eq!(error.status(), StatusCode::NOT_FOUND);
        assert_eq!(error.correlation_id(), "corr-missing");
    }

    #[tokio::test]
    async fn resume_on_open_thread_is_a_conflict() {
        let runtime = seeded_runtime().await;

        let error = resume_thread(
            Path("T-DEMO-AUTOSEND".to_string()),
            State(ApiState::new(runtime)),
            headers("corr-resume"),
        )
        .await
        .expect_err("thread is not halted");

        assert_eq!(error.status(), StatusCode::CONFLICT);
    }

    #[tokio::test]
    async fn empty_brand_reply_is_rejected() {
        let runtime = seeded_runtime().await;

        let error = record_brand_reply(
            Path("T-DEMO-AUTOSEND".to_string()),
            State(ApiState::new(runtime)),
            headers("corr-reply"),
            Json(BrandReplyRequest { subject: String::new(), body: "   ".to_string() }),
        )
        .await
        .expect_err("empty body");

        assert_eq!(error.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn decisions_endpoint_returns_verified_chain_after_a_cycle() {
        let runtime = seeded_runtime().await;
        runtime
            .enqueue_cycle(&ThreadId("T-DEMO-HALT".to_string()), "corr-seed", Utc::now())
            .await
            .expect("enqueue");
        run_worker(&runtime).await;

        let response = router(runtime)
            .oneshot(
                Request::builder()
                    .uri("/api/v1/threads/T-DEMO-HALT/decisions")
                    .body(Body::empty())
                    .expect("request"),
            )
            .await
            .expect("response");
        assert_eq!(response.status(), StatusCode::OK);

        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.expect("body");
        let payload: serde_json::Value = serde_json::from_slice(&bytes).expect("json");
        assert_eq!(payload["verification"]["valid"], true);
        assert_eq!(payload["entries"][0]["decision_type"], "HALT");
    }
}
