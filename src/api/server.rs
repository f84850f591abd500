// Copyright (c) 2025 Fabstir
// SPDX-License-Identifier: BUSL-1.1
//
// HTTP surface. Thin handlers: authenticate, validate at the boundary,
// delegate to the lifecycle controller, map core errors onto the response
// taxonomy. Handlers never partially apply a mutation.

use axum::{
    extract::{Path, State},
    http::{HeaderMap, StatusCode},
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use std::sync::Arc;
use std::time::Instant;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::info;
use uuid::Uuid;

use super::errors::ApiError;
use super::handlers::{
    AdmitJobRequest, AdmitJobResponse, AvailableJobsRequest, AvailableJobsResponse,
    CompleteRequest, CompleteResponse, FailRequest, HealthResponse, HeartbeatRequest, JobPreview,
    RegisterRequest, RegisterResponse,
};
use crate::lifecycle::JobLifecycle;
use crate::monitoring::MarketplaceMetrics;
use crate::registry::{AgentCapability, AgentId, AgentRegistry, HeartbeatStatus};
use crate::scheduler::Scheduler;
use crate::store::MarketplaceStore;
use crate::version;

const AGENT_KEY_HEADER: &str = "x-agent-key";
const ADMIN_KEY_HEADER: &str = "x-admin-key";
const DEFAULT_PULL_LIMIT: usize = 10;
const MAX_PULL_LIMIT: usize = 50;

/// Shared application state for HTTP handlers.
#[derive(Clone)]
pub struct AppState {
    pub lifecycle: Arc<JobLifecycle>,
    pub registry: Arc<AgentRegistry>,
    pub scheduler: Arc<Scheduler>,
    pub store: Arc<dyn MarketplaceStore>,
    pub metrics: Arc<MarketplaceMetrics>,
    pub admin_key: String,
    pub started: Instant,
}

pub fn create_app(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/metrics", get(metrics_handler))
        .route("/agents/register", post(register_handler))
        .route("/agents/heartbeat", post(heartbeat_handler))
        .route("/jobs/available", post(available_jobs_handler))
        .route("/jobs/:id/accept", post(accept_handler))
        .route("/jobs/:id/start", post(start_handler))
        .route("/jobs/:id/complete", post(complete_handler))
        .route("/jobs/:id/fail", post(fail_handler))
        .route("/admin/jobs", post(admit_job_handler))
        .route("/admin/stats", get(admin_stats_handler))
        .route("/admin/load-balancer", get(load_balancer_handler))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

pub async fn serve(state: AppState, listen_addr: &str) -> anyhow::Result<()> {
    let app = create_app(state);
    let listener = tokio::net::TcpListener::bind(listen_addr).await?;
    info!(addr = listen_addr, "marketplace API listening");
    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
        })
        .await?;
    Ok(())
}

async fn agent_auth(state: &AppState, headers: &HeaderMap) -> Result<AgentId, ApiError> {
    let credential = headers
        .get(AGENT_KEY_HEADER)
        .and_then(|value| value.to_str().ok())
        .ok_or_else(|| ApiError::Unauthorized("missing X-Agent-Key header".to_string()))?;
    Ok(state.registry.authenticate(credential).await?)
}

fn admin_auth(state: &AppState, headers: &HeaderMap) -> Result<(), ApiError> {
    let supplied = headers
        .get(ADMIN_KEY_HEADER)
        .and_then(|value| value.to_str().ok())
        .ok_or_else(|| ApiError::Unauthorized("missing X-Admin-Key header".to_string()))?;
    if state.admin_key.is_empty() || supplied != state.admin_key {
        return Err(ApiError::Unauthorized("invalid admin credential".to_string()));
    }
    Ok(())
}

async fn health_handler(State(state): State<AppState>) -> impl IntoResponse {
    let mut issues = Vec::new();
    if state.store.list_agents().await.is_err() {
        issues.push("store unavailable".to_string());
    }
    let status = if issues.is_empty() {
        "healthy"
    } else {
        "degraded"
    };
    Json(HealthResponse {
        status: status.to_string(),
        version: version::VERSION_NUMBER.to_string(),
        uptime_seconds: state.started.elapsed().as_secs(),
        issues: if issues.is_empty() { None } else { Some(issues) },
    })
}

async fn metrics_handler(State(state): State<AppState>) -> Result<String, ApiError> {
    state
        .metrics
        .encode()
        .map_err(|err| ApiError::Internal(err.to_string()))
}

async fn register_handler(
    State(state): State<AppState>,
    Json(request): Json<RegisterRequest>,
) -> Result<impl IntoResponse, ApiError> {
    request.validate()?;
    let capability = AgentCapability {
        gpu_vendor: request.gpu_vendor,
        gpu_model: request.gpu_model,
        gpu_memory: request.gpu_memory,
        compute_capability: request.compute_capability,
        framework: request.framework,
    };
    let (agent_id, credential, max_concurrent) = state
        .registry
        .register(capability, request.wallet, request.max_concurrent)
        .await?;
    state.metrics.agents_registered.inc();
    Ok((
        StatusCode::CREATED,
        Json(RegisterResponse {
            agent_id,
            credential,
            max_concurrent,
        }),
    ))
}

async fn heartbeat_handler(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(request): Json<HeartbeatRequest>,
) -> Result<StatusCode, ApiError> {
    let agent_id = agent_auth(&state, &headers).await?;
    state
        .lifecycle
        .heartbeat(
            agent_id,
            HeartbeatStatus {
                status: request.status,
                current_load: request.current_load,
            },
        )
        .await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn available_jobs_handler(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(request): Json<AvailableJobsRequest>,
) -> Result<Json<AvailableJobsResponse>, ApiError> {
    let agent_id = agent_auth(&state, &headers).await?;
    let limit = request
        .max
        .unwrap_or(DEFAULT_PULL_LIMIT)
        .min(MAX_PULL_LIMIT);
    let jobs = state
        .lifecycle
        .pull(agent_id, request.gpu_memory, limit)
        .await?;
    Ok(Json(AvailableJobsResponse {
        jobs: jobs
            .into_iter()
            .map(|job| JobPreview {
                job_id: job.id,
                job_type: job.job_type,
                docker_image: job.docker_image,
                priority: job.priority,
                requires_gpu: job.requires_gpu,
                gpu_memory_required: job.gpu_memory_required,
                timeout_seconds: job.timeout_seconds,
                reward: job.reward,
            })
            .collect(),
    }))
}

async fn accept_handler(
    State(state): State<AppState>,
    Path(job_id): Path<Uuid>,
    headers: HeaderMap,
) -> Result<StatusCode, ApiError> {
    let agent_id = agent_auth(&state, &headers).await?;
    state.lifecycle.accept(agent_id, job_id).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn start_handler(
    State(state): State<AppState>,
    Path(job_id): Path<Uuid>,
    headers: HeaderMap,
) -> Result<StatusCode, ApiError> {
    let agent_id = agent_auth(&state, &headers).await?;
    state.lifecycle.started(agent_id, job_id).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn complete_handler(
    State(state): State<AppState>,
    Path(job_id): Path<Uuid>,
    headers: HeaderMap,
    Json(request): Json<CompleteRequest>,
) -> Result<Json<CompleteResponse>, ApiError> {
    let agent_id = agent_auth(&state, &headers).await?;
    request.validate()?;
    let payment = state
        .lifecycle
        .complete(agent_id, job_id, request.duration_seconds)
        .await?;
    Ok(Json(CompleteResponse {
        payment_id: payment.id,
    }))
}

async fn fail_handler(
    State(state): State<AppState>,
    Path(job_id): Path<Uuid>,
    headers: HeaderMap,
    Json(request): Json<FailRequest>,
) -> Result<StatusCode, ApiError> {
    let agent_id = agent_auth(&state, &headers).await?;
    request.validate()?;
    state.lifecycle.fail(agent_id, job_id, &request.error).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn admit_job_handler(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(request): Json<AdmitJobRequest>,
) -> Result<impl IntoResponse, ApiError> {
    admin_auth(&state, &headers)?;
    let job = state.lifecycle.admit(request.into_spec()).await?;
    Ok((
        StatusCode::CREATED,
        Json(AdmitJobResponse { job_id: job.id }),
    ))
}

async fn admin_stats_handler(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<impl IntoResponse, ApiError> {
    admin_auth(&state, &headers)?;
    let stats = state.lifecycle.stats().await?;
    Ok(Json(stats))
}

async fn load_balancer_handler(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<impl IntoResponse, ApiError> {
    admin_auth(&state, &headers)?;
    Ok(Json(state.scheduler.snapshot().await))
}
