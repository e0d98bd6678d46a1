// =============================================================================
// REST API endpoints — Axum 0.7
// =============================================================================
//
// Public: health. Everything else requires the `ApiAuth` extractor (a no-op
// when auth is disabled). The risk-gate RPC lives here: check, batch check,
// metrics, emergency-stop control, and policy administration. Rejections are
// 200 responses with `approved = false`; upstream unavailability maps to 503
// with a stable error code.
// =============================================================================

use std::sync::Arc;

use axum::extract::{Json, Query, State};
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::Router;
use serde::{Deserialize, Serialize};
use tower_http::cors::{Any, CorsLayer};
use tracing::info;

use crate::api::auth::ApiAuth;
use crate::app::AppContext;
use crate::error::Result;
use crate::risk::{OrderRequest, Policy};
use crate::session;

// =============================================================================
// Router construction
// =============================================================================

/// Build the full router with CORS middleware and shared state.
pub fn router(ctx: Arc<AppContext>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        // ── Public ──────────────────────────────────────────────────
        .route("/api/v1/health", get(health))
        // ── Streaming transport ─────────────────────────────────────
        .route("/ws", get(session::ws_handler))
        // ── Dashboard bootstrap ─────────────────────────────────────
        .route("/api/v1/state", get(full_state))
        // ── Risk gate RPC ───────────────────────────────────────────
        .route("/api/v1/risk/check", post(risk_check))
        .route("/api/v1/risk/check-batch", post(risk_check_batch))
        .route("/api/v1/risk/metrics", get(risk_metrics))
        .route(
            "/api/v1/risk/emergency-stop",
            get(emergency_status).post(trigger_emergency),
        )
        .route("/api/v1/risk/emergency-stop/complete", post(complete_emergency))
        .route("/api/v1/risk/re-enable", post(re_enable))
        // ── Policy administration ───────────────────────────────────
        .route("/api/v1/risk/policies", get(list_policies).post(upsert_policy))
        // ── Middleware & state ──────────────────────────────────────
        .layer(cors)
        .with_state(ctx)
}

// =============================================================================
// Health (public)
// =============================================================================

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    sequence: u64,
    sessions: usize,
    uptime_secs: u64,
    server_time: i64,
}

async fn health(State(ctx): State<Arc<AppContext>>) -> impl IntoResponse {
    Json(HealthResponse {
        status: "ok",
        sequence: ctx.aggregator.sequence(),
        sessions: ctx.sessions.len(),
        uptime_secs: ctx.uptime_secs(),
        server_time: chrono::Utc::now().timestamp_millis(),
    })
}

// =============================================================================
// Consolidated snapshot (authenticated)
// =============================================================================

async fn full_state(_auth: ApiAuth, State(ctx): State<Arc<AppContext>>) -> impl IntoResponse {
    let snapshot = ctx.aggregator.snapshot();
    Json((*snapshot).clone())
}

// =============================================================================
// Risk gate RPC (authenticated)
// =============================================================================

async fn risk_check(
    _auth: ApiAuth,
    State(ctx): State<Arc<AppContext>>,
    Json(request): Json<OrderRequest>,
) -> Result<impl IntoResponse> {
    let decision = ctx.gate.check_order(&request).await?;
    Ok(Json(decision))
}

#[derive(Deserialize)]
struct BatchRequest {
    orders: Vec<OrderRequest>,
}

#[derive(Serialize)]
struct BatchResponse {
    results: Vec<crate::risk::BatchResult>,
    processing_time_us: u64,
}

async fn risk_check_batch(
    _auth: ApiAuth,
    State(ctx): State<Arc<AppContext>>,
    Json(request): Json<BatchRequest>,
) -> impl IntoResponse {
    let started = std::time::Instant::now();
    let results = ctx.gate.check_order_batch(&request.orders).await;
    Json(BatchResponse {
        results,
        processing_time_us: started.elapsed().as_micros() as u64,
    })
}

#[derive(Deserialize)]
struct MetricsQuery {
    #[serde(default)]
    account_id: Option<String>,
}

async fn risk_metrics(
    _auth: ApiAuth,
    State(ctx): State<Arc<AppContext>>,
    Query(query): Query<MetricsQuery>,
) -> Result<impl IntoResponse> {
    let started = std::time::Instant::now();
    let account_id = query
        .account_id
        .unwrap_or_else(|| ctx.config.risk.account_id.clone());
    let metrics = ctx.gate.current_metrics(&account_id).await?;
    Ok(Json(serde_json::json!({
        "metrics": metrics,
        "processing_time_us": started.elapsed().as_micros() as u64,
    })))
}

// =============================================================================
// Emergency stop (authenticated)
// =============================================================================

#[derive(Deserialize)]
struct EmergencyRequest {
    #[serde(default)]
    reason: Option<String>,
}

async fn trigger_emergency(
    _auth: ApiAuth,
    State(ctx): State<Arc<AppContext>>,
    Json(request): Json<EmergencyRequest>,
) -> impl IntoResponse {
    let started = std::time::Instant::now();
    let reason = request.reason.unwrap_or_else(|| "manual stop".to_string());
    let triggered = ctx.coordinator.trigger(&reason, "api");
    info!(reason = %reason, triggered, "emergency stop requested via api");
    Json(serde_json::json!({
        "triggered": triggered,
        "status": ctx.coordinator.status(),
        "processing_time_us": started.elapsed().as_micros() as u64,
    }))
}

async fn emergency_status(_auth: ApiAuth, State(ctx): State<Arc<AppContext>>) -> impl IntoResponse {
    let started = std::time::Instant::now();
    Json(serde_json::json!({
        "status": ctx.coordinator.status(),
        "processing_time_us": started.elapsed().as_micros() as u64,
    }))
}

#[derive(Deserialize)]
struct CompleteRequest {
    #[serde(default)]
    orders_cancelled: u32,
    #[serde(default)]
    positions_closed: u32,
}

async fn complete_emergency(
    _auth: ApiAuth,
    State(ctx): State<Arc<AppContext>>,
    Json(request): Json<CompleteRequest>,
) -> Result<impl IntoResponse> {
    let status = ctx
        .coordinator
        .complete(request.orders_cancelled, request.positions_closed)?;
    Ok(Json(status))
}

async fn re_enable(_auth: ApiAuth, State(ctx): State<Arc<AppContext>>) -> Result<impl IntoResponse> {
    let started = std::time::Instant::now();
    ctx.coordinator.re_enable()?;
    Ok(Json(serde_json::json!({
        "trading_enabled": true,
        "processing_time_us": started.elapsed().as_micros() as u64,
    })))
}

// =============================================================================
// Policy administration (authenticated)
// =============================================================================

async fn list_policies(_auth: ApiAuth, State(ctx): State<Arc<AppContext>>) -> impl IntoResponse {
    let policies = ctx.policies.policies();
    Json((*policies).clone())
}

async fn upsert_policy(
    _auth: ApiAuth,
    State(ctx): State<Arc<AppContext>>,
    Json(policy): Json<Policy>,
) -> Result<impl IntoResponse> {
    let stored = ctx.policies.upsert(policy)?;
    ctx.publisher.config_update("risk_policy", &stored);
    Ok(Json(stored))
}
