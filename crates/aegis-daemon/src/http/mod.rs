//! Control-plane HTTP surface.
//!
//! Routes are the operational endpoints only; business routing lives in
//! the application layer and reuses the same middleware stack. The
//! middleware pipeline runs outer to inner:
//!
//! 1. **Safe-mode gate**: mutating methods are refused with 503 while safe
//!    mode is engaged, except under the safe-mode control prefix. A failed
//!    safe-mode read fails closed.
//! 2. **Security gate**: per-IP sliding rate limit (429), then persistent
//!    block lookups for the client IP and the authenticated user (403).
//! 3. **Accounting**: request latency into the tracker and the
//!    `http.request_duration_ms` histogram, totals/error counters, and the
//!    `http.error_rate` gauge.
//!
//! `/metrics` is log-silent and skips the whole pipeline so scrapers keep
//! working under degraded conditions.

use std::sync::Arc;
use std::time::Instant;

use aegis_core::latency::LatencyTracker;
use aegis_core::metrics::MetricsRegistry;
use axum::extract::{Request, State};
use axum::http::{header, HeaderMap, Method, StatusCode};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::json;
use tracing::{error, warn};

use crate::clock::SharedClock;
use crate::health::HealthScorer;
use crate::incidents::IncidentManager;
use crate::report::ExecutiveReporter;
use crate::scheduler::CronStatusBoard;
use crate::security::SecurityEngine;
use crate::storage::Storage;

/// Path prefix exempt from the safe-mode gate.
pub const SAFE_MODE_CONTROL_PREFIX: &str = "/system-mode";

/// Open incidents returned by `/incidents`.
const OPEN_INCIDENT_LIMIT: u32 = 50;

/// Shared application state.
#[derive(Clone)]
pub struct AppState {
    inner: Arc<AppInner>,
}

/// Everything the handlers and middleware reach for.
pub struct AppInner {
    /// Shared store.
    pub storage: Storage,
    /// Metrics registry.
    pub registry: Arc<MetricsRegistry>,
    /// Clock.
    pub clock: SharedClock,
    /// Latency tracker shared with the perf engine.
    pub latency: Arc<LatencyTracker>,
    /// Security engine (rate limiter + blocks).
    pub security: Arc<SecurityEngine>,
    /// Health scorer and safe-mode manager.
    pub health: Arc<HealthScorer>,
    /// Incident manager.
    pub incidents: Arc<IncidentManager>,
    /// Executive reporter.
    pub reporter: Arc<ExecutiveReporter>,
    /// Cron status board.
    pub cron: CronStatusBoard,
}

impl AppState {
    /// Wraps the dependency bundle.
    #[must_use]
    pub fn new(inner: AppInner) -> Self {
        Self {
            inner: Arc::new(inner),
        }
    }
}

impl std::ops::Deref for AppState {
    type Target = AppInner;

    fn deref(&self) -> &Self::Target {
        &self.inner
    }
}

/// Builds the control-plane router with the full middleware pipeline.
#[must_use]
pub fn router(state: AppState) -> Router {
    let gated = Router::new()
        .route("/health", get(health_probe))
        .route("/system-health", get(system_health))
        .route("/incidents", get(incidents))
        .route("/invariants/status", get(invariants_status))
        .route("/cron/status", get(cron_status))
        .route("/metrics/json", get(metrics_json))
        .route(
            "/system-mode/safe",
            post(enable_safe_mode).delete(disable_safe_mode),
        )
        .route("/reports/executive", post(trigger_executive_report))
        // Layers run bottom-up: accounting innermost, safe-mode outermost.
        .layer(middleware::from_fn_with_state(
            state.clone(),
            accounting_middleware,
        ))
        .layer(middleware::from_fn_with_state(
            state.clone(),
            security_middleware,
        ))
        .layer(middleware::from_fn_with_state(
            state.clone(),
            safe_mode_middleware,
        ));

    Router::new()
        .route("/metrics", get(metrics_text))
        .merge(gated)
        .with_state(state)
}

// =============================================================================
// Middleware
// =============================================================================

async fn safe_mode_middleware(
    State(state): State<AppState>,
    request: Request,
    next: Next,
) -> Response {
    let mutating = matches!(
        *request.method(),
        Method::POST | Method::PUT | Method::PATCH | Method::DELETE
    );
    if mutating && !request.uri().path().starts_with(SAFE_MODE_CONTROL_PREFIX) {
        match state.storage.safe_mode_state() {
            Ok(safe_mode) if safe_mode.safe_mode => {
                return (
                    StatusCode::SERVICE_UNAVAILABLE,
                    Json(json!({
                        "error": "SERVICE_IN_SAFE_MODE",
                        "readOnly": true,
                        "reason": safe_mode.reason,
                    })),
                )
                    .into_response();
            },
            Ok(_) => {},
            Err(err) => {
                // Fail closed: an unreadable safe-mode flag refuses writes.
                error!(error = %err, "safe-mode probe failed; refusing mutation");
                return (
                    StatusCode::SERVICE_UNAVAILABLE,
                    Json(json!({
                        "error": "SERVICE_IN_SAFE_MODE",
                        "readOnly": true,
                        "reason": "safe-mode state unavailable",
                    })),
                )
                    .into_response();
            },
        }
    }
    next.run(request).await
}

async fn security_middleware(
    State(state): State<AppState>,
    request: Request,
    next: Next,
) -> Response {
    let ip = client_ip(request.headers());
    let user_id = request
        .headers()
        .get("x-user-id")
        .and_then(|v| v.to_str().ok())
        .map(ToString::to_string);

    if let Some(ip) = &ip {
        let now = state.clock.now_ms();
        let decision = state
            .security
            .rate_limiter()
            .check(&format!("ip:{ip}"), now);
        if !decision.is_allowed() {
            state.security.record_rate_limit_rejection(ip);
            return (
                StatusCode::TOO_MANY_REQUESTS,
                Json(json!({ "error": "RATE_LIMIT_EXCEEDED" })),
            )
                .into_response();
        }
    }

    for target in [ip.as_deref(), user_id.as_deref()].into_iter().flatten() {
        match state.security.is_blocked(target) {
            Ok(true) => {
                state
                    .security
                    .record_block_rejection(ip.as_deref(), user_id.as_deref());
                return (
                    StatusCode::FORBIDDEN,
                    Json(json!({ "error": "BLOCKED" })),
                )
                    .into_response();
            },
            Ok(false) => {},
            Err(err) => {
                warn!(error = %err, target, "block lookup failed");
            },
        }
    }

    next.run(request).await
}

async fn accounting_middleware(
    State(state): State<AppState>,
    request: Request,
    next: Next,
) -> Response {
    let method = request.method().clone();
    let path = request.uri().path().to_string();
    let started = Instant::now();

    let response = next.run(request).await;

    let elapsed_ms = started.elapsed().as_secs_f64() * 1000.0;
    let route = format!("{method} {path}");
    state.latency.record(&route, elapsed_ms, state.clock.now_ms());
    state
        .registry
        .record("http.request_duration_ms", elapsed_ms);

    let total = state.registry.increment("http.requests");
    let errors = if response.status().is_server_error() {
        state.registry.increment("http.errors")
    } else {
        state.registry.counter("http.errors")
    };
    #[allow(clippy::cast_precision_loss)]
    state
        .registry
        .set_gauge("http.error_rate", errors as f64 / total as f64 * 100.0);

    response
}

fn client_ip(headers: &HeaderMap) -> Option<String> {
    headers
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(',').next())
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

// =============================================================================
// Handlers
// =============================================================================

/// Shallow liveness probe with dependency status.
async fn health_probe(State(state): State<AppState>) -> Response {
    let started = Instant::now();
    match state.storage.ping() {
        Ok(()) => {
            let latency_ms = started.elapsed().as_secs_f64() * 1000.0;
            Json(json!({
                "status": "ok",
                "db": { "ok": true, "latency_ms": latency_ms },
            }))
            .into_response()
        },
        Err(err) => (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({
                "status": "degraded",
                "db": { "ok": false, "error": err.to_string() },
            })),
        )
            .into_response(),
    }
}

/// Full health report (computes a fresh sample).
async fn system_health(State(state): State<AppState>) -> Response {
    match state.health.compute() {
        Ok(report) => Json(json!({
            "score": report.score,
            "grade": report.grade,
            "components": report.components,
            "safeMode": report.safe_mode,
            "recordedAt": report.recorded_at,
        }))
        .into_response(),
        Err(err) => internal_error(&err),
    }
}

/// Open incidents, P1 first, newest first.
async fn incidents(State(state): State<AppState>) -> Response {
    let summary = match state.incidents.incident_summary() {
        Ok(summary) => summary,
        Err(err) => return internal_error(&err),
    };
    match state.storage.open_incidents(OPEN_INCIDENT_LIMIT) {
        Ok(rows) => {
            let open: Vec<serde_json::Value> = rows
                .iter()
                .map(|row| {
                    json!({
                        "id": row.id,
                        "priority": row.priority.as_str(),
                        "status": row.status.as_str(),
                        "title": row.title,
                        "invariant": row.invariant,
                        "autoHealAttempts": row.auto_heal_attempts,
                        "createdAt": row.created_at,
                        "escalatedAt": row.escalated_at,
                    })
                })
                .collect();
            Json(json!({ "summary": summary, "open": open })).into_response()
        },
        Err(err) => internal_error(&err),
    }
}

/// Drift score and the last 24 h of samples.
async fn invariants_status(State(state): State<AppState>) -> Response {
    let day_ago = state.clock.now_ms() - 24 * 60 * 60 * 1000;
    let latest = match state.storage.latest_drift_score() {
        Ok(latest) => latest,
        Err(err) => return internal_error(&err),
    };
    match state.storage.drift_scores_since(day_ago) {
        Ok(samples) => {
            let last24h: Vec<serde_json::Value> = samples
                .iter()
                .map(|(score, at)| json!({ "score": score, "createdAt": at }))
                .collect();
            Json(json!({
                "driftScore": latest.map(|(score, _)| score),
                "last24h": last24h,
            }))
            .into_response()
        },
        Err(err) => internal_error(&err),
    }
}

/// Per-job scheduler stats.
async fn cron_status(State(state): State<AppState>) -> Response {
    let board = state.cron.read().expect("cron board lock poisoned");
    let mut jobs: Vec<serde_json::Value> = board
        .iter()
        .map(|(name, stats)| {
            json!({
                "name": name,
                "lastRun": stats.last_run,
                "lastError": stats.last_error,
                "runCount": stats.run_count,
            })
        })
        .collect();
    drop(board);
    jobs.sort_by(|a, b| a["name"].as_str().cmp(&b["name"].as_str()));
    Json(json!({ "jobs": jobs })).into_response()
}

/// Prometheus exposition (log-silent, ungated).
async fn metrics_text(State(state): State<AppState>) -> Response {
    (
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        state.registry.encode_text(),
    )
        .into_response()
}

/// JSON metrics snapshot.
async fn metrics_json(State(state): State<AppState>) -> Response {
    Json(state.registry.snapshot_json()).into_response()
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct EnableSafeModeBody {
    reason: Option<String>,
    enabled_by: Option<String>,
}

/// Manually engages safe mode.
async fn enable_safe_mode(
    State(state): State<AppState>,
    body: Option<Json<EnableSafeModeBody>>,
) -> Response {
    let body = body.map(|Json(b)| b).unwrap_or(EnableSafeModeBody {
        reason: None,
        enabled_by: None,
    });
    let reason = body.reason.as_deref().unwrap_or("manual");
    let enabled_by = body.enabled_by.as_deref().unwrap_or("admin");
    match state.health.enable_safe_mode(reason, enabled_by) {
        Ok(Some(token)) => Json(json!({ "success": true, "overrideToken": token }))
            .into_response(),
        Ok(None) => Json(json!({ "success": false, "error": "already engaged" }))
            .into_response(),
        Err(err) => internal_error(&err),
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct DisableSafeModeBody {
    override_token: String,
}

/// Disables safe mode when the override token matches.
async fn disable_safe_mode(
    State(state): State<AppState>,
    body: Option<Json<DisableSafeModeBody>>,
) -> Response {
    let Some(Json(body)) = body else {
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({ "success": false, "error": "overrideToken required" })),
        )
            .into_response();
    };
    match state.health.disable_safe_mode(&body.override_token) {
        Ok(success) => Json(json!({ "success": success })).into_response(),
        Err(err) => internal_error(&err),
    }
}

/// Builds and returns today's executive report.
async fn trigger_executive_report(State(state): State<AppState>) -> Response {
    match state.reporter.generate_and_dispatch().await {
        Ok(report) => Json(report).into_response(),
        Err(err) => internal_error(&err),
    }
}

fn internal_error(err: &dyn std::fmt::Display) -> Response {
    error!(error = %err, "handler failed");
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(json!({ "error": "internal" })),
    )
        .into_response()
}
