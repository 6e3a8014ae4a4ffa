//! Prometheus /metrics + health check HTTP endpoints
//!
//! Endpoints:
//!   GET /metrics  - Prometheus text format
//!   GET /healthz  - Liveness check (always 200 if process is running)
//!   GET /readyz   - Readiness check (200 if storage is reachable), rate limited

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;

use anyhow::Result;
use axum::{
    extract::{ConnectInfo, Request, State},
    http::StatusCode,
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::get,
    Router,
};
use coffer_vault::{client_key, RateLimiter, ReapStats};
use prometheus_client::{encoding::text::encode, metrics::counter::Counter, registry::Registry};

/// Daemon counters, registered once at startup.
#[derive(Clone, Default)]
pub struct DaemonMetrics {
    pub reaped: Counter,
    pub reap_failures: Counter,
    pub stale_downloads: Counter,
    pub rate_limited: Counter,
}

impl DaemonMetrics {
    pub fn register(registry: &mut Registry) -> Self {
        let metrics = Self::default();
        registry.register(
            "coffer_reaper_deleted",
            "Expired transfers deleted by the reaper",
            metrics.reaped.clone(),
        );
        registry.register(
            "coffer_reaper_failures",
            "Expired transfers the reaper failed to delete",
            metrics.reap_failures.clone(),
        );
        registry.register(
            "coffer_reaper_stale_downloads",
            "Abandoned download sessions dropped by the reaper",
            metrics.stale_downloads.clone(),
        );
        registry.register(
            "coffer_limiter_rejections",
            "Requests rejected by the rate limiter",
            metrics.rate_limited.clone(),
        );
        metrics
    }

    pub fn observe_sweep(&self, stats: &ReapStats) {
        self.reaped.inc_by(stats.deleted as u64);
        self.reap_failures.inc_by(stats.failed as u64);
        self.stale_downloads.inc_by(stats.stale_downloads as u64);
    }
}

/// Shared state behind the HTTP endpoints
#[derive(Clone)]
pub struct HealthState {
    pub registry: Arc<Registry>,
    pub operator: opendal::Operator,
    pub limiter: Arc<RateLimiter>,
    pub metrics: DaemonMetrics,
}

pub fn router(state: HealthState) -> Router {
    let limited = Router::new()
        .route("/readyz", get(readyz_handler))
        .route_layer(middleware::from_fn_with_state(state.clone(), rate_limit));

    Router::new()
        .route("/metrics", get(metrics_handler))
        .route("/healthz", get(healthz_handler))
        .merge(limited)
        .with_state(state)
}

/// Serve metrics and health endpoints on `addr` (e.g. "127.0.0.1:9100")
pub async fn serve(addr: String, state: HealthState) -> Result<()> {
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .map_err(|e| anyhow::anyhow!("metrics bind {addr}: {e}"))?;

    tracing::info!(addr = %addr, "metrics: listening on /metrics, /healthz, /readyz");

    axum::serve(
        listener,
        router(state).into_make_service_with_connect_info::<SocketAddr>(),
    )
    .await
    .map_err(|e| anyhow::anyhow!("metrics server: {e}"))
}

async fn rate_limit(State(state): State<HealthState>, req: Request, next: Next) -> Response {
    let peer = req
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| addr.ip())
        .unwrap_or(IpAddr::V4(Ipv4Addr::UNSPECIFIED));
    let forwarded = req
        .headers()
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok());
    let key = client_key(forwarded, peer);

    if !state.limiter.allow(&key) {
        state.metrics.rate_limited.inc();
        tracing::debug!(client = %key, path = %req.uri().path(), "rate limited");
        return (StatusCode::TOO_MANY_REQUESTS, "too many requests").into_response();
    }
    next.run(req).await
}

async fn metrics_handler(State(state): State<HealthState>) -> impl IntoResponse {
    let mut body = String::new();
    match encode(&mut body, &state.registry) {
        Ok(()) => (
            StatusCode::OK,
            [("content-type", "text/plain; version=0.0.4")],
            body,
        ),
        Err(e) => {
            tracing::error!("metrics encode failed: {e}");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                [("content-type", "text/plain")],
                e.to_string(),
            )
        }
    }
}

/// Liveness check: returns 200 if the process is running.
async fn healthz_handler() -> impl IntoResponse {
    (StatusCode::OK, "ok")
}

/// Readiness check: returns 200 if storage is reachable, 503 otherwise.
async fn readyz_handler(State(state): State<HealthState>) -> impl IntoResponse {
    match coffer_storage::check_health(&state.operator).await {
        Ok(()) => (StatusCode::OK, "ready"),
        Err(_) => (StatusCode::SERVICE_UNAVAILABLE, "storage unreachable"),
    }
}
