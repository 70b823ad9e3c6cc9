use axum::extract::{DefaultBodyLimit, Request, State};
use axum::middleware::{self, Next};
use axum::response::Response;
use axum::routing::get;
use axum::Router;
use metrics_exporter_prometheus::PrometheusHandle;
use std::sync::Arc;
use tower_http::compression::CompressionLayer;
use tower_http::cors::CorsLayer;
use tower_http::limit::RequestBodyLimitLayer;
use tower_http::trace::TraceLayer;

use crate::app_state::AppState;
use error::ApiError;

pub mod error;
pub mod health;
pub mod jobs;
pub mod metrics;

pub const API_KEY_HEADER: &str = "x-api-key";

/// Multipart framing on top of the largest accepted file.
const BODY_OVERHEAD_BYTES: u64 = 1024 * 1024;

/// Token allow-list and rate limit for the `/api/v1` routes.
async fn require_api_key(
    State(state): State<AppState>,
    request: Request,
    next: Next,
) -> Result<Response, ApiError> {
    let presented = request
        .headers()
        .get(API_KEY_HEADER)
        .and_then(|v| v.to_str().ok());
    state.access.check(presented)?;
    Ok(next.run(request).await)
}

/// Assemble the full HTTP surface.
pub fn build_router(state: AppState, prometheus: Arc<PrometheusHandle>) -> Router {
    let body_limit = usize::try_from(state.max_upload_bytes.saturating_add(BODY_OVERHEAD_BYTES))
        .unwrap_or(usize::MAX);

    let api = Router::new()
        .route("/jobs", get(jobs::list_jobs).post(jobs::submit_job))
        .route("/jobs/{job_id}", get(jobs::get_job_status))
        .route_layer(middleware::from_fn_with_state(state.clone(), require_api_key))
        .layer(DefaultBodyLimit::disable())
        .layer(RequestBodyLimitLayer::new(body_limit));

    Router::new()
        .route("/health", get(health::health_check))
        .nest("/api/v1", api)
        .with_state(state)
        // Prometheus metrics endpoint (separate state)
        .route(
            "/metrics",
            get(metrics::prometheus_metrics).with_state(prometheus),
        )
        .layer(TraceLayer::new_for_http())
        .layer(CompressionLayer::new())
        .layer(CorsLayer::permissive())
}
