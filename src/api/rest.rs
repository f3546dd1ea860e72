// =============================================================================
// REST API Endpoints — Axum 0.7
// =============================================================================
//
// All endpoints live under `/api/v1/`. Both endpoints are public: the
// screener has no mutating surface, tiering applies only to the WebSocket
// feed. CORS is configured permissively for development; tighten
// `allowed_origins` in production.
// =============================================================================

use std::sync::Arc;

use axum::{
    extract::State,
    response::IntoResponse,
    routing::get,
    Router,
};
use serde::Serialize;
use tower_http::cors::{Any, CorsLayer};

use crate::app_state::AppState;

// =============================================================================
// Router construction
// =============================================================================

/// Build the full router with CORS middleware and shared state.
pub fn router(state: Arc<AppState>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/api/v1/health", get(health))
        .route("/api/v1/stats", get(stats))
        .route("/api/v1/ws", get(crate::api::ws::ws_handler))
        .layer(cors)
        .with_state(state)
}

// =============================================================================
// Handlers
// =============================================================================

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    tracked_symbols: usize,
    cached_snapshots: usize,
    server_time: i64,
}

async fn health(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let resp = HealthResponse {
        status: "ok",
        tracked_symbols: state.window_store.symbol_count(),
        cached_snapshots: state.fanout.cached_count(),
        server_time: chrono::Utc::now().timestamp_millis(),
    };
    axum::Json(resp)
}

async fn stats(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    axum::Json(state.stats_snapshot())
}
