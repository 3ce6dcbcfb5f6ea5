//! Liveness endpoint.

use axum::{extract::State, Json};
use serde::Serialize;

use super::routes::ApiState;

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub uptime_secs: u64,
    /// `direct` or `pooled`
    pub proxy_mode: &'static str,
    /// Non-blacklisted proxies, `None` in direct mode.
    pub active_proxies: Option<usize>,
    pub active_monitors: usize,
    pub queued_enrichments: usize,
}

pub async fn health(State(state): State<ApiState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        uptime_secs: state.started.elapsed().as_secs(),
        proxy_mode: state.mode.label(),
        active_proxies: state.mode.pool().map(|p| p.metrics().active),
        active_monitors: state.scheduler.active_count(),
        queued_enrichments: state.enrich_queue.len(),
    })
}
