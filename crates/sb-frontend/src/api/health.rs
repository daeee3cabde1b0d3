use std::sync::Arc;

use axum::{extract::State, routing::get, Json, Router};
use serde::Serialize;

use sb_core::store::AlertQuery;

use crate::AppState;

#[derive(Debug, Serialize)]
struct HealthResponse {
    status: &'static str,
    service: &'static str,
    version: &'static str,
    database: &'static str,
    timestamp: String,
}

pub fn router() -> Router<Arc<AppState>> {
    Router::new().route("/health", get(health))
}

async fn health(State(state): State<Arc<AppState>>) -> Json<HealthResponse> {
    let ping = AlertQuery {
        limit: Some(1),
        ..Default::default()
    };
    let database = match state.store.query(&ping).await {
        Ok(_) => "ok",
        Err(e) => {
            tracing::warn!("[WEB] Health check query failed: {e}");
            "unreachable"
        }
    };
    Json(HealthResponse {
        status: "ok",
        service: "securitybot-frontend",
        version: env!("CARGO_PKG_VERSION"),
        database,
        timestamp: chrono::Utc::now().to_rfc3339(),
    })
}
