//! Blacklist management and ignored-alert lookup.

use std::sync::Arc;

use axum::{
    extract::{Path, State},
    http::StatusCode,
    routing::{delete, get},
    Json, Router,
};
use serde::{Deserialize, Serialize};

use sb_core::{domain::Ldap, store::IgnoredAlert};

use crate::{
    error::{ApiError, ApiResult},
    AppState,
};

pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/api/blacklist", get(list).post(add))
        .route("/api/blacklist/:ldap", delete(remove))
        .route("/api/ignored/:ldap", get(ignored))
}

#[derive(Debug, Serialize)]
struct BlacklistResponse {
    blacklist: Vec<Ldap>,
}

#[derive(Debug, Deserialize)]
struct BlacklistRequest {
    ldap: String,
}

async fn list(State(state): State<Arc<AppState>>) -> ApiResult<Json<BlacklistResponse>> {
    let blacklist = state.store.list().await?;
    Ok(Json(BlacklistResponse { blacklist }))
}

async fn add(
    State(state): State<Arc<AppState>>,
    Json(req): Json<BlacklistRequest>,
) -> ApiResult<StatusCode> {
    let ldap = req.ldap.trim();
    if ldap.is_empty() {
        return Err(ApiError::bad_request("ldap is required"));
    }
    state.store.add(&Ldap::new(ldap)).await?;
    tracing::info!("[WEB] Blacklisted {ldap}");
    Ok(StatusCode::CREATED)
}

async fn remove(
    State(state): State<Arc<AppState>>,
    Path(ldap): Path<String>,
) -> ApiResult<StatusCode> {
    state.store.remove(&Ldap(ldap.clone())).await?;
    tracing::info!("[WEB] Removed {ldap} from blacklist");
    Ok(StatusCode::NO_CONTENT)
}

#[derive(Debug, Serialize)]
struct IgnoredResponse {
    ignored: Vec<IgnoredAlert>,
}

async fn ignored(
    State(state): State<Arc<AppState>>,
    Path(ldap): Path<String>,
) -> ApiResult<Json<IgnoredResponse>> {
    let rules = state
        .store
        .get_ignored(&Ldap(ldap), chrono::Utc::now())
        .await?;
    let mut ignored: Vec<IgnoredAlert> = rules.into_values().collect();
    ignored.sort_by(|a, b| a.title.cmp(&b.title));
    Ok(Json(IgnoredResponse { ignored }))
}
