//! Alert browsing and creation.

use std::sync::Arc;

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    routing::get,
    Json, Router,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use sb_core::{
    domain::{AlertHash, Ldap},
    store::{AlertQuery, NewAlert},
    tasker::{Escalation, Task, TaskStatus},
};

use crate::{
    error::{ApiError, ApiResult},
    AppState,
};

pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/api/alerts", get(list_alerts).post(create_alert))
        .route("/api/alerts/:hash", get(get_alert))
}

/// Query string for `GET /api/alerts`. `titles` is comma separated.
#[derive(Debug, Default, Deserialize)]
pub struct AlertParams {
    pub status: Option<String>,
    pub ldap: Option<String>,
    pub titles: Option<String>,
    pub performed: Option<bool>,
    pub authenticated: Option<bool>,
    pub after: Option<DateTime<Utc>>,
    pub before: Option<DateTime<Utc>>,
    pub limit: Option<u32>,
}

impl AlertParams {
    fn into_query(self) -> ApiResult<AlertQuery> {
        let status = self
            .status
            .as_deref()
            .filter(|s| !s.is_empty())
            .map(TaskStatus::parse)
            .transpose()?;
        let titles = self
            .titles
            .map(|t| {
                t.split(',')
                    .map(str::trim)
                    .filter(|t| !t.is_empty())
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default();
        Ok(AlertQuery {
            status,
            ldap: self.ldap.filter(|l| !l.is_empty()).map(Ldap),
            titles,
            performed: self.performed,
            authenticated: self.authenticated,
            after: self.after,
            before: self.before,
            limit: self.limit,
        })
    }
}

#[derive(Debug, Serialize)]
struct AlertsResponse {
    alerts: Vec<Task>,
}

async fn list_alerts(
    State(state): State<Arc<AppState>>,
    Query(params): Query<AlertParams>,
) -> ApiResult<Json<AlertsResponse>> {
    let query = params.into_query()?;
    let alerts = state.store.query(&query).await?;
    Ok(Json(AlertsResponse { alerts }))
}

async fn get_alert(
    State(state): State<Arc<AppState>>,
    Path(hash): Path<String>,
) -> ApiResult<Json<Task>> {
    if !AlertHash::is_well_formed(&hash) {
        return Err(ApiError::bad_request("alert hash must be 64 lowercase hex characters"));
    }
    state
        .store
        .get(&AlertHash(hash.clone()))
        .await?
        .map(Json)
        .ok_or_else(|| ApiError::not_found(format!("alert {hash}")))
}

#[derive(Debug, Deserialize)]
pub struct EscalationRequest {
    pub ldap: String,
    pub delay_secs: u64,
}

#[derive(Debug, Deserialize)]
pub struct CreateAlertRequest {
    pub ldap: String,
    pub title: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub reason: String,
    #[serde(default)]
    pub url: String,
    #[serde(default)]
    pub escalation: Vec<EscalationRequest>,
}

impl CreateAlertRequest {
    fn into_new_alert(self) -> ApiResult<NewAlert> {
        let ldap = self.ldap.trim();
        let title = self.title.trim();
        if ldap.is_empty() {
            return Err(ApiError::bad_request("ldap is required"));
        }
        if title.is_empty() {
            return Err(ApiError::bad_request("title is required"));
        }
        if let Some(e) = self.escalation.iter().find(|e| e.ldap.trim().is_empty()) {
            return Err(ApiError::bad_request(format!(
                "escalation after {}s has no ldap",
                e.delay_secs
            )));
        }
        let alert = NewAlert {
            ldap: Ldap::new(ldap),
            title: title.to_string(),
            description: self.description,
            reason: self.reason,
            url: self.url,
            escalation: self
                .escalation
                .into_iter()
                .map(|e| Escalation {
                    ldap: Ldap::new(e.ldap.trim()),
                    delay_secs: e.delay_secs,
                    notified_at: None,
                })
                .collect(),
        };
        alert.validate()?;
        Ok(alert)
    }
}

#[derive(Debug, Serialize)]
struct CreatedResponse {
    hash: AlertHash,
}

async fn create_alert(
    State(state): State<Arc<AppState>>,
    Json(req): Json<CreateAlertRequest>,
) -> ApiResult<(StatusCode, Json<CreatedResponse>)> {
    let alert = req.into_new_alert()?;
    let hash = state.store.create_alert(alert).await?;
    tracing::info!("[WEB] Alert {hash} created");
    Ok((StatusCode::CREATED, Json(CreatedResponse { hash })))
}
