//! Proxy to the external profile service.

use std::sync::Arc;

use axum::{
    extract::{Path, State},
    routing::get,
    Json, Router,
};
use percent_encoding::{utf8_percent_encode, AsciiSet, NON_ALPHANUMERIC};

use crate::{
    error::{ApiError, ApiResult},
    AppState,
};

pub fn router() -> Router<Arc<AppState>> {
    Router::new().route("/api/profile/:ldap", get(profile))
}

async fn profile(
    State(state): State<Arc<AppState>>,
    Path(ldap): Path<String>,
) -> ApiResult<Json<serde_json::Value>> {
    let Some(base) = state.profile_api.as_deref() else {
        return Err(ApiError::not_found("profile api"));
    };
    let url = profile_url(base, &ldap)?;

    let resp = state
        .http
        .get(&url)
        .send()
        .await
        .map_err(|e| ApiError::BadGateway(format!("profile api unreachable: {e}")))?;

    let status = resp.status();
    if status == reqwest::StatusCode::NOT_FOUND {
        return Err(ApiError::not_found(format!("profile {ldap}")));
    }
    if !status.is_success() {
        return Err(ApiError::BadGateway(format!("profile api returned {status}")));
    }
    let body = resp
        .json()
        .await
        .map_err(|e| ApiError::BadGateway(format!("profile api sent invalid json: {e}")))?;
    Ok(Json(body))
}

/// Unreserved characters stay as they are; everything else is escaped.
const SEGMENT: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'-')
    .remove(b'_')
    .remove(b'.')
    .remove(b'~');

/// The ldap becomes exactly one path segment under `base`.
fn profile_url(base: &str, ldap: &str) -> ApiResult<String> {
    if ldap.is_empty() || ldap.chars().all(|c| c == '.') {
        return Err(ApiError::bad_request(format!("invalid ldap `{ldap}`")));
    }
    if ldap.chars().any(char::is_control) {
        return Err(ApiError::bad_request("ldap contains control characters"));
    }
    Ok(format!("{base}/{}", utf8_percent_encode(ldap, SEGMENT)))
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use axum::http::{Method, StatusCode};
    use sb_core::store::memory::MemoryStore;

    use super::profile_url;
    use crate::error::ApiError;
    use crate::api::test_support::{app_with, call};

    #[test]
    fn ldap_stays_one_segment() {
        assert_eq!(
            profile_url("http://profiles/api", "../admin?x=1").unwrap(),
            "http://profiles/api/..%2Fadmin%3Fx%3D1"
        );
        assert_eq!(profile_url("http://p", "jane.doe").unwrap(), "http://p/jane.doe");
        assert_eq!(profile_url("http://p", "jane doe").unwrap(), "http://p/jane%20doe");
    }

    #[test]
    fn dot_segments_are_rejected() {
        for ldap in ["", ".", "..", "..."] {
            assert!(
                matches!(profile_url("http://p", ldap), Err(ApiError::BadRequest(_))),
                "{ldap:?}"
            );
        }
        assert!(profile_url("http://p", "a\nb").is_err());
    }

    #[tokio::test]
    async fn encoded_dots_are_rejected_before_any_request() {
        // Nothing listens here; a 400 proves no upstream call was attempted.
        let app = app_with(
            Arc::new(MemoryStore::new()),
            Some("http://127.0.0.1:9/people".to_string()),
        );
        let (status, body) = call(&app, Method::GET, "/api/profile/%2E%2E", None).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"], "bad_request");
    }

    #[tokio::test]
    async fn disabled_without_profile_api() {
        let app = app_with(Arc::new(MemoryStore::new()), None);
        let (status, body) = call(&app, Method::GET, "/api/profile/alice", None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["error"], "not_found");
    }

    #[tokio::test]
    async fn proxies_upstream_profiles() {
        use axum::{routing::get, Json, Router};

        let upstream = Router::new().route(
            "/people/:ldap",
            get(|axum::extract::Path(ldap): axum::extract::Path<String>| async move {
                if ldap == "alice" {
                    Ok(Json(serde_json::json!({"name": "Alice", "manager": "carol"})))
                } else {
                    Err(StatusCode::NOT_FOUND)
                }
            }),
        );
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, upstream).await.unwrap();
        });

        let app = app_with(
            Arc::new(MemoryStore::new()),
            Some(format!("http://{addr}/people/")),
        );
        let (status, body) = call(&app, Method::GET, "/api/profile/alice", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["manager"], "carol");

        let (status, _) = call(&app, Method::GET, "/api/profile/bob", None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }
}
