//! JSON web frontend over the alert store.
//!
//! Security staff use it to browse alerts, raise new ones, manage the
//! blacklist and look up user profiles.

use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use sb_core::{config::FrontendConfig, store::BotStore};

pub mod api;
pub mod error;

pub struct AppState {
    pub store: Arc<dyn BotStore>,
    /// Base URL of the profile service; `/api/profile` is disabled when unset.
    pub profile_api: Option<String>,
    pub http: reqwest::Client,
}

impl AppState {
    pub fn new(store: Arc<dyn BotStore>, profile_api: Option<String>) -> anyhow::Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(10))
            .build()?;
        Ok(Self {
            store,
            profile_api: profile_api.map(|u| u.trim_end_matches('/').to_string()),
            http,
        })
    }
}

/// Bind and serve until `cancel` fires.
pub async fn serve(
    cfg: &FrontendConfig,
    store: Arc<dyn BotStore>,
    cancel: CancellationToken,
) -> anyhow::Result<()> {
    let state = Arc::new(AppState::new(store, cfg.profile_api.clone())?);
    let app = api::router(state);

    let listener = tokio::net::TcpListener::bind(cfg.bind).await?;
    tracing::info!("[WEB] Listening on http://{}", listener.local_addr()?);

    axum::serve(listener, app)
        .with_graceful_shutdown(async move { cancel.cancelled().await })
        .await?;

    tracing::info!("[WEB] Stopped");
    Ok(())
}
