use std::{path::PathBuf, sync::Arc};

use anyhow::Context;
use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;

use sb_core::{
    auth::Authenticator,
    bot::{BotSettings, SecurityBot},
    chat::{
        port::ChatPort,
        throttled::{ThrottleConfig, ThrottledChat},
    },
    config::{load_dotenv_if_present, BotConfig, FrontendConfig},
    store::BotStore,
};
use sb_duo::DuoClient;
use sb_slack::SlackChat;
use sb_sql::MySqlStore;

#[derive(Debug, Parser)]
#[command(name = "securitybot", version, about = "Distributed alerting bot and its web frontend")]
struct Cli {
    #[command(subcommand)]
    command: Cmd,
}

#[derive(Debug, Subcommand)]
enum Cmd {
    /// Run the chat bot.
    Bot,
    /// Serve the JSON frontend.
    Frontend,
    /// Validate a compose file against the current environment.
    CheckDeploy {
        #[arg(default_value = "docker-compose.yml")]
        path: PathBuf,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    match cli.command {
        Cmd::Bot => run_bot().await,
        Cmd::Frontend => run_frontend().await,
        Cmd::CheckDeploy { path } => check_deploy(&path),
    }
}

/// Cancel on Ctrl-C or SIGTERM.
fn shutdown_token() -> CancellationToken {
    let cancel = CancellationToken::new();
    let token = cancel.clone();
    tokio::spawn(async move {
        wait_for_signal().await;
        tracing::info!("Shutdown requested");
        token.cancel();
    });
    cancel
}

#[cfg(unix)]
async fn wait_for_signal() {
    use tokio::signal::unix::{signal, SignalKind};
    match signal(SignalKind::terminate()) {
        Ok(mut term) => {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {}
                _ = term.recv() => {}
            }
        }
        Err(e) => {
            tracing::warn!("SIGTERM handler unavailable: {e}");
            let _ = tokio::signal::ctrl_c().await;
        }
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() {
    let _ = tokio::signal::ctrl_c().await;
}

async fn open_store(db: &sb_core::config::DbConfig) -> anyhow::Result<Arc<dyn BotStore>> {
    let store = MySqlStore::connect(db)
        .await
        .context("connecting to database")?;
    store.migrate().await.context("creating tables")?;
    Ok(Arc::new(store))
}

async fn run_bot() -> anyhow::Result<()> {
    sb_core::logging::init("securitybot")?;
    let cfg = BotConfig::load()?;

    let store = open_store(&cfg.db).await?;

    let slack: Arc<dyn ChatPort> = Arc::new(SlackChat::new(cfg.slack_api_token.clone())?);
    let chat: Arc<dyn ChatPort> = Arc::new(ThrottledChat::new(slack, ThrottleConfig::default()));

    let auth: Option<Arc<dyn Authenticator>> = match cfg.duo.clone() {
        Some(duo) => Some(Arc::new(DuoClient::new(duo)?)),
        None => None,
    };

    let mut bot = SecurityBot::new(BotSettings::from(&cfg), chat, store, auth);
    bot.run(shutdown_token()).await?;
    Ok(())
}

async fn run_frontend() -> anyhow::Result<()> {
    sb_core::logging::init("securitybot")?;
    let cfg = FrontendConfig::load()?;

    let store = open_store(&cfg.db).await?;
    sb_frontend::serve(&cfg, store, shutdown_token()).await
}

fn check_deploy(path: &std::path::Path) -> anyhow::Result<()> {
    // Compose reads `.env` next to the file for interpolation.
    if let Some(dir) = path.parent() {
        load_dotenv_if_present(&dir.join(".env"));
    }

    let file = sb_deploy::load(path).with_context(|| format!("reading {}", path.display()))?;
    let report = sb_deploy::validate(&file, &|name| std::env::var(name).ok());
    println!("{report}");
    if !report.is_ok() {
        anyhow::bail!("{} has {} issue(s)", path.display(), report.issues.len());
    }
    Ok(())
}
