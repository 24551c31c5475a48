//! Kudos server binary: configuration, tracing bootstrap, and startup.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use kudos_gateway::{GatewayConfig, GoogleGatewayOptions, SlackGatewayOptions};
use kudos_store::SqliteKudosStore;
use tracing::level_filters::LevelFilter;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "kudos-server", about = "Multi-tenant kudos bot server")]
struct Cli {
    /// Address the HTTP gateway binds to.
    #[arg(long, env = "KUDOS_BIND", default_value = "0.0.0.0:8080")]
    bind: String,

    /// SQLite database file holding all tenant state.
    #[arg(long, env = "KUDOS_DATABASE_PATH", default_value = "kudos.sqlite")]
    database_path: PathBuf,

    /// Public base URL this server is reachable at; OAuth redirect URIs
    /// are derived from it.
    #[arg(long, env = "KUDOS_EXTERNAL_BASE_URL", default_value = "http://localhost:8080")]
    external_base_url: String,

    #[arg(long, env = "SLACK_CLIENT_ID")]
    slack_client_id: Option<String>,
    #[arg(long, env = "SLACK_CLIENT_SECRET")]
    slack_client_secret: Option<String>,
    #[arg(long, env = "SLACK_SIGNING_SECRET")]
    slack_signing_secret: Option<String>,

    #[arg(long, env = "GOOGLE_CLIENT_ID")]
    google_client_id: Option<String>,
    #[arg(long, env = "GOOGLE_CLIENT_SECRET")]
    google_client_secret: Option<String>,
    #[arg(long, env = "GOOGLE_PROJECT_ID")]
    google_project_id: Option<String>,
    #[arg(long, env = "GOOGLE_CHAT_WEBHOOK_TOKEN")]
    google_chat_webhook_token: Option<String>,
}

fn init_tracing() {
    let env_filter = EnvFilter::builder()
        .with_default_directive(LevelFilter::INFO.into())
        .from_env_lossy();

    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .compact()
        .init();
}

fn build_gateway_config(cli: &Cli) -> GatewayConfig {
    let slack = match (&cli.slack_client_id, &cli.slack_client_secret) {
        (Some(client_id), Some(client_secret)) => {
            let mut options =
                SlackGatewayOptions::new(client_id.clone(), client_secret.clone());
            options.signing_secret = cli.slack_signing_secret.clone();
            Some(options)
        }
        (None, None) => None,
        _ => {
            tracing::warn!("slack requires both SLACK_CLIENT_ID and SLACK_CLIENT_SECRET; disabled");
            None
        }
    };

    let google = match (
        &cli.google_client_id,
        &cli.google_client_secret,
        &cli.google_project_id,
    ) {
        (Some(client_id), Some(client_secret), Some(project_id)) => {
            let mut options = GoogleGatewayOptions::new(
                client_id.clone(),
                client_secret.clone(),
                project_id.clone(),
            );
            options.webhook_token = cli.google_chat_webhook_token.clone();
            Some(options)
        }
        (None, None, None) => None,
        _ => {
            tracing::warn!(
                "google chat requires GOOGLE_CLIENT_ID, GOOGLE_CLIENT_SECRET, and GOOGLE_PROJECT_ID; disabled"
            );
            None
        }
    };

    GatewayConfig {
        bind: cli.bind.clone(),
        external_base_url: cli.external_base_url.clone(),
        slack,
        google,
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();

    let store = SqliteKudosStore::new(&cli.database_path).with_context(|| {
        format!("failed to open database at {}", cli.database_path.display())
    })?;
    tracing::info!(path = %cli.database_path.display(), "kudos database ready");

    let config = build_gateway_config(&cli);
    if config.slack.is_none() && config.google.is_none() {
        tracing::warn!("no chat platform configured; only /health will respond usefully");
    }

    kudos_gateway::run_server(Arc::new(store), config).await
}
