//! HTTP surface for the kudos app: slash-command webhooks, OAuth
//! install flow, and a health probe.
//!
//! All routing and request binding lives here; the ledger, parser, and
//! store crates stay payload-shape-agnostic.

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::extract::State;
use axum::routing::{get, post};
use axum::{Json, Router};
use kudos_ledger::KudosLedger;
use kudos_oauth::{GoogleOAuthClient, SlackOAuthClient, StateGuard};
use kudos_store::KudosStore;
use tokio::net::TcpListener;

mod googlechat;
mod render;
mod slack;

pub use slack::{verify_slack_signature, SlackApiClient};

/// Slack-specific gateway options.
#[derive(Debug, Clone)]
pub struct SlackGatewayOptions {
    pub client_id: String,
    pub client_secret: String,
    /// Request signing secret; signature verification is skipped when absent.
    pub signing_secret: Option<String>,
    /// Slack API base, overridable for tests.
    pub api_base: String,
}

impl SlackGatewayOptions {
    pub fn new(client_id: String, client_secret: String) -> Self {
        Self {
            client_id,
            client_secret,
            signing_secret: None,
            api_base: "https://slack.com".to_string(),
        }
    }
}

/// Google Chat-specific gateway options.
#[derive(Debug, Clone)]
pub struct GoogleGatewayOptions {
    pub client_id: String,
    pub client_secret: String,
    /// Cloud project the Chat app is registered under; recorded as the
    /// installation's external identifier at install time.
    pub project_id: String,
    /// Shared webhook bearer token; verification is skipped when absent.
    pub webhook_token: Option<String>,
    pub auth_base: String,
    pub token_base: String,
}

impl GoogleGatewayOptions {
    pub fn new(client_id: String, client_secret: String, project_id: String) -> Self {
        Self {
            client_id,
            client_secret,
            project_id,
            webhook_token: None,
            auth_base: "https://accounts.google.com".to_string(),
            token_base: "https://oauth2.googleapis.com".to_string(),
        }
    }
}

/// Gateway configuration assembled by the binary.
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    pub bind: String,
    /// Public base URL this server is reachable at; OAuth redirect URIs
    /// are derived from it.
    pub external_base_url: String,
    pub slack: Option<SlackGatewayOptions>,
    pub google: Option<GoogleGatewayOptions>,
}

/// Shared state handed to every request handler.
pub struct GatewayState {
    ledger: KudosLedger,
    store: Arc<dyn KudosStore>,
    state_guard: StateGuard,
    slack: Option<SlackGatewayState>,
    google: Option<GoogleGatewayState>,
}

struct SlackGatewayState {
    oauth: SlackOAuthClient,
    api: SlackApiClient,
    signing_secret: Option<String>,
}

struct GoogleGatewayState {
    oauth: GoogleOAuthClient,
    project_id: String,
    webhook_token: Option<String>,
}

impl GatewayState {
    pub fn new(store: Arc<dyn KudosStore>, config: &GatewayConfig) -> Self {
        let base = config.external_base_url.trim_end_matches('/');
        let slack = config.slack.as_ref().map(|options| SlackGatewayState {
            oauth: SlackOAuthClient::with_api_base(
                options.api_base.clone(),
                options.client_id.clone(),
                options.client_secret.clone(),
                format!("{base}/auth/slack/callback"),
            ),
            api: SlackApiClient::new(options.api_base.clone()),
            signing_secret: options.signing_secret.clone(),
        });
        let google = config.google.as_ref().map(|options| GoogleGatewayState {
            oauth: GoogleOAuthClient::with_bases(
                options.auth_base.clone(),
                options.token_base.clone(),
                options.client_id.clone(),
                options.client_secret.clone(),
                format!("{base}/auth/googlechat/callback"),
            ),
            project_id: options.project_id.clone(),
            webhook_token: options.webhook_token.clone(),
        });

        Self {
            ledger: KudosLedger::new(store.clone()),
            store,
            state_guard: StateGuard::new(),
            slack,
            google,
        }
    }
}

/// Builds the application router over shared state.
pub fn build_router(state: Arc<GatewayState>) -> Router {
    let slack_webhook = Router::new()
        .route("/webhook/slack", post(slack::handle_slash_command))
        .layer(axum::middleware::from_fn_with_state(
            state.clone(),
            slack::require_slack_signature,
        ));

    Router::new()
        .route("/health", get(handle_health))
        .route("/auth/slack", get(slack::handle_login))
        .route("/auth/slack/callback", get(slack::handle_callback))
        .route("/auth/googlechat", get(googlechat::handle_login))
        .route("/auth/googlechat/callback", get(googlechat::handle_callback))
        .route("/webhook/googlechat", post(googlechat::handle_event))
        .merge(slack_webhook)
        .with_state(state)
}

/// Binds and serves the gateway until ctrl-c.
pub async fn run_server(store: Arc<dyn KudosStore>, config: GatewayConfig) -> Result<()> {
    let bind_addr = config
        .bind
        .parse::<SocketAddr>()
        .with_context(|| format!("invalid bind address '{}'", config.bind))?;

    let state = Arc::new(GatewayState::new(store, &config));
    let app = build_router(state);

    let listener = TcpListener::bind(bind_addr)
        .await
        .with_context(|| format!("failed to bind kudos gateway on {bind_addr}"))?;
    let local_addr = listener
        .local_addr()
        .context("failed to resolve bound gateway address")?;
    tracing::info!(addr = %local_addr, "kudos gateway listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
        })
        .await
        .context("kudos gateway exited unexpectedly")
}

async fn handle_health(State(_state): State<Arc<GatewayState>>) -> Json<serde_json::Value> {
    Json(serde_json::json!({ "status": "ok" }))
}

/// Organizations are created lazily on first install and shared by
/// later installs under the same name.
pub(crate) async fn find_or_create_organization(
    state: &GatewayState,
    name: &str,
) -> Result<kudos_types::Organization, kudos_store::KudosStoreError> {
    match state.store.create_organization(name).await {
        Ok(organization) => Ok(organization),
        Err(kudos_store::KudosStoreError::OrganizationAlreadyExists(_)) => state
            .store
            .organization_by_name(name)
            .await?
            .ok_or(kudos_store::KudosStoreError::OrganizationAlreadyExists(
                name.to_string(),
            )),
        Err(error) => Err(error),
    }
}

#[cfg(test)]
mod tests;
