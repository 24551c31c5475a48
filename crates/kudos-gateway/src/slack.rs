//! Slack webhook and install-flow handlers.

use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use axum::body::Body;
use axum::extract::{Query, Request, State};
use axum::http::StatusCode;
use axum::middleware::Next;
use axum::response::{Html, IntoResponse, Redirect, Response};
use axum::{Form, Json};
use hmac::{Hmac, Mac};
use kudos_command::{parse_command, SlackMentions};
use kudos_store::NewInstallation;
use kudos_types::{Identity, Platform};
use serde::Deserialize;
use sha2::Sha256;

use crate::render;
use crate::GatewayState;

/// Maximum age of a signed request before it is treated as a replay.
const SIGNATURE_MAX_AGE_SECONDS: i64 = 300;

const SIGNATURE_HEADER: &str = "x-slack-signature";
const TIMESTAMP_HEADER: &str = "x-slack-request-timestamp";

/// Slash-command payload as Slack delivers it, form-encoded.
#[derive(Debug, Clone, Deserialize)]
pub(crate) struct SlackSlashCommand {
    pub team_id: String,
    #[serde(default)]
    pub channel_id: String,
    #[serde(default)]
    pub user_id: String,
    #[serde(default)]
    pub user_name: String,
    #[serde(default)]
    pub text: String,
}

#[derive(Debug, Deserialize)]
pub(crate) struct SlackCallbackParams {
    #[serde(default)]
    pub code: String,
    #[serde(default)]
    pub state: String,
    #[serde(default)]
    pub error: String,
}

/// Verifies the `v0` HMAC-SHA256 request signature Slack attaches to
/// webhook deliveries. Requests older than the replay window fail even
/// with a correct signature.
pub fn verify_slack_signature(
    signing_secret: &str,
    timestamp: &str,
    body: &[u8],
    signature: &str,
    now_unix: i64,
) -> bool {
    let Ok(issued_at) = timestamp.parse::<i64>() else {
        return false;
    };
    if (now_unix - issued_at).abs() > SIGNATURE_MAX_AGE_SECONDS {
        return false;
    }
    let Some(signature_hex) = signature.strip_prefix("v0=") else {
        return false;
    };
    let Some(signature_bytes) = hex_decode(signature_hex) else {
        return false;
    };

    let Ok(mut mac) = Hmac::<Sha256>::new_from_slice(signing_secret.as_bytes()) else {
        return false;
    };
    mac.update(format!("v0:{timestamp}:").as_bytes());
    mac.update(body);
    mac.verify_slice(&signature_bytes).is_ok()
}

fn hex_decode(value: &str) -> Option<Vec<u8>> {
    if value.len() % 2 != 0 {
        return None;
    }
    let mut bytes = Vec::with_capacity(value.len() / 2);
    let raw = value.as_bytes();
    for pair in raw.chunks(2) {
        let high = (pair[0] as char).to_digit(16)?;
        let low = (pair[1] as char).to_digit(16)?;
        bytes.push((high * 16 + low) as u8);
    }
    Some(bytes)
}

fn now_unix() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_secs() as i64)
        .unwrap_or(0)
}

/// Middleware enforcing the request signature when a signing secret is
/// configured. The body is buffered for verification and handed back to
/// the form extractor untouched.
pub(crate) async fn require_slack_signature(
    State(state): State<Arc<GatewayState>>,
    request: Request,
    next: Next,
) -> Result<Response, StatusCode> {
    let Some(slack) = &state.slack else {
        return Err(StatusCode::SERVICE_UNAVAILABLE);
    };
    let Some(signing_secret) = slack.signing_secret.clone() else {
        return Ok(next.run(request).await);
    };

    let (parts, body) = request.into_parts();
    let bytes = axum::body::to_bytes(body, 1 << 20)
        .await
        .map_err(|_| StatusCode::BAD_REQUEST)?;

    let timestamp = parts
        .headers
        .get(TIMESTAMP_HEADER)
        .and_then(|value| value.to_str().ok())
        .unwrap_or_default();
    let signature = parts
        .headers
        .get(SIGNATURE_HEADER)
        .and_then(|value| value.to_str().ok())
        .unwrap_or_default();

    if !verify_slack_signature(&signing_secret, timestamp, &bytes, signature, now_unix()) {
        tracing::warn!("rejected slack webhook with bad signature");
        return Err(StatusCode::UNAUTHORIZED);
    }

    let request = Request::from_parts(parts, Body::from(bytes));
    Ok(next.run(request).await)
}

/// Handles a `/kudos` slash command delivery.
pub(crate) async fn handle_slash_command(
    State(state): State<Arc<GatewayState>>,
    Form(command): Form<SlackSlashCommand>,
) -> Response {
    let Some(slack) = &state.slack else {
        return StatusCode::SERVICE_UNAVAILABLE.into_response();
    };

    let installation = match state.ledger.installation(&command.team_id).await {
        Ok(installation) => installation,
        Err(error) => return ephemeral(error.user_message()),
    };

    let parsed = match parse_command(&SlackMentions, &command.text) {
        Ok(parsed) => parsed,
        Err(error) => return ephemeral(format!("\u{274C} {error}")),
    };

    let sender = if command.user_name.is_empty() {
        Identity::External(command.user_id.clone())
    } else {
        Identity::Username(command.user_name.clone())
    };
    let receipt = match state
        .ledger
        .grant(&command.team_id, &sender, &parsed.target, &parsed.description)
        .await
    {
        Ok(receipt) => receipt,
        Err(error) => {
            tracing::warn!(workspace = %command.team_id, error = %error, "grant failed");
            return ephemeral(error.user_message());
        }
    };

    let text = render::slack_celebration(&parsed.target, &receipt);
    if let Err(error) = slack
        .api
        .post_message(&installation.bot_token, &command.channel_id, &text)
        .await
    {
        tracing::warn!(channel = %command.channel_id, error = %error, "failed to post message");
        return ephemeral("Kudos recorded, but posting the announcement failed.".to_string());
    }

    StatusCode::OK.into_response()
}

fn ephemeral(text: String) -> Response {
    Json(serde_json::json!({
        "response_type": "ephemeral",
        "text": text,
    }))
    .into_response()
}

/// Starts the Slack OAuth flow with a fresh CSRF state token.
pub(crate) async fn handle_login(State(state): State<Arc<GatewayState>>) -> Response {
    let Some(slack) = &state.slack else {
        return StatusCode::SERVICE_UNAVAILABLE.into_response();
    };
    let token = state.state_guard.issue();
    Redirect::temporary(&slack.oauth.authorize_url(&token)).into_response()
}

/// Completes the Slack OAuth flow and records the installation.
pub(crate) async fn handle_callback(
    State(state): State<Arc<GatewayState>>,
    Query(params): Query<SlackCallbackParams>,
) -> Response {
    let Some(slack) = &state.slack else {
        return StatusCode::SERVICE_UNAVAILABLE.into_response();
    };
    if !params.error.is_empty() {
        return (
            StatusCode::BAD_REQUEST,
            format!("OAuth authorization denied: {}", params.error),
        )
            .into_response();
    }
    if params.code.is_empty() {
        return (StatusCode::BAD_REQUEST, "Missing authorization code").into_response();
    }
    if !state.state_guard.consume(&params.state) {
        return (
            StatusCode::BAD_REQUEST,
            "Invalid or expired authentication request",
        )
            .into_response();
    }

    let grant = match slack.oauth.exchange_code(&params.code).await {
        Ok(grant) => grant,
        Err(error) => {
            tracing::error!(error = %error, "slack oauth exchange failed");
            return (
                StatusCode::INTERNAL_SERVER_ERROR,
                "Failed to exchange code for token",
            )
                .into_response();
        }
    };

    let organization = match crate::find_or_create_organization(&state, &grant.team_name).await {
        Ok(organization) => organization,
        Err(error) => {
            tracing::error!(error = %error, "organization lookup failed");
            return (
                StatusCode::INTERNAL_SERVER_ERROR,
                "Failed to store installation",
            )
                .into_response();
        }
    };

    let created = state
        .store
        .create_installation(NewInstallation {
            platform: Platform::Slack,
            organization_id: organization.id,
            external_installation_id: grant.team_id.clone(),
            access_token: grant.access_token.clone(),
            bot_token: grant.bot.bot_access_token.clone(),
        })
        .await;
    if let Err(error) = created {
        tracing::error!(error = %error, "installation creation failed");
        return (
            StatusCode::INTERNAL_SERVER_ERROR,
            "Failed to store installation",
        )
            .into_response();
    }

    tracing::info!(team = %grant.team_name, "slack installation completed");
    Html(render::install_success_page(&grant.team_name)).into_response()
}

/// Minimal Slack Web API client for posting channel messages.
#[derive(Debug, Clone)]
pub struct SlackApiClient {
    http: reqwest::Client,
    api_base: String,
}

impl SlackApiClient {
    pub fn new(api_base: String) -> Self {
        Self {
            http: reqwest::Client::new(),
            api_base: api_base.trim_end_matches('/').to_string(),
        }
    }

    /// Posts `text` into `channel` using the installation's bot token.
    pub async fn post_message(
        &self,
        bot_token: &str,
        channel: &str,
        text: &str,
    ) -> anyhow::Result<()> {
        let response = self
            .http
            .post(format!("{}/api/chat.postMessage", self.api_base))
            .bearer_auth(bot_token)
            .json(&serde_json::json!({ "channel": channel, "text": text }))
            .send()
            .await?
            .error_for_status()?;
        let body: serde_json::Value = response.json().await?;
        if body.get("ok").and_then(serde_json::Value::as_bool) != Some(true) {
            let reason = body
                .get("error")
                .and_then(serde_json::Value::as_str)
                .unwrap_or("unknown error");
            anyhow::bail!("chat.postMessage rejected: {reason}");
        }
        Ok(())
    }
}
