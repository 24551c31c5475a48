//! Google Chat webhook and install-flow handlers.

use std::sync::Arc;

use axum::extract::{Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{Html, IntoResponse, Redirect, Response};
use axum::Json;
use kudos_command::{parse_command, GoogleChatMentions};
use kudos_store::NewInstallation;
use kudos_types::{Identity, Platform};
use serde::Deserialize;

use crate::render;
use crate::GatewayState;

/// Google Chat event payload, reduced to the fields the command flow
/// reads.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct GoogleChatEvent {
    #[serde(default, rename = "type")]
    pub event_type: String,
    #[serde(default)]
    pub message: GoogleChatMessage,
    #[serde(default)]
    pub space: GoogleChatSpace,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct GoogleChatMessage {
    #[serde(default)]
    pub sender: GoogleChatUser,
    #[serde(default)]
    pub text: String,
    #[serde(default)]
    pub argument_text: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct GoogleChatUser {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub display_name: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub(crate) struct GoogleChatSpace {
    #[serde(default)]
    pub name: String,
}

#[derive(Debug, Deserialize)]
pub(crate) struct GoogleCallbackParams {
    #[serde(default)]
    pub code: String,
    #[serde(default)]
    pub state: String,
    #[serde(default)]
    pub error: String,
}

fn text_reply(text: impl Into<String>) -> Response {
    Json(serde_json::json!({ "text": text.into() })).into_response()
}

/// Handles an inbound Google Chat event. Replies are delivered
/// synchronously as the webhook response body.
pub(crate) async fn handle_event(
    State(state): State<Arc<GatewayState>>,
    headers: HeaderMap,
    Json(event): Json<GoogleChatEvent>,
) -> Response {
    let Some(google) = &state.google else {
        return StatusCode::SERVICE_UNAVAILABLE.into_response();
    };

    if let Some(expected) = &google.webhook_token {
        let provided = headers
            .get("authorization")
            .and_then(|value| value.to_str().ok())
            .unwrap_or_default();
        if provided != format!("Bearer {expected}") {
            tracing::warn!("rejected google chat webhook with bad bearer token");
            return StatusCode::UNAUTHORIZED.into_response();
        }
    }

    if event.event_type != "MESSAGE" {
        return StatusCode::OK.into_response();
    }

    let space = event.space.name.clone();
    if space.is_empty() {
        return text_reply("\u{274C} Invalid space information");
    }

    if let Err(error) = state.ledger.installation(&space).await {
        return text_reply(format!("\u{274C} {}", error.user_message()));
    }

    // Google Chat strips the slash command into argumentText; fall back
    // to the raw text for direct messages.
    let raw = if event.message.argument_text.is_empty() {
        event.message.text.as_str()
    } else {
        event.message.argument_text.as_str()
    };
    let parsed = match parse_command(&GoogleChatMentions, raw) {
        Ok(parsed) => parsed,
        Err(error) => {
            return text_reply(format!(
                "\u{274C} {error}\n\nUsage: `/kudos @user description` or `/kudos <users/USER_ID> description`"
            ));
        }
    };

    let sender_name = if event.message.sender.display_name.is_empty() {
        event.message.sender.name.clone()
    } else {
        event.message.sender.display_name.clone()
    };
    if sender_name.is_empty() {
        return text_reply("\u{274C} Unable to identify sender");
    }

    let receipt = match state
        .ledger
        .grant(
            &space,
            &Identity::Username(sender_name),
            &parsed.target,
            &parsed.description,
        )
        .await
    {
        Ok(receipt) => receipt,
        Err(error) => {
            tracing::warn!(space = %space, error = %error, "grant failed");
            return text_reply(format!("\u{274C} {}", error.user_message()));
        }
    };

    text_reply(render::googlechat_celebration(&parsed.target, &receipt))
}

/// Starts the Google OAuth flow with a fresh CSRF state token.
pub(crate) async fn handle_login(State(state): State<Arc<GatewayState>>) -> Response {
    let Some(google) = &state.google else {
        return StatusCode::SERVICE_UNAVAILABLE.into_response();
    };
    let token = state.state_guard.issue();
    Redirect::temporary(&google.oauth.authorize_url(&token)).into_response()
}

/// Completes the Google OAuth flow and records the installation under
/// the configured project id.
pub(crate) async fn handle_callback(
    State(state): State<Arc<GatewayState>>,
    Query(params): Query<GoogleCallbackParams>,
) -> Response {
    let Some(google) = &state.google else {
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

    let grant = match google.oauth.exchange_code(&params.code).await {
        Ok(grant) => grant,
        Err(error) => {
            tracing::error!(error = %error, "google oauth exchange failed");
            return (
                StatusCode::INTERNAL_SERVER_ERROR,
                "Failed to exchange code for token",
            )
                .into_response();
        }
    };

    let team_name = format!("Google Chat Project: {}", google.project_id);
    let organization = match crate::find_or_create_organization(&state, &team_name).await {
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
            platform: Platform::GoogleChat,
            organization_id: organization.id,
            external_installation_id: google.project_id.clone(),
            access_token: grant.access_token.clone(),
            bot_token: grant.refresh_token.clone(),
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

    tracing::info!(project = %google.project_id, "google chat installation completed");
    Html(render::install_success_page(&team_name)).into_response()
}
