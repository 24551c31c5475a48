//! Install-flow helpers: one-shot CSRF state tokens and the OAuth
//! authorization-code exchange with each chat platform.

mod state_guard;

pub use state_guard::{StateGuard, DEFAULT_STATE_TTL};

use serde::Deserialize;
use thiserror::Error;

/// Errors returned during the OAuth code exchange.
#[derive(Debug, Error)]
pub enum OAuthError {
    #[error("oauth exchange rejected: {0}")]
    Rejected(String),
    #[error(transparent)]
    Http(#[from] reqwest::Error),
}

/// Slack OAuth v2 access response, reduced to the fields the install
/// flow persists.
#[derive(Debug, Clone, Deserialize)]
pub struct SlackOAuthGrant {
    pub ok: bool,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub access_token: String,
    #[serde(default)]
    pub team_id: String,
    #[serde(default)]
    pub team_name: String,
    #[serde(default)]
    pub bot: SlackBotGrant,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct SlackBotGrant {
    #[serde(default)]
    pub bot_user_id: String,
    #[serde(default)]
    pub bot_access_token: String,
}

/// Client for Slack's OAuth v2 authorize/exchange endpoints.
#[derive(Debug, Clone)]
pub struct SlackOAuthClient {
    http: reqwest::Client,
    api_base: String,
    client_id: String,
    client_secret: String,
    redirect_uri: String,
}

impl SlackOAuthClient {
    pub fn new(client_id: String, client_secret: String, redirect_uri: String) -> Self {
        Self::with_api_base("https://slack.com".to_string(), client_id, client_secret, redirect_uri)
    }

    /// Overridable API base so tests can point at a mock server.
    pub fn with_api_base(
        api_base: String,
        client_id: String,
        client_secret: String,
        redirect_uri: String,
    ) -> Self {
        Self {
            http: reqwest::Client::new(),
            api_base: api_base.trim_end_matches('/').to_string(),
            client_id,
            client_secret,
            redirect_uri,
        }
    }

    /// Authorization URL the install flow redirects the browser to.
    pub fn authorize_url(&self, state: &str) -> String {
        format!(
            "{}/oauth/v2/authorize?client_id={}&scope=commands,chat:write,users:read&redirect_uri={}&state={}",
            self.api_base,
            urlencode(&self.client_id),
            urlencode(&self.redirect_uri),
            urlencode(state),
        )
    }

    /// Exchanges the authorization code for workspace and bot tokens.
    pub async fn exchange_code(&self, code: &str) -> Result<SlackOAuthGrant, OAuthError> {
        let response = self
            .http
            .post(format!("{}/api/oauth.v2.access", self.api_base))
            .form(&[
                ("client_id", self.client_id.as_str()),
                ("client_secret", self.client_secret.as_str()),
                ("code", code),
                ("redirect_uri", self.redirect_uri.as_str()),
            ])
            .send()
            .await?
            .error_for_status()?;

        let grant: SlackOAuthGrant = response.json().await?;
        if !grant.ok {
            return Err(OAuthError::Rejected(
                grant.error.unwrap_or_else(|| "unknown error".to_string()),
            ));
        }
        Ok(grant)
    }
}

/// Google OAuth token response for the Chat scopes.
#[derive(Debug, Clone, Deserialize)]
pub struct GoogleOAuthGrant {
    pub access_token: String,
    #[serde(default)]
    pub refresh_token: String,
}

/// Client for Google's OAuth authorize/token endpoints with the Chat
/// bot scopes.
#[derive(Debug, Clone)]
pub struct GoogleOAuthClient {
    http: reqwest::Client,
    auth_base: String,
    token_base: String,
    client_id: String,
    client_secret: String,
    redirect_uri: String,
}

impl GoogleOAuthClient {
    pub fn new(client_id: String, client_secret: String, redirect_uri: String) -> Self {
        Self::with_bases(
            "https://accounts.google.com".to_string(),
            "https://oauth2.googleapis.com".to_string(),
            client_id,
            client_secret,
            redirect_uri,
        )
    }

    pub fn with_bases(
        auth_base: String,
        token_base: String,
        client_id: String,
        client_secret: String,
        redirect_uri: String,
    ) -> Self {
        Self {
            http: reqwest::Client::new(),
            auth_base: auth_base.trim_end_matches('/').to_string(),
            token_base: token_base.trim_end_matches('/').to_string(),
            client_id,
            client_secret,
            redirect_uri,
        }
    }

    pub fn authorize_url(&self, state: &str) -> String {
        format!(
            "{}/o/oauth2/auth?client_id={}&redirect_uri={}&response_type=code&access_type=offline&scope={}&state={}",
            self.auth_base,
            urlencode(&self.client_id),
            urlencode(&self.redirect_uri),
            urlencode(
                "https://www.googleapis.com/auth/chat.bot https://www.googleapis.com/auth/chat.messages"
            ),
            urlencode(state),
        )
    }

    pub async fn exchange_code(&self, code: &str) -> Result<GoogleOAuthGrant, OAuthError> {
        let response = self
            .http
            .post(format!("{}/token", self.token_base))
            .form(&[
                ("client_id", self.client_id.as_str()),
                ("client_secret", self.client_secret.as_str()),
                ("code", code),
                ("redirect_uri", self.redirect_uri.as_str()),
                ("grant_type", "authorization_code"),
            ])
            .send()
            .await?;
        if !response.status().is_success() {
            let detail = response.text().await.unwrap_or_default();
            return Err(OAuthError::Rejected(detail));
        }
        Ok(response.json().await?)
    }
}

/// Percent-encodes a query component. Covers the characters that appear
/// in client ids, redirect URIs, scopes, and base64url state tokens.
fn urlencode(value: &str) -> String {
    let mut encoded = String::with_capacity(value.len());
    for byte in value.bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => {
                encoded.push(byte as char);
            }
            other => {
                encoded.push('%');
                encoded.push_str(&format!("{other:02X}"));
            }
        }
    }
    encoded
}
