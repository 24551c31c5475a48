use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use hmac::{Hmac, Mac};
use httpmock::prelude::*;
use kudos_store::{InMemoryKudosStore, KudosStore, NewInstallation};
use kudos_types::Platform;
use sha2::Sha256;
use tokio::net::TcpListener;

use crate::{build_router, GatewayConfig, GatewayState, GoogleGatewayOptions, SlackGatewayOptions};

async fn seeded_store(external_id: &str, platform: Platform) -> Arc<InMemoryKudosStore> {
    let store = Arc::new(InMemoryKudosStore::new());
    let organization = store
        .create_organization("acme")
        .await
        .expect("create organization");
    store
        .create_installation(NewInstallation {
            platform,
            organization_id: organization.id,
            external_installation_id: external_id.to_string(),
            access_token: "access".to_string(),
            bot_token: "xoxb-bot".to_string(),
        })
        .await
        .expect("create installation");
    store
}

fn config_with(slack: Option<SlackGatewayOptions>, google: Option<GoogleGatewayOptions>) -> GatewayConfig {
    GatewayConfig {
        bind: "127.0.0.1:0".to_string(),
        external_base_url: "http://kudos.test".to_string(),
        slack,
        google,
    }
}

async fn spawn(state: Arc<GatewayState>) -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("local addr");
    let app = build_router(state);
    tokio::spawn(async move {
        axum::serve(listener, app).await.expect("serve");
    });
    format!("http://{addr}")
}

#[tokio::test]
async fn health_endpoint_reports_ok() {
    let store = Arc::new(InMemoryKudosStore::new());
    let state = Arc::new(GatewayState::new(store, &config_with(None, None)));
    let base = spawn(state).await;

    let body: serde_json::Value = reqwest::get(format!("{base}/health"))
        .await
        .expect("request")
        .json()
        .await
        .expect("json body");
    assert_eq!(body["status"], "ok");
}

#[tokio::test]
async fn googlechat_message_grants_and_replies_with_total() {
    let store = seeded_store("spaces/AAA", Platform::GoogleChat).await;
    let google = GoogleGatewayOptions::new(
        "client".to_string(),
        "secret".to_string(),
        "project-1".to_string(),
    );
    let state = Arc::new(GatewayState::new(
        store.clone(),
        &config_with(None, Some(google)),
    ));
    let base = spawn(state).await;

    let event = serde_json::json!({
        "type": "MESSAGE",
        "space": { "name": "spaces/AAA" },
        "message": {
            "sender": { "name": "users/999", "displayName": "alice" },
            "argumentText": " <users/123> nice job "
        }
    });
    let body: serde_json::Value = reqwest::Client::new()
        .post(format!("{base}/webhook/googlechat"))
        .json(&event)
        .send()
        .await
        .expect("request")
        .json()
        .await
        .expect("json body");

    let text = body["text"].as_str().expect("text reply");
    assert!(text.contains("<users/123>"), "unexpected reply: {text}");
    assert!(text.contains("*1* total kudos"), "unexpected reply: {text}");
    assert_eq!(
        store
            .count_for_user("spaces/AAA", "123")
            .await
            .expect("count"),
        1
    );
}

#[tokio::test]
async fn googlechat_uninstalled_space_is_told_to_install() {
    let store = Arc::new(InMemoryKudosStore::new());
    let google = GoogleGatewayOptions::new(
        "client".to_string(),
        "secret".to_string(),
        "project-1".to_string(),
    );
    let state = Arc::new(GatewayState::new(store, &config_with(None, Some(google))));
    let base = spawn(state).await;

    let event = serde_json::json!({
        "type": "MESSAGE",
        "space": { "name": "spaces/ZZZ" },
        "message": {
            "sender": { "displayName": "alice" },
            "argumentText": "@bob thanks"
        }
    });
    let body: serde_json::Value = reqwest::Client::new()
        .post(format!("{base}/webhook/googlechat"))
        .json(&event)
        .send()
        .await
        .expect("request")
        .json()
        .await
        .expect("json body");
    assert!(body["text"].as_str().expect("text").contains("install"));
}

#[tokio::test]
async fn googlechat_malformed_command_echoes_usage() {
    let store = seeded_store("spaces/AAA", Platform::GoogleChat).await;
    let google = GoogleGatewayOptions::new(
        "client".to_string(),
        "secret".to_string(),
        "project-1".to_string(),
    );
    let state = Arc::new(GatewayState::new(store, &config_with(None, Some(google))));
    let base = spawn(state).await;

    let event = serde_json::json!({
        "type": "MESSAGE",
        "space": { "name": "spaces/AAA" },
        "message": {
            "sender": { "displayName": "alice" },
            "argumentText": "@bob"
        }
    });
    let body: serde_json::Value = reqwest::Client::new()
        .post(format!("{base}/webhook/googlechat"))
        .json(&event)
        .send()
        .await
        .expect("request")
        .json()
        .await
        .expect("json body");
    assert!(body["text"].as_str().expect("text").contains("Usage"));
}

#[tokio::test]
async fn googlechat_webhook_token_is_enforced() {
    let store = seeded_store("spaces/AAA", Platform::GoogleChat).await;
    let mut google = GoogleGatewayOptions::new(
        "client".to_string(),
        "secret".to_string(),
        "project-1".to_string(),
    );
    google.webhook_token = Some("hook-token".to_string());
    let state = Arc::new(GatewayState::new(store, &config_with(None, Some(google))));
    let base = spawn(state).await;

    let event = serde_json::json!({ "type": "MESSAGE", "space": { "name": "spaces/AAA" } });
    let unauthorized = reqwest::Client::new()
        .post(format!("{base}/webhook/googlechat"))
        .json(&event)
        .send()
        .await
        .expect("request");
    assert_eq!(unauthorized.status(), 401);

    let authorized = reqwest::Client::new()
        .post(format!("{base}/webhook/googlechat"))
        .header("authorization", "Bearer hook-token")
        .json(&event)
        .send()
        .await
        .expect("request");
    assert_eq!(authorized.status(), 200);
}

#[tokio::test]
async fn slack_slash_command_posts_celebration() {
    let slack_api = MockServer::start();
    let post_message = slack_api.mock(|when, then| {
        when.method(POST)
            .path("/api/chat.postMessage")
            .header("authorization", "Bearer xoxb-bot")
            .body_includes("Kudos to <@U42> for pairing session!");
        then.status(200).json_body(serde_json::json!({ "ok": true }));
    });

    let store = seeded_store("T1", Platform::Slack).await;
    let mut options = SlackGatewayOptions::new("client".to_string(), "secret".to_string());
    options.api_base = slack_api.base_url();
    let state = Arc::new(GatewayState::new(
        store.clone(),
        &config_with(Some(options), None),
    ));
    let base = spawn(state).await;

    let response = reqwest::Client::new()
        .post(format!("{base}/webhook/slack"))
        .form(&[
            ("team_id", "T1"),
            ("channel_id", "C1"),
            ("user_id", "U1"),
            ("user_name", "alice"),
            ("text", "/kudos <@U42> pairing session"),
        ])
        .send()
        .await
        .expect("request");
    assert_eq!(response.status(), 200);
    post_message.assert();
    assert_eq!(store.count_for_user("T1", "U42").await.expect("count"), 1);
}

#[tokio::test]
async fn slack_webhook_rejects_missing_signature_when_secret_configured() {
    let store = seeded_store("T1", Platform::Slack).await;
    let mut options = SlackGatewayOptions::new("client".to_string(), "secret".to_string());
    options.signing_secret = Some("sig-secret".to_string());
    let state = Arc::new(GatewayState::new(store, &config_with(Some(options), None)));
    let base = spawn(state).await;

    let response = reqwest::Client::new()
        .post(format!("{base}/webhook/slack"))
        .form(&[("team_id", "T1"), ("text", "/kudos @bob thanks")])
        .send()
        .await
        .expect("request");
    assert_eq!(response.status(), 401);
}

#[tokio::test]
async fn slack_webhook_accepts_correctly_signed_request() {
    let slack_api = MockServer::start();
    slack_api.mock(|when, then| {
        when.method(POST).path("/api/chat.postMessage");
        then.status(200).json_body(serde_json::json!({ "ok": true }));
    });

    let store = seeded_store("T1", Platform::Slack).await;
    let mut options = SlackGatewayOptions::new("client".to_string(), "secret".to_string());
    options.api_base = slack_api.base_url();
    options.signing_secret = Some("sig-secret".to_string());
    let state = Arc::new(GatewayState::new(store, &config_with(Some(options), None)));
    let base = spawn(state).await;

    let body = "team_id=T1&channel_id=C1&user_id=U1&user_name=alice&text=%2Fkudos%20%40bob%20thanks";
    let timestamp = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("clock")
        .as_secs()
        .to_string();
    let mut mac = Hmac::<Sha256>::new_from_slice(b"sig-secret").expect("hmac key");
    mac.update(format!("v0:{timestamp}:").as_bytes());
    mac.update(body.as_bytes());
    let mut signature = String::from("v0=");
    for byte in mac.finalize().into_bytes() {
        signature.push_str(&format!("{byte:02x}"));
    }

    let response = reqwest::Client::new()
        .post(format!("{base}/webhook/slack"))
        .header("content-type", "application/x-www-form-urlencoded")
        .header("x-slack-request-timestamp", timestamp)
        .header("x-slack-signature", signature)
        .body(body)
        .send()
        .await
        .expect("request");
    assert_eq!(response.status(), 200);
}

#[tokio::test]
async fn slack_callback_rejects_unknown_state() {
    let store = Arc::new(InMemoryKudosStore::new());
    let options = SlackGatewayOptions::new("client".to_string(), "secret".to_string());
    let state = Arc::new(GatewayState::new(store, &config_with(Some(options), None)));
    let base = spawn(state).await;

    let response = reqwest::get(format!(
        "{base}/auth/slack/callback?code=abc&state=forged"
    ))
    .await
    .expect("request");
    assert_eq!(response.status(), 400);
}

#[tokio::test]
async fn slack_callback_records_installation() {
    let slack_api = MockServer::start();
    slack_api.mock(|when, then| {
        when.method(POST).path("/api/oauth.v2.access");
        then.status(200).json_body(serde_json::json!({
            "ok": true,
            "access_token": "xoxp-1",
            "team_id": "T9",
            "team_name": "Acme",
            "bot": { "bot_user_id": "B1", "bot_access_token": "xoxb-9" }
        }));
    });

    let store = Arc::new(InMemoryKudosStore::new());
    let mut options = SlackGatewayOptions::new("client".to_string(), "secret".to_string());
    options.api_base = slack_api.base_url();
    let state = Arc::new(GatewayState::new(
        store.clone(),
        &config_with(Some(options), None),
    ));
    let token = state.state_guard.issue();
    let base = spawn(state).await;

    let response = reqwest::get(format!(
        "{base}/auth/slack/callback?code=abc&state={token}"
    ))
    .await
    .expect("request");
    assert_eq!(response.status(), 200);
    let page = response.text().await.expect("body");
    assert!(page.contains("Acme"));

    let installation = store
        .installation_by_external_id("T9")
        .await
        .expect("lookup")
        .expect("installation");
    assert_eq!(installation.platform, Platform::Slack);
    assert_eq!(installation.bot_token, "xoxb-9");
}

#[tokio::test]
async fn login_redirects_to_authorize_url_with_state() {
    let store = Arc::new(InMemoryKudosStore::new());
    let options = SlackGatewayOptions::new("client".to_string(), "secret".to_string());
    let state = Arc::new(GatewayState::new(store, &config_with(Some(options), None)));
    let base = spawn(state).await;

    let client = reqwest::Client::builder()
        .redirect(reqwest::redirect::Policy::none())
        .build()
        .expect("client");
    let response = client
        .get(format!("{base}/auth/slack"))
        .send()
        .await
        .expect("request");
    assert_eq!(response.status(), 307);
    let location = response
        .headers()
        .get("location")
        .and_then(|value| value.to_str().ok())
        .expect("location header");
    assert!(location.contains("/oauth/v2/authorize"));
    assert!(location.contains("state="));
}
