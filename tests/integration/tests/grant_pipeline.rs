//! Cross-crate scenarios: parsed commands flowing through the ledger
//! into the durable store.

use std::sync::Arc;

use kudos_command::{parse_command, GoogleChatMentions, SlackMentions};
use kudos_ledger::KudosLedger;
use kudos_store::{KudosStore, NewInstallation, SqliteKudosStore};
use kudos_types::{Identity, Platform};
use tempfile::tempdir;

async fn seed_installation(store: &SqliteKudosStore, external_id: &str, platform: Platform) {
    let organization = store
        .create_organization(&format!("org-{external_id}"))
        .await
        .expect("create organization");
    store
        .create_installation(NewInstallation {
            platform,
            organization_id: organization.id,
            external_installation_id: external_id.to_string(),
            access_token: "access".to_string(),
            bot_token: "bot".to_string(),
        })
        .await
        .expect("create installation");
}

#[tokio::test]
async fn grants_accumulate_per_recipient() {
    let temp = tempdir().expect("tempdir");
    let store = Arc::new(
        SqliteKudosStore::new(temp.path().join("kudos.sqlite")).expect("create store"),
    );
    seed_installation(&store, "T1", Platform::Slack).await;
    let ledger = KudosLedger::new(store);

    let first = ledger
        .grant(
            "T1",
            &Identity::Username("alice".to_string()),
            &Identity::Username("bob".to_string()),
            "shipped the release",
        )
        .await
        .expect("first grant");
    assert_eq!(first.recipient_username, "bob");
    assert_eq!(first.total, 1);

    let second = ledger
        .grant(
            "T1",
            &Identity::Username("carol".to_string()),
            &Identity::Username("bob".to_string()),
            "great review",
        )
        .await
        .expect("second grant");
    assert_eq!(second.recipient_username, "bob");
    assert_eq!(second.total, 2);
}

#[tokio::test]
async fn parsed_slack_command_lands_in_the_ledger() {
    let temp = tempdir().expect("tempdir");
    let store = Arc::new(
        SqliteKudosStore::new(temp.path().join("kudos.sqlite")).expect("create store"),
    );
    seed_installation(&store, "T1", Platform::Slack).await;
    let ledger = KudosLedger::new(store.clone());

    let parsed = parse_command(&SlackMentions, "/kudos <@U42>   shipped   the   release")
        .expect("parse command");
    assert_eq!(parsed.description, "shipped the release");

    let receipt = ledger
        .grant(
            "T1",
            &Identity::Username("alice".to_string()),
            &parsed.target,
            &parsed.description,
        )
        .await
        .expect("grant");
    assert_eq!(receipt.total, 1);
    assert_eq!(store.count_for_user("T1", "U42").await.expect("count"), 1);
}

#[tokio::test]
async fn totals_stay_isolated_between_installations() {
    let temp = tempdir().expect("tempdir");
    let store = Arc::new(
        SqliteKudosStore::new(temp.path().join("kudos.sqlite")).expect("create store"),
    );
    seed_installation(&store, "T1", Platform::Slack).await;
    seed_installation(&store, "spaces/AAA", Platform::GoogleChat).await;
    let ledger = KudosLedger::new(store);

    for _ in 0..2 {
        ledger
            .grant(
                "T1",
                &Identity::Username("alice".to_string()),
                &Identity::Username("bob".to_string()),
                "pairing",
            )
            .await
            .expect("grant in T1");
    }
    let parsed = parse_command(&GoogleChatMentions, "@bob incident response")
        .expect("parse google chat command");
    let receipt = ledger
        .grant(
            "spaces/AAA",
            &Identity::Username("alice".to_string()),
            &parsed.target,
            &parsed.description,
        )
        .await
        .expect("grant in space");

    assert_eq!(receipt.total, 1);
    assert_eq!(
        ledger.count_for_user("T1", "bob").await.expect("count"),
        2
    );
    assert_eq!(
        ledger
            .count_for_user("spaces/AAA", "bob")
            .await
            .expect("count"),
        1
    );
}

#[tokio::test]
async fn concurrent_grants_to_new_recipient_never_duplicate_identity() {
    let temp = tempdir().expect("tempdir");
    let store = Arc::new(
        SqliteKudosStore::new(temp.path().join("kudos.sqlite")).expect("create store"),
    );
    seed_installation(&store, "T1", Platform::Slack).await;
    let ledger = KudosLedger::new(store.clone());

    let mut handles = Vec::new();
    for index in 0..8 {
        let ledger = ledger.clone();
        handles.push(tokio::spawn(async move {
            ledger
                .grant(
                    "T1",
                    &Identity::Username(format!("sender-{index}")),
                    &Identity::External("U-new".to_string()),
                    "first-sight race",
                )
                .await
                .expect("grant")
        }));
    }
    for handle in handles {
        handle.await.expect("join");
    }

    // All eight grants landed on one identity.
    assert_eq!(store.count_for_user("T1", "U-new").await.expect("count"), 8);
    let resolved = store.resolve_user("T1", "U-new").await.expect("resolve");
    assert_eq!(resolved.username, "U-new");
}
