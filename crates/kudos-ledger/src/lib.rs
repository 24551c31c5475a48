//! Kudos ledger service.
//!
//! Thin orchestration over a [`KudosStore`]: consults the installation
//! directory, records grants, and maps store failures onto the error
//! taxonomy the chat-facing layer renders from.

use kudos_store::{KudosStore, KudosStoreError};
use kudos_types::{GrantReceipt, Identity, Installation, User};
use std::sync::Arc;
use thiserror::Error;

/// Errors surfaced to the layer that renders chat responses.
#[derive(Debug, Error)]
pub enum LedgerError {
    #[error("app not installed for workspace '{workspace}'")]
    InstallationNotFound { workspace: String },
    #[error("kudos description must not be empty")]
    EmptyDescription,
    #[error("identity must not be empty")]
    EmptyIdentity,
    #[error(transparent)]
    Persistence(KudosStoreError),
}

impl LedgerError {
    /// Message safe to echo back into the chat channel.
    pub fn user_message(&self) -> String {
        match self {
            Self::InstallationNotFound { .. } => {
                "App not installed for this workspace. Please install the kudos app first."
                    .to_string()
            }
            Self::EmptyDescription | Self::EmptyIdentity => {
                "Usage: /kudos @user description".to_string()
            }
            Self::Persistence(_) => "Failed to record kudos, please try again.".to_string(),
        }
    }
}

impl From<KudosStoreError> for LedgerError {
    fn from(error: KudosStoreError) -> Self {
        match error {
            KudosStoreError::InstallationNotFound(workspace) => {
                Self::InstallationNotFound { workspace }
            }
            KudosStoreError::EmptyDescription => Self::EmptyDescription,
            KudosStoreError::EmptyIdentity => Self::EmptyIdentity,
            other => Self::Persistence(other),
        }
    }
}

/// Records grants and reports running totals, one installation at a time.
#[derive(Clone)]
pub struct KudosLedger {
    store: Arc<dyn KudosStore>,
}

impl KudosLedger {
    pub fn new(store: Arc<dyn KudosStore>) -> Self {
        Self { store }
    }

    /// Installation directory lookup by external tenant identifier.
    pub async fn installation(&self, external_id: &str) -> Result<Installation, LedgerError> {
        self.store
            .installation_by_external_id(external_id)
            .await?
            .ok_or_else(|| LedgerError::InstallationNotFound {
                workspace: external_id.to_string(),
            })
    }

    /// Resolves an external identity into a stable internal user for the
    /// named installation, creating it on first sight.
    pub async fn resolve(
        &self,
        installation_external_id: &str,
        external_user_id: &str,
    ) -> Result<User, LedgerError> {
        Ok(self
            .store
            .resolve_user(installation_external_id, external_user_id)
            .await?)
    }

    /// Records one kudos grant and returns the recipient's recomputed
    /// per-installation total. Not idempotent: a redelivered webhook that
    /// reaches this method twice records two grants.
    pub async fn grant(
        &self,
        installation_external_id: &str,
        from: &Identity,
        to: &Identity,
        description: &str,
    ) -> Result<GrantReceipt, LedgerError> {
        let receipt = self
            .store
            .record_grant(installation_external_id, from, to, description)
            .await?;
        tracing::info!(
            workspace = installation_external_id,
            from = %receipt.sender_username,
            to = %receipt.recipient_username,
            total = receipt.total,
            "kudos granted"
        );
        Ok(receipt)
    }

    /// Running total for a username within one installation.
    pub async fn count_for_user(
        &self,
        installation_external_id: &str,
        username: &str,
    ) -> Result<i64, LedgerError> {
        Ok(self
            .store
            .count_for_user(installation_external_id, username)
            .await?)
    }
}

#[cfg(test)]
mod tests {
    use super::{KudosLedger, LedgerError};
    use kudos_store::{InMemoryKudosStore, KudosStore, NewInstallation};
    use kudos_types::{Identity, Platform};
    use std::sync::Arc;

    async fn ledger_with_installation(external_id: &str) -> KudosLedger {
        let store = Arc::new(InMemoryKudosStore::new());
        let organization = store
            .create_organization("acme")
            .await
            .expect("create organization");
        store
            .create_installation(NewInstallation {
                platform: Platform::GoogleChat,
                organization_id: organization.id,
                external_installation_id: external_id.to_string(),
                access_token: "token".to_string(),
                bot_token: "bot".to_string(),
            })
            .await
            .expect("create installation");
        KudosLedger::new(store)
    }

    #[tokio::test]
    async fn grant_accumulates_recipient_total() {
        let ledger = ledger_with_installation("spaces/AAA").await;

        let first = ledger
            .grant(
                "spaces/AAA",
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
                "spaces/AAA",
                &Identity::Username("carol".to_string()),
                &Identity::Username("bob".to_string()),
                "great review",
            )
            .await
            .expect("second grant");
        assert_eq!(second.total, 2);
        assert_eq!(second.platform, Platform::GoogleChat);
    }

    #[tokio::test]
    async fn missing_installation_maps_to_user_facing_error() {
        let ledger = KudosLedger::new(Arc::new(InMemoryKudosStore::new()));
        let err = ledger
            .grant(
                "nowhere",
                &Identity::Username("alice".to_string()),
                &Identity::Username("bob".to_string()),
                "lost",
            )
            .await
            .unwrap_err();
        assert!(matches!(err, LedgerError::InstallationNotFound { .. }));
        assert!(err.user_message().contains("install"));
    }

    #[tokio::test]
    async fn empty_description_keeps_usage_hint() {
        let ledger = ledger_with_installation("spaces/AAA").await;
        let err = ledger
            .grant(
                "spaces/AAA",
                &Identity::Username("alice".to_string()),
                &Identity::Username("bob".to_string()),
                "",
            )
            .await
            .unwrap_err();
        assert!(matches!(err, LedgerError::EmptyDescription));
        assert!(err.user_message().starts_with("Usage:"));
    }

    #[tokio::test]
    async fn directory_lookup_returns_credentials() {
        let ledger = ledger_with_installation("spaces/AAA").await;
        let installation = ledger.installation("spaces/AAA").await.expect("lookup");
        assert_eq!(installation.bot_token, "bot");

        let err = ledger.installation("spaces/BBB").await.unwrap_err();
        assert!(matches!(err, LedgerError::InstallationNotFound { .. }));
    }
}
