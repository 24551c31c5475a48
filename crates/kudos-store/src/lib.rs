//! Kudos store abstractions and in-memory backend.
//!
//! The store owns the two pieces of logic that must be atomic under
//! concurrent webhook delivery: resolving an external identity into a
//! stable internal user, and recording a grant together with the
//! recipient's recomputed running total.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use kudos_types::{
    GrantReceipt, Identity, Installation, InstallationUser, Kudos, Organization, Platform, User,
};
use thiserror::Error;
use tokio::sync::RwLock;

mod sqlite;

pub use sqlite::SqliteKudosStore;

/// Result type for kudos store operations.
pub type StoreResult<T> = Result<T, KudosStoreError>;

/// Errors returned by store implementations.
#[derive(Debug, Error)]
pub enum KudosStoreError {
    #[error("no installation found for workspace '{0}'")]
    InstallationNotFound(String),
    #[error("organization '{0}' already exists")]
    OrganizationAlreadyExists(String),
    #[error("installation '{0}' already exists")]
    InstallationAlreadyExists(String),
    #[error("external user identifier must not be empty")]
    EmptyIdentity,
    #[error("kudos description must not be empty")]
    EmptyDescription,
    #[error("identity resolution for '{external_user_id}' in '{installation}' kept losing the insert race")]
    IdentityConflict {
        installation: String,
        external_user_id: String,
    },
    #[error("invalid persisted value for '{field}': {value}")]
    InvalidPersistedValue { field: &'static str, value: String },
    #[error(transparent)]
    Sqlite(#[from] rusqlite::Error),
    #[error(transparent)]
    Chrono(#[from] chrono::ParseError),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Parameters for recording a new installation after an OAuth install.
#[derive(Debug, Clone)]
pub struct NewInstallation {
    pub platform: Platform,
    pub organization_id: i64,
    pub external_installation_id: String,
    pub access_token: String,
    pub bot_token: String,
}

/// Async store contract shared by the ledger and the install flow.
#[async_trait]
pub trait KudosStore: Send + Sync {
    async fn create_organization(&self, name: &str) -> StoreResult<Organization>;
    async fn organization_by_name(&self, name: &str) -> StoreResult<Option<Organization>>;
    async fn create_installation(&self, new: NewInstallation) -> StoreResult<Installation>;
    async fn installation_by_external_id(
        &self,
        external_id: &str,
    ) -> StoreResult<Option<Installation>>;

    /// Looks up or creates the internal user bound to `external_user_id`
    /// within the named installation. At most one binding ever exists per
    /// (installation, external user id) pair, no matter how many calls
    /// race on first sight.
    async fn resolve_user(
        &self,
        installation_external_id: &str,
        external_user_id: &str,
    ) -> StoreResult<User>;

    /// Records one kudos grant and recomputes the recipient's
    /// per-installation total, all as a single atomic unit. Not
    /// idempotent: every call appends a new grant, so a redelivered
    /// webhook double-counts.
    async fn record_grant(
        &self,
        installation_external_id: &str,
        from: &Identity,
        to: &Identity,
        description: &str,
    ) -> StoreResult<GrantReceipt>;

    /// Running total for `username` within one installation. Unknown
    /// users count as zero.
    async fn count_for_user(
        &self,
        installation_external_id: &str,
        username: &str,
    ) -> StoreResult<i64>;
}

/// In-memory implementation for tests and local experimentation.
#[derive(Debug, Default)]
pub struct InMemoryKudosStore {
    inner: RwLock<StoreInner>,
}

#[derive(Debug, Default)]
struct StoreInner {
    organizations: Vec<Organization>,
    installations: Vec<Installation>,
    users: Vec<User>,
    installation_users: Vec<InstallationUser>,
    kudos: Vec<Kudos>,
    next_id: i64,
}

impl StoreInner {
    fn allocate_id(&mut self) -> i64 {
        self.next_id += 1;
        self.next_id
    }

    fn installation_by_external_id(&self, external_id: &str) -> Option<Installation> {
        self.installations
            .iter()
            .find(|installation| installation.external_installation_id == external_id)
            .cloned()
    }

    fn find_or_create_user(&mut self, username: &str, now: DateTime<Utc>) -> User {
        if let Some(user) = self.users.iter().find(|user| user.username == username) {
            return user.clone();
        }
        let user = User {
            id: self.allocate_id(),
            username: username.to_string(),
            created_at: now,
        };
        self.users.push(user.clone());
        user
    }

    fn resolve(
        &mut self,
        installation: &Installation,
        external_user_id: &str,
        now: DateTime<Utc>,
    ) -> StoreResult<User> {
        if external_user_id.is_empty() {
            return Err(KudosStoreError::EmptyIdentity);
        }
        if let Some(binding) = self.installation_users.iter().find(|binding| {
            binding.installation_id == installation.id
                && binding.external_user_id == external_user_id
        }) {
            let user_id = binding.user_id;
            let user = self
                .users
                .iter()
                .find(|user| user.id == user_id)
                .cloned()
                .ok_or_else(|| KudosStoreError::InvalidPersistedValue {
                    field: "installation_users.user_id",
                    value: user_id.to_string(),
                })?;
            return Ok(user);
        }

        let user = self.find_or_create_user(external_user_id, now);
        let binding = InstallationUser {
            id: self.allocate_id(),
            external_user_id: external_user_id.to_string(),
            installation_id: installation.id,
            user_id: user.id,
            created_at: now,
        };
        self.installation_users.push(binding);
        Ok(user)
    }

    fn user_for_identity(
        &mut self,
        installation: &Installation,
        identity: &Identity,
        now: DateTime<Utc>,
    ) -> StoreResult<User> {
        if identity.as_str().is_empty() {
            return Err(KudosStoreError::EmptyIdentity);
        }
        match identity {
            Identity::External(external_user_id) => {
                self.resolve(installation, external_user_id, now)
            }
            Identity::Username(username) => Ok(self.find_or_create_user(username, now)),
        }
    }

    fn count_for_recipient(&self, installation_id: i64, user_id: i64) -> i64 {
        self.kudos
            .iter()
            .filter(|kudos| kudos.installation_id == installation_id && kudos.to_user_id == user_id)
            .count() as i64
    }
}

impl InMemoryKudosStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl KudosStore for InMemoryKudosStore {
    async fn create_organization(&self, name: &str) -> StoreResult<Organization> {
        let mut inner = self.inner.write().await;
        if inner
            .organizations
            .iter()
            .any(|organization| organization.name == name)
        {
            return Err(KudosStoreError::OrganizationAlreadyExists(name.to_string()));
        }
        let organization = Organization {
            id: inner.allocate_id(),
            name: name.to_string(),
            created_at: Utc::now(),
        };
        inner.organizations.push(organization.clone());
        Ok(organization)
    }

    async fn organization_by_name(&self, name: &str) -> StoreResult<Option<Organization>> {
        let inner = self.inner.read().await;
        Ok(inner
            .organizations
            .iter()
            .find(|organization| organization.name == name)
            .cloned())
    }

    async fn create_installation(&self, new: NewInstallation) -> StoreResult<Installation> {
        let mut inner = self.inner.write().await;
        if inner
            .installation_by_external_id(&new.external_installation_id)
            .is_some()
        {
            return Err(KudosStoreError::InstallationAlreadyExists(
                new.external_installation_id,
            ));
        }
        let installation = Installation {
            id: inner.allocate_id(),
            external_installation_id: new.external_installation_id,
            platform: new.platform,
            organization_id: new.organization_id,
            access_token: new.access_token,
            bot_token: new.bot_token,
            created_at: Utc::now(),
        };
        inner.installations.push(installation.clone());
        Ok(installation)
    }

    async fn installation_by_external_id(
        &self,
        external_id: &str,
    ) -> StoreResult<Option<Installation>> {
        let inner = self.inner.read().await;
        Ok(inner.installation_by_external_id(external_id))
    }

    async fn resolve_user(
        &self,
        installation_external_id: &str,
        external_user_id: &str,
    ) -> StoreResult<User> {
        // The single write lock is the critical section: concurrent
        // first-sight resolutions of the same identifier serialize here.
        let mut inner = self.inner.write().await;
        let installation = inner
            .installation_by_external_id(installation_external_id)
            .ok_or_else(|| {
                KudosStoreError::InstallationNotFound(installation_external_id.to_string())
            })?;
        inner.resolve(&installation, external_user_id, Utc::now())
    }

    async fn record_grant(
        &self,
        installation_external_id: &str,
        from: &Identity,
        to: &Identity,
        description: &str,
    ) -> StoreResult<GrantReceipt> {
        if description.trim().is_empty() {
            return Err(KudosStoreError::EmptyDescription);
        }
        let mut inner = self.inner.write().await;
        let installation = inner
            .installation_by_external_id(installation_external_id)
            .ok_or_else(|| {
                KudosStoreError::InstallationNotFound(installation_external_id.to_string())
            })?;

        let now = Utc::now();
        // Resolutions mutate in place; restore them if a later step fails
        // so a failed grant leaves no resolver side effects, matching the
        // SQLite backend's transaction.
        let users_snapshot = inner.users.clone();
        let bindings_snapshot = inner.installation_users.clone();
        let next_id_snapshot = inner.next_id;

        let resolved = inner
            .user_for_identity(&installation, from, now)
            .and_then(|sender| {
                let recipient = inner.user_for_identity(&installation, to, now)?;
                Ok((sender, recipient))
            });
        let (sender, recipient) = match resolved {
            Ok(pair) => pair,
            Err(error) => {
                inner.users = users_snapshot;
                inner.installation_users = bindings_snapshot;
                inner.next_id = next_id_snapshot;
                return Err(error);
            }
        };

        let kudos = Kudos {
            id: inner.allocate_id(),
            from_user_id: sender.id,
            to_user_id: recipient.id,
            description: description.to_string(),
            installation_id: installation.id,
            created_at: now,
        };
        inner.kudos.push(kudos);
        let total = inner.count_for_recipient(installation.id, recipient.id);

        Ok(GrantReceipt {
            recipient_username: recipient.username,
            sender_username: sender.username,
            description: description.to_string(),
            platform: installation.platform,
            total,
            created_at: now,
        })
    }

    async fn count_for_user(
        &self,
        installation_external_id: &str,
        username: &str,
    ) -> StoreResult<i64> {
        let inner = self.inner.read().await;
        let installation = inner
            .installation_by_external_id(installation_external_id)
            .ok_or_else(|| {
                KudosStoreError::InstallationNotFound(installation_external_id.to_string())
            })?;
        let Some(user) = inner.users.iter().find(|user| user.username == username) else {
            return Ok(0);
        };
        Ok(inner.count_for_recipient(installation.id, user.id))
    }
}
