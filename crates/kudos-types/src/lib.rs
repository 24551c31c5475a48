//! Shared data types for the kudos ledger.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Error returned when a platform label cannot be parsed.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unknown chat platform '{0}'")]
pub struct UnknownPlatform(pub String);

/// Chat platform an installation belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Platform {
    Slack,
    GoogleChat,
}

impl Platform {
    /// Stable label used in persistence and webhook payloads.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Slack => "slack",
            Self::GoogleChat => "googlechat",
        }
    }
}

impl std::str::FromStr for Platform {
    type Err = UnknownPlatform;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "slack" => Ok(Self::Slack),
            "googlechat" => Ok(Self::GoogleChat),
            other => Err(UnknownPlatform(other.to_string())),
        }
    }
}

impl std::fmt::Display for Platform {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How a grant participant was named by the caller.
///
/// `External` identities go through the resolver and leave an
/// installation-scoped binding behind; `Username` identities name an
/// internal user directly and create no binding.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Identity {
    External(String),
    Username(String),
}

impl Identity {
    pub fn as_str(&self) -> &str {
        match self {
            Self::External(value) | Self::Username(value) => value,
        }
    }
}

/// Tenant's top-level identity, created lazily on first successful install.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Organization {
    pub id: i64,
    pub name: String,
    pub created_at: DateTime<Utc>,
}

/// One (platform, external tenant) activation holding that tenant's
/// credentials. `external_installation_id` is immutable once recorded.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Installation {
    pub id: i64,
    pub external_installation_id: String,
    pub platform: Platform,
    pub organization_id: i64,
    pub access_token: String,
    pub bot_token: String,
    pub created_at: DateTime<Utc>,
}

/// Global identity record; usernames are unique across the system.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    pub id: i64,
    pub username: String,
    pub created_at: DateTime<Utc>,
}

/// Resolved binding of a platform-local external user identifier to an
/// internal [`User`], scoped to one installation. At most one binding
/// exists per (installation, external user id) pair.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstallationUser {
    pub id: i64,
    pub external_user_id: String,
    pub installation_id: i64,
    pub user_id: i64,
    pub created_at: DateTime<Utc>,
}

/// One recorded act of giving kudos. Append-only; never mutated or deleted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Kudos {
    pub id: i64,
    pub from_user_id: i64,
    pub to_user_id: i64,
    pub description: String,
    pub installation_id: i64,
    pub created_at: DateTime<Utc>,
}

/// Outcome of a recorded grant, including the recipient's recomputed
/// per-installation running total.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GrantReceipt {
    pub recipient_username: String,
    pub sender_username: String,
    pub description: String,
    pub platform: Platform,
    pub total: i64,
    pub created_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::Platform;

    #[test]
    fn platform_labels_round_trip() {
        for platform in [Platform::Slack, Platform::GoogleChat] {
            let parsed: Platform = platform.as_str().parse().expect("parse label");
            assert_eq!(parsed, platform);
        }
    }

    #[test]
    fn unknown_platform_is_rejected() {
        assert!("teams".parse::<Platform>().is_err());
    }
}
