//! SQLite-backed `KudosStore` implementation with durable persistence.
//!
//! The `(installation_id, external_user_id)` unique constraint is the
//! serialization point for first-sight identity resolution: the resolver
//! inserts optimistically and treats a constraint violation as the signal
//! to re-fetch, never as an error for the caller.

use crate::{Identity, KudosStore, KudosStoreError, NewInstallation, StoreResult};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use kudos_types::{GrantReceipt, Installation, Organization, Platform, User};
use rusqlite::{params, Connection, OptionalExtension, Transaction, TransactionBehavior};
use std::path::{Path, PathBuf};
use std::time::Duration;

const RESOLVE_RETRY_LIMIT: usize = 3;

/// Persistent SQLite store backend shared by all request handlers.
#[derive(Debug)]
pub struct SqliteKudosStore {
    db_path: PathBuf,
}

impl SqliteKudosStore {
    /// Creates a SQLite-backed store at `path`, creating schema if needed.
    pub fn new(path: impl AsRef<Path>) -> StoreResult<Self> {
        let db_path = path.as_ref().to_path_buf();
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let store = Self { db_path };
        let connection = store.open_connection()?;
        store.initialize_schema(&connection)?;
        Ok(store)
    }

    fn open_connection(&self) -> StoreResult<Connection> {
        let connection = Connection::open(&self.db_path)?;
        connection.busy_timeout(Duration::from_secs(5))?;
        connection.execute_batch(
            r#"
            PRAGMA journal_mode = WAL;
            PRAGMA synchronous = NORMAL;
            PRAGMA foreign_keys = ON;
            "#,
        )?;
        Ok(connection)
    }

    fn initialize_schema(&self, connection: &Connection) -> StoreResult<()> {
        connection.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS organizations (
                organization_id INTEGER PRIMARY KEY AUTOINCREMENT,
                name TEXT NOT NULL UNIQUE,
                created_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS installations (
                installation_id INTEGER PRIMARY KEY AUTOINCREMENT,
                external_installation_id TEXT NOT NULL UNIQUE,
                platform TEXT NOT NULL,
                organization_id INTEGER NOT NULL,
                access_token TEXT NOT NULL,
                bot_token TEXT NOT NULL,
                created_at TEXT NOT NULL,
                FOREIGN KEY(organization_id) REFERENCES organizations(organization_id)
            );

            CREATE TABLE IF NOT EXISTS users (
                user_id INTEGER PRIMARY KEY AUTOINCREMENT,
                username TEXT NOT NULL UNIQUE,
                created_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS installation_users (
                installation_user_id INTEGER PRIMARY KEY AUTOINCREMENT,
                external_user_id TEXT NOT NULL,
                installation_id INTEGER NOT NULL,
                user_id INTEGER NOT NULL,
                created_at TEXT NOT NULL,
                UNIQUE(installation_id, external_user_id),
                FOREIGN KEY(installation_id) REFERENCES installations(installation_id),
                FOREIGN KEY(user_id) REFERENCES users(user_id)
            );

            CREATE TABLE IF NOT EXISTS kudos (
                kudos_id INTEGER PRIMARY KEY AUTOINCREMENT,
                from_user_id INTEGER NOT NULL,
                to_user_id INTEGER NOT NULL,
                description TEXT NOT NULL,
                installation_id INTEGER NOT NULL,
                created_at TEXT NOT NULL,
                FOREIGN KEY(from_user_id) REFERENCES users(user_id),
                FOREIGN KEY(to_user_id) REFERENCES users(user_id),
                FOREIGN KEY(installation_id) REFERENCES installations(installation_id)
            );

            CREATE INDEX IF NOT EXISTS idx_kudos_installation_recipient
                ON kudos (installation_id, to_user_id);
            "#,
        )?;
        Ok(())
    }
}

#[async_trait]
impl KudosStore for SqliteKudosStore {
    async fn create_organization(&self, name: &str) -> StoreResult<Organization> {
        let connection = self.open_connection()?;
        let now = Utc::now();
        let insert = connection.execute(
            "INSERT INTO organizations (name, created_at) VALUES (?1, ?2)",
            params![name, timestamp_to_db(now)],
        );
        match insert {
            Ok(_) => Ok(Organization {
                id: connection.last_insert_rowid(),
                name: name.to_string(),
                created_at: now,
            }),
            Err(error) if is_unique_violation(&error) => {
                Err(KudosStoreError::OrganizationAlreadyExists(name.to_string()))
            }
            Err(error) => Err(error.into()),
        }
    }

    async fn organization_by_name(&self, name: &str) -> StoreResult<Option<Organization>> {
        let connection = self.open_connection()?;
        let row = connection
            .query_row(
                "SELECT organization_id, name, created_at FROM organizations WHERE name = ?1",
                params![name],
                |row| {
                    Ok((
                        row.get::<_, i64>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, String>(2)?,
                    ))
                },
            )
            .optional()?;
        let Some((id, name, created_at)) = row else {
            return Ok(None);
        };
        Ok(Some(Organization {
            id,
            name,
            created_at: timestamp_from_db(&created_at)?,
        }))
    }

    async fn create_installation(&self, new: NewInstallation) -> StoreResult<Installation> {
        let connection = self.open_connection()?;
        let now = Utc::now();
        let insert = connection.execute(
            r#"
            INSERT INTO installations (
                external_installation_id, platform, organization_id,
                access_token, bot_token, created_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6)
            "#,
            params![
                new.external_installation_id,
                new.platform.as_str(),
                new.organization_id,
                new.access_token,
                new.bot_token,
                timestamp_to_db(now),
            ],
        );
        if let Err(error) = insert {
            if is_unique_violation(&error) {
                return Err(KudosStoreError::InstallationAlreadyExists(
                    new.external_installation_id,
                ));
            }
            return Err(error.into());
        }
        Ok(Installation {
            id: connection.last_insert_rowid(),
            external_installation_id: new.external_installation_id,
            platform: new.platform,
            organization_id: new.organization_id,
            access_token: new.access_token,
            bot_token: new.bot_token,
            created_at: now,
        })
    }

    async fn installation_by_external_id(
        &self,
        external_id: &str,
    ) -> StoreResult<Option<Installation>> {
        let connection = self.open_connection()?;
        installation_by_external_id(&connection, external_id)
    }

    async fn resolve_user(
        &self,
        installation_external_id: &str,
        external_user_id: &str,
    ) -> StoreResult<User> {
        let mut connection = self.open_connection()?;
        let transaction = connection.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let installation = require_installation(&transaction, installation_external_id)?;
        let user = resolve_in_tx(&transaction, &installation, external_user_id, Utc::now())?;
        transaction.commit()?;
        Ok(user)
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

        let mut connection = self.open_connection()?;
        // Both resolutions, the insert, and the count commit together; a
        // failure at any step leaves no resolver side effects behind.
        let transaction = connection.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let installation = require_installation(&transaction, installation_external_id)?;
        let now = Utc::now();

        let sender = user_for_identity(&transaction, &installation, from, now)?;
        let recipient = user_for_identity(&transaction, &installation, to, now)?;

        transaction.execute(
            r#"
            INSERT INTO kudos (from_user_id, to_user_id, description, installation_id, created_at)
            VALUES (?1, ?2, ?3, ?4, ?5)
            "#,
            params![
                sender.id,
                recipient.id,
                description,
                installation.id,
                timestamp_to_db(now),
            ],
        )?;

        let total: i64 = transaction.query_row(
            "SELECT COUNT(*) FROM kudos WHERE installation_id = ?1 AND to_user_id = ?2",
            params![installation.id, recipient.id],
            |row| row.get(0),
        )?;
        transaction.commit()?;

        tracing::debug!(
            installation = %installation.external_installation_id,
            recipient = %recipient.username,
            total,
            "recorded kudos grant"
        );

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
        let connection = self.open_connection()?;
        let installation = require_installation(&connection, installation_external_id)?;
        let total: i64 = connection.query_row(
            r#"
            SELECT COUNT(*)
            FROM kudos
            JOIN users ON users.user_id = kudos.to_user_id
            WHERE kudos.installation_id = ?1 AND users.username = ?2
            "#,
            params![installation.id, username],
            |row| row.get(0),
        )?;
        Ok(total)
    }
}

fn require_installation(
    connection: &Connection,
    external_id: &str,
) -> StoreResult<Installation> {
    installation_by_external_id(connection, external_id)?
        .ok_or_else(|| KudosStoreError::InstallationNotFound(external_id.to_string()))
}

fn installation_by_external_id(
    connection: &Connection,
    external_id: &str,
) -> StoreResult<Option<Installation>> {
    let row = connection
        .query_row(
            r#"
            SELECT installation_id, external_installation_id, platform, organization_id,
                   access_token, bot_token, created_at
            FROM installations
            WHERE external_installation_id = ?1
            "#,
            params![external_id],
            |row| {
                Ok((
                    row.get::<_, i64>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, i64>(3)?,
                    row.get::<_, String>(4)?,
                    row.get::<_, String>(5)?,
                    row.get::<_, String>(6)?,
                ))
            },
        )
        .optional()?;

    let Some((id, external_installation_id, platform, organization_id, access_token, bot_token, created_at)) =
        row
    else {
        return Ok(None);
    };

    Ok(Some(Installation {
        id,
        external_installation_id,
        platform: platform_from_db(&platform)?,
        organization_id,
        access_token,
        bot_token,
        created_at: timestamp_from_db(&created_at)?,
    }))
}

fn user_for_identity(
    transaction: &Transaction<'_>,
    installation: &Installation,
    identity: &Identity,
    now: DateTime<Utc>,
) -> StoreResult<User> {
    match identity {
        Identity::External(external_user_id) => {
            resolve_in_tx(transaction, installation, external_user_id, now)
        }
        Identity::Username(username) => {
            if username.is_empty() {
                return Err(KudosStoreError::EmptyIdentity);
            }
            find_or_create_user(transaction, username, now)
        }
    }
}

fn resolve_in_tx(
    transaction: &Transaction<'_>,
    installation: &Installation,
    external_user_id: &str,
    now: DateTime<Utc>,
) -> StoreResult<User> {
    if external_user_id.is_empty() {
        return Err(KudosStoreError::EmptyIdentity);
    }

    for _ in 0..RESOLVE_RETRY_LIMIT {
        let bound: Option<(i64, String, String)> = transaction
            .query_row(
                r#"
                SELECT users.user_id, users.username, users.created_at
                FROM installation_users
                JOIN users ON users.user_id = installation_users.user_id
                WHERE installation_users.installation_id = ?1
                  AND installation_users.external_user_id = ?2
                "#,
                params![installation.id, external_user_id],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
            )
            .optional()?;
        if let Some((id, username, created_at)) = bound {
            return Ok(User {
                id,
                username,
                created_at: timestamp_from_db(&created_at)?,
            });
        }

        let user = find_or_create_user(transaction, external_user_id, now)?;
        let insert = transaction.execute(
            r#"
            INSERT INTO installation_users (external_user_id, installation_id, user_id, created_at)
            VALUES (?1, ?2, ?3, ?4)
            "#,
            params![external_user_id, installation.id, user.id, timestamp_to_db(now)],
        );
        match insert {
            Ok(_) => return Ok(user),
            Err(error) if is_unique_violation(&error) => {
                // Lost the first-sight race; the winner's binding is now
                // visible, so loop back to the fetch.
                tracing::debug!(
                    installation = %installation.external_installation_id,
                    external_user_id,
                    "identity insert lost race, re-fetching"
                );
                continue;
            }
            Err(error) => return Err(error.into()),
        }
    }

    Err(KudosStoreError::IdentityConflict {
        installation: installation.external_installation_id.clone(),
        external_user_id: external_user_id.to_string(),
    })
}

fn find_or_create_user(
    transaction: &Transaction<'_>,
    username: &str,
    now: DateTime<Utc>,
) -> StoreResult<User> {
    // Seed usernames are globally unique; an identifier that matches an
    // existing username joins that identity rather than failing.
    transaction.execute(
        "INSERT INTO users (username, created_at) VALUES (?1, ?2) ON CONFLICT(username) DO NOTHING",
        params![username, timestamp_to_db(now)],
    )?;
    let (id, created_at): (i64, String) = transaction.query_row(
        "SELECT user_id, created_at FROM users WHERE username = ?1",
        params![username],
        |row| Ok((row.get(0)?, row.get(1)?)),
    )?;
    Ok(User {
        id,
        username: username.to_string(),
        created_at: timestamp_from_db(&created_at)?,
    })
}

fn is_unique_violation(error: &rusqlite::Error) -> bool {
    matches!(
        error,
        rusqlite::Error::SqliteFailure(failure, _)
            if failure.code == rusqlite::ErrorCode::ConstraintViolation
    )
}

fn timestamp_to_db(value: DateTime<Utc>) -> String {
    value.to_rfc3339()
}

fn timestamp_from_db(value: &str) -> StoreResult<DateTime<Utc>> {
    Ok(DateTime::parse_from_rfc3339(value)?.with_timezone(&Utc))
}

fn platform_from_db(value: &str) -> StoreResult<Platform> {
    value
        .parse()
        .map_err(|_| KudosStoreError::InvalidPersistedValue {
            field: "installations.platform",
            value: value.to_string(),
        })
}
