//! Encrypted integration storage using SQLite.
//!
//! One row per (user, provider, platform account). Token columns are sealed
//! with [`TokenCipher`]; everything else is plain so integrations can be
//! listed without touching secrets.

use super::encryption::{Sealed, TokenCipher};
use super::{Credentials, Integration, IntegrationStatus};
use crate::providers::TokenSet;
use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};
use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;
use std::sync::{Mutex, MutexGuard};

/// Encrypted integration storage backed by SQLite.
///
/// # Schema
/// ```sql
/// CREATE TABLE integrations (
///     id TEXT PRIMARY KEY,               -- UUID v4
///     user_id TEXT NOT NULL,
///     provider TEXT NOT NULL,
///     internal_id TEXT NOT NULL,         -- platform account/channel id
///     access_token TEXT NOT NULL,        -- Encrypted
///     access_token_nonce TEXT NOT NULL,
///     refresh_token TEXT,                -- Encrypted (optional)
///     refresh_token_nonce TEXT,
///     token_expires_at TEXT,             -- RFC 3339 (optional)
///     status TEXT NOT NULL,
///     scopes TEXT NOT NULL,              -- JSON array
///     platform_metadata TEXT NOT NULL,   -- JSON object
///     created_at TEXT NOT NULL,
///     updated_at TEXT NOT NULL,
///     deleted_at TEXT,                   -- soft delete marker
///     UNIQUE(user_id, provider, internal_id)
/// );
/// ```
pub struct IntegrationStore {
    conn: Mutex<Connection>,
    cipher: TokenCipher,
}

const INTEGRATION_COLUMNS: &str = "id, user_id, provider, internal_id, token_expires_at, status, \
     scopes, platform_metadata, created_at, updated_at";

impl IntegrationStore {
    /// Creates or opens a store. `":memory:"` gives a private in-memory database.
    pub fn open<P: AsRef<Path>>(db_path: P, cipher: TokenCipher) -> Result<Self> {
        let conn = Connection::open(db_path).context("Failed to open database")?;

        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS integrations (
                id TEXT PRIMARY KEY,
                user_id TEXT NOT NULL,
                provider TEXT NOT NULL,
                internal_id TEXT NOT NULL,
                access_token TEXT NOT NULL,
                access_token_nonce TEXT NOT NULL,
                refresh_token TEXT,
                refresh_token_nonce TEXT,
                token_expires_at TEXT,
                status TEXT NOT NULL,
                scopes TEXT NOT NULL,
                platform_metadata TEXT NOT NULL,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL,
                deleted_at TEXT,
                UNIQUE(user_id, provider, internal_id)
            );
            CREATE INDEX IF NOT EXISTS idx_integrations_user ON integrations(user_id);
            "#,
        )
        .context("Failed to create integrations table")?;

        Ok(Self {
            conn: Mutex::new(conn),
            cipher,
        })
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| anyhow!("Integration store lock poisoned"))
    }

    fn seal_optional(&self, value: Option<&str>) -> Result<(Option<String>, Option<String>)> {
        match value {
            Some(token) => {
                let sealed = self
                    .cipher
                    .seal(token)
                    .context("Failed to encrypt refresh token")?;
                Ok((Some(sealed.ciphertext), Some(sealed.nonce)))
            }
            None => Ok((None, None)),
        }
    }

    /// Create the integration for a freshly authorized account, or revive and
    /// update the existing row for the same (user, provider, account).
    pub fn upsert(&self, user_id: &str, provider: &str, tokens: &TokenSet) -> Result<Integration> {
        let access = self
            .cipher
            .seal(&tokens.access_token)
            .context("Failed to encrypt access token")?;
        let (refresh, refresh_nonce) = self.seal_optional(tokens.refresh_token.as_deref())?;

        let scopes = serde_json::to_string(&tokens.scopes).context("Failed to encode scopes")?;
        let metadata =
            serde_json::to_string(&tokens.metadata).context("Failed to encode metadata")?;
        let now = Utc::now().to_rfc3339();
        let id = uuid::Uuid::new_v4().to_string();

        let conn = self.conn()?;
        conn.execute(
            r#"
            INSERT INTO integrations (
                id, user_id, provider, internal_id,
                access_token, access_token_nonce,
                refresh_token, refresh_token_nonce,
                token_expires_at, status, scopes, platform_metadata,
                created_at, updated_at, deleted_at
            )
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?13, NULL)
            ON CONFLICT(user_id, provider, internal_id) DO UPDATE SET
                access_token = excluded.access_token,
                access_token_nonce = excluded.access_token_nonce,
                refresh_token = excluded.refresh_token,
                refresh_token_nonce = excluded.refresh_token_nonce,
                token_expires_at = excluded.token_expires_at,
                status = excluded.status,
                scopes = excluded.scopes,
                platform_metadata = excluded.platform_metadata,
                updated_at = excluded.updated_at,
                deleted_at = NULL
            "#,
            params![
                id,
                user_id,
                provider,
                tokens.internal_id,
                access.ciphertext,
                access.nonce,
                refresh,
                refresh_nonce,
                tokens.expires_at.map(|t| t.to_rfc3339()),
                IntegrationStatus::Active.as_str(),
                scopes,
                metadata,
                now,
            ],
        )
        .context("Failed to store integration")?;

        let sql = format!(
            "SELECT {} FROM integrations WHERE user_id = ?1 AND provider = ?2 AND internal_id = ?3",
            INTEGRATION_COLUMNS
        );
        let row = conn
            .query_row(&sql, params![user_id, provider, tokens.internal_id], read_row)
            .context("Failed to read stored integration")?;
        row.into_integration()
    }

    /// Id of the row for (user, provider, account), soft-deleted rows included.
    pub fn find_id(&self, user_id: &str, provider: &str, internal_id: &str) -> Result<Option<String>> {
        self.conn()?
            .query_row(
                "SELECT id FROM integrations WHERE user_id = ?1 AND provider = ?2 AND internal_id = ?3",
                params![user_id, provider, internal_id],
                |row| row.get(0),
            )
            .optional()
            .context("Failed to look up integration")
    }

    /// Live (not soft-deleted) integration by id.
    pub fn get(&self, id: &str) -> Result<Option<Integration>> {
        let sql = format!(
            "SELECT {} FROM integrations WHERE id = ?1 AND deleted_at IS NULL",
            INTEGRATION_COLUMNS
        );
        let row = self
            .conn()?
            .query_row(&sql, params![id], read_row)
            .optional()
            .context("Failed to query integration")?;
        row.map(RawIntegration::into_integration).transpose()
    }

    /// Decrypted tokens of a live integration.
    pub fn credentials(&self, id: &str) -> Result<Option<Credentials>> {
        let row = self
            .conn()?
            .query_row(
                r#"
                SELECT access_token, access_token_nonce,
                       refresh_token, refresh_token_nonce,
                       token_expires_at
                FROM integrations
                WHERE id = ?1 AND deleted_at IS NULL
                "#,
                params![id],
                |row| {
                    Ok((
                        Sealed {
                            ciphertext: row.get(0)?,
                            nonce: row.get(1)?,
                        },
                        row.get::<_, Option<String>>(2)?,
                        row.get::<_, Option<String>>(3)?,
                        row.get::<_, Option<String>>(4)?,
                    ))
                },
            )
            .optional()
            .context("Failed to query credentials")?;

        let Some((access, refresh, refresh_nonce, expires_at)) = row else {
            return Ok(None);
        };

        let access_token = self
            .cipher
            .open(&access)
            .context("Failed to decrypt access token")?;
        let refresh_token = match (refresh, refresh_nonce) {
            (Some(ciphertext), Some(nonce)) => Some(
                self.cipher
                    .open(&Sealed { ciphertext, nonce })
                    .context("Failed to decrypt refresh token")?,
            ),
            _ => None,
        };

        Ok(Some(Credentials {
            access_token,
            refresh_token,
            expires_at: parse_optional_timestamp(expires_at)?,
        }))
    }

    /// Replace the tokens of an integration and mark it ACTIVE.
    pub fn update_tokens(&self, id: &str, credentials: &Credentials) -> Result<bool> {
        let access = self
            .cipher
            .seal(&credentials.access_token)
            .context("Failed to encrypt access token")?;
        let (refresh, refresh_nonce) = self.seal_optional(credentials.refresh_token.as_deref())?;

        let updated = self
            .conn()?
            .execute(
                r#"
                UPDATE integrations SET
                    access_token = ?2, access_token_nonce = ?3,
                    refresh_token = ?4, refresh_token_nonce = ?5,
                    token_expires_at = ?6, status = ?7, updated_at = ?8
                WHERE id = ?1 AND deleted_at IS NULL
                "#,
                params![
                    id,
                    access.ciphertext,
                    access.nonce,
                    refresh,
                    refresh_nonce,
                    credentials.expires_at.map(|t| t.to_rfc3339()),
                    IntegrationStatus::Active.as_str(),
                    Utc::now().to_rfc3339(),
                ],
            )
            .context("Failed to update tokens")?;
        Ok(updated > 0)
    }

    pub fn set_status(&self, id: &str, status: IntegrationStatus) -> Result<bool> {
        let updated = self
            .conn()?
            .execute(
                "UPDATE integrations SET status = ?2, updated_at = ?3 WHERE id = ?1 AND deleted_at IS NULL",
                params![id, status.as_str(), Utc::now().to_rfc3339()],
            )
            .context("Failed to update status")?;
        Ok(updated > 0)
    }

    /// Soft delete: the row stays for audit and analytics linkage but is
    /// hidden from every read. Returns false if already gone.
    pub fn soft_delete(&self, id: &str) -> Result<bool> {
        let now = Utc::now().to_rfc3339();
        let updated = self
            .conn()?
            .execute(
                "UPDATE integrations SET deleted_at = ?2, status = ?3, updated_at = ?2 \
                 WHERE id = ?1 AND deleted_at IS NULL",
                params![id, now, IntegrationStatus::Revoked.as_str()],
            )
            .context("Failed to delete integration")?;
        Ok(updated > 0)
    }

    /// Live integrations of a user, ordered by provider then creation time.
    pub fn list_by_user(&self, user_id: &str) -> Result<Vec<Integration>> {
        let sql = format!(
            "SELECT {} FROM integrations WHERE user_id = ?1 AND deleted_at IS NULL \
             ORDER BY provider, created_at",
            INTEGRATION_COLUMNS
        );
        let conn = self.conn()?;
        let mut stmt = conn.prepare(&sql).context("Failed to prepare query")?;
        let rows = stmt
            .query_map(params![user_id], read_row)
            .context("Failed to execute query")?
            .collect::<Result<Vec<_>, _>>()
            .context("Failed to read results")?;

        rows.into_iter()
            .map(RawIntegration::into_integration)
            .collect()
    }
}

/// Column values as stored, before parsing.
struct RawIntegration {
    id: String,
    user_id: String,
    provider: String,
    internal_id: String,
    token_expires_at: Option<String>,
    status: String,
    scopes: String,
    metadata: String,
    created_at: String,
    updated_at: String,
}

fn read_row(row: &Row<'_>) -> rusqlite::Result<RawIntegration> {
    Ok(RawIntegration {
        id: row.get(0)?,
        user_id: row.get(1)?,
        provider: row.get(2)?,
        internal_id: row.get(3)?,
        token_expires_at: row.get(4)?,
        status: row.get(5)?,
        scopes: row.get(6)?,
        metadata: row.get(7)?,
        created_at: row.get(8)?,
        updated_at: row.get(9)?,
    })
}

impl RawIntegration {
    fn into_integration(self) -> Result<Integration> {
        let scopes: BTreeSet<String> =
            serde_json::from_str(&self.scopes).context("Failed to decode scopes")?;
        let platform_metadata: BTreeMap<String, String> =
            serde_json::from_str(&self.metadata).context("Failed to decode metadata")?;

        Ok(Integration {
            status: self.status.parse()?,
            token_expires_at: parse_optional_timestamp(self.token_expires_at)?,
            created_at: parse_timestamp(&self.created_at)?,
            updated_at: parse_timestamp(&self.updated_at)?,
            id: self.id,
            user_id: self.user_id,
            provider: self.provider,
            internal_id: self.internal_id,
            scopes,
            platform_metadata,
        })
    }
}

fn parse_timestamp(value: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .map(|dt| dt.with_timezone(&Utc))
        .with_context(|| format!("Invalid timestamp '{}'", value))
}

fn parse_optional_timestamp(value: Option<String>) -> Result<Option<DateTime<Utc>>> {
    value.as_deref().map(parse_timestamp).transpose()
}
