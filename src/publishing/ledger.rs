//! Publication ledger: recorded per-target outcomes keyed by idempotency key.
//!
//! None of the supported platforms deduplicates on a client key, so the
//! ledger is what stops the same content being posted twice to the same
//! account within one idempotency bucket.

use super::PublishOutcome;
use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};
use serde::Serialize;
use std::path::Path;
use std::sync::{Mutex, MutexGuard};

/// One recorded outcome
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PublicationRecord {
    pub post_id: String,
    pub user_id: String,
    pub integration_id: String,
    pub provider: String,
    pub idempotency_key: String,
    pub outcome: PublishOutcome,
    pub recorded_at: DateTime<Utc>,
}

pub struct PublicationLedger {
    conn: Mutex<Connection>,
}

impl PublicationLedger {
    /// Creates or opens the ledger. `":memory:"` gives a private in-memory database.
    pub fn open<P: AsRef<Path>>(db_path: P) -> Result<Self> {
        let conn = Connection::open(db_path).context("Failed to open database")?;

        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS publications (
                idempotency_key TEXT PRIMARY KEY,
                post_id TEXT NOT NULL,
                user_id TEXT NOT NULL,
                integration_id TEXT NOT NULL,
                provider TEXT NOT NULL,
                outcome TEXT NOT NULL,
                recorded_at TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_publications_post ON publications(user_id, post_id);
            "#,
        )
        .context("Failed to create publications table")?;

        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| anyhow!("Publication ledger lock poisoned"))
    }

    /// Record an outcome. A later outcome for the same key replaces the earlier one.
    pub fn record(&self, record: &PublicationRecord) -> Result<()> {
        let outcome = serde_json::to_string(&record.outcome).context("Failed to encode outcome")?;

        self.conn()?
            .execute(
                r#"
                INSERT INTO publications (
                    idempotency_key, post_id, user_id, integration_id, provider, outcome, recorded_at
                )
                VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
                ON CONFLICT(idempotency_key) DO UPDATE SET
                    post_id = excluded.post_id,
                    outcome = excluded.outcome,
                    recorded_at = excluded.recorded_at
                "#,
                params![
                    record.idempotency_key,
                    record.post_id,
                    record.user_id,
                    record.integration_id,
                    record.provider,
                    outcome,
                    record.recorded_at.to_rfc3339(),
                ],
            )
            .context("Failed to record publication")?;
        Ok(())
    }

    pub fn find(&self, idempotency_key: &str) -> Result<Option<PublicationRecord>> {
        let raw = self
            .conn()?
            .query_row(
                "SELECT idempotency_key, post_id, user_id, integration_id, provider, outcome, recorded_at \
                 FROM publications WHERE idempotency_key = ?1",
                params![idempotency_key],
                read_row,
            )
            .optional()
            .context("Failed to look up publication")?;

        raw.map(RawRecord::into_record).transpose()
    }

    /// Outcomes recorded for a user's post, oldest first.
    pub fn list_for_post(&self, user_id: &str, post_id: &str) -> Result<Vec<PublicationRecord>> {
        let conn = self.conn()?;
        let mut stmt = conn
            .prepare(
                "SELECT idempotency_key, post_id, user_id, integration_id, provider, outcome, recorded_at \
                 FROM publications WHERE user_id = ?1 AND post_id = ?2 ORDER BY recorded_at",
            )
            .context("Failed to prepare publication query")?;

        let rows = stmt
            .query_map(params![user_id, post_id], read_row)
            .context("Failed to list publications")?;

        let mut records = Vec::new();
        for row in rows {
            records.push(row.context("Failed to read publication row")?.into_record()?);
        }
        Ok(records)
    }
}

struct RawRecord {
    idempotency_key: String,
    post_id: String,
    user_id: String,
    integration_id: String,
    provider: String,
    outcome: String,
    recorded_at: String,
}

fn read_row(row: &Row<'_>) -> rusqlite::Result<RawRecord> {
    Ok(RawRecord {
        idempotency_key: row.get(0)?,
        post_id: row.get(1)?,
        user_id: row.get(2)?,
        integration_id: row.get(3)?,
        provider: row.get(4)?,
        outcome: row.get(5)?,
        recorded_at: row.get(6)?,
    })
}

impl RawRecord {
    fn into_record(self) -> Result<PublicationRecord> {
        Ok(PublicationRecord {
            outcome: serde_json::from_str(&self.outcome).context("Invalid stored outcome")?,
            recorded_at: DateTime::parse_from_rfc3339(&self.recorded_at)
                .context("Invalid recorded_at timestamp")?
                .with_timezone(&Utc),
            idempotency_key: self.idempotency_key,
            post_id: self.post_id,
            user_id: self.user_id,
            integration_id: self.integration_id,
            provider: self.provider,
        })
    }
}
