use chrono::{DateTime, SecondsFormat, Utc};
use libsql::{Row, params};
use thiserror::Error;
use uuid::Uuid;

use crate::db::{Database, DbError};

const LEDGER_COLUMNS: &str =
    "id, provider_message_id, user_id, processed_at, category, archived, created_at";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LedgerEntry {
    pub id: String,
    pub provider_message_id: String,
    pub user_id: String,
    pub processed_at: Option<DateTime<Utc>>,
    pub category: Option<String>,
    pub archived: bool,
    pub created_at: DateTime<Utc>,
}

/// Result of attempting to claim a message for processing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClaimOutcome {
    /// This caller owns the message and must process it.
    Claimed(LedgerEntry),
    /// A previous run finished this message. Skip it.
    AlreadyProcessed(LedgerEntry),
    /// A previous run claimed the message but never finished. The claim is
    /// transferred to this caller so the message gets a second pass.
    RetryIncomplete(LedgerEntry),
    /// The message id is already claimed under a different user. Provider
    /// message ids are expected to be globally unique, so this is an anomaly
    /// the caller should log before deciding how to continue.
    OwnedByOtherUser { owner_user_id: String },
}

#[derive(Debug, Error)]
pub enum LedgerError {
    #[error("database error: {0}")]
    Database(#[from] DbError),
    #[error("sql error: {0}")]
    Sql(#[from] libsql::Error),
    #[error("datetime parse error: {0}")]
    DateTimeParse(#[from] chrono::ParseError),
    #[error("ledger entry not found: {0}")]
    NotFound(String),
}

#[derive(Clone)]
pub struct Ledger {
    db: Database,
}

impl Ledger {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Atomically claims a provider message id. The UNIQUE constraint on
    /// provider_message_id arbitrates concurrent claims: exactly one insert
    /// wins and every other caller observes the existing row.
    pub async fn try_claim(
        &self,
        provider_message_id: &str,
        user_id: &str,
    ) -> Result<ClaimOutcome, LedgerError> {
        let id = Uuid::new_v4().to_string();
        let now = now_rfc3339();
        let conn = self.db.connection().await?;

        let result = conn
            .query(
                &format!(
                    "INSERT INTO ledger (id, provider_message_id, user_id, processed_at, category, archived, created_at)
                     VALUES (?1, ?2, ?3, NULL, NULL, 0, ?4)
                     RETURNING {LEDGER_COLUMNS}"
                ),
                params![id, provider_message_id, user_id, now],
            )
            .await;

        match result {
            Ok(mut rows) => {
                let row = rows
                    .next()
                    .await?
                    .ok_or_else(|| LedgerError::NotFound("insert returned no row".into()))?;
                Ok(ClaimOutcome::Claimed(row_to_entry(row)?))
            }
            Err(err) if is_unique_violation(&err) => {
                let existing = self.get(provider_message_id).await?;
                if existing.user_id != user_id {
                    return Ok(ClaimOutcome::OwnedByOtherUser {
                        owner_user_id: existing.user_id,
                    });
                }
                if existing.processed_at.is_some() {
                    Ok(ClaimOutcome::AlreadyProcessed(existing))
                } else {
                    Ok(ClaimOutcome::RetryIncomplete(existing))
                }
            }
            Err(err) => Err(err.into()),
        }
    }

    pub async fn get(&self, provider_message_id: &str) -> Result<LedgerEntry, LedgerError> {
        let conn = self.db.connection().await?;
        let mut rows = conn
            .query(
                &format!("SELECT {LEDGER_COLUMNS} FROM ledger WHERE provider_message_id = ?1"),
                params![provider_message_id],
            )
            .await?;

        match rows.next().await? {
            Some(row) => row_to_entry(row),
            None => Err(LedgerError::NotFound(provider_message_id.to_string())),
        }
    }

    /// Records the final outcome for a claimed message. Only after this call
    /// does the ledger treat the message as done.
    pub async fn mark_processed(
        &self,
        provider_message_id: &str,
        category: Option<&str>,
        archived: bool,
    ) -> Result<LedgerEntry, LedgerError> {
        let now = now_rfc3339();
        let conn = self.db.connection().await?;
        let mut rows = conn
            .query(
                &format!(
                    "UPDATE ledger
                     SET processed_at = ?2, category = ?3, archived = ?4
                     WHERE provider_message_id = ?1
                     RETURNING {LEDGER_COLUMNS}"
                ),
                params![provider_message_id, now, category, archived as i64],
            )
            .await?;

        match rows.next().await? {
            Some(row) => row_to_entry(row),
            None => Err(LedgerError::NotFound(provider_message_id.to_string())),
        }
    }

    pub async fn list_by_user(&self, user_id: &str) -> Result<Vec<LedgerEntry>, LedgerError> {
        let conn = self.db.connection().await?;
        let mut rows = conn
            .query(
                &format!(
                    "SELECT {LEDGER_COLUMNS} FROM ledger WHERE user_id = ?1 ORDER BY created_at"
                ),
                params![user_id],
            )
            .await?;

        let mut entries = Vec::new();
        while let Some(row) = rows.next().await? {
            entries.push(row_to_entry(row)?);
        }
        Ok(entries)
    }
}

fn now_rfc3339() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)
}

fn is_unique_violation(err: &libsql::Error) -> bool {
    err.to_string()
        .to_ascii_lowercase()
        .contains("unique constraint failed")
}

fn row_to_entry(row: Row) -> Result<LedgerEntry, LedgerError> {
    let processed_at: Option<String> = row.get(3)?;
    let archived: i64 = row.get(5)?;
    let created_at: String = row.get(6)?;

    Ok(LedgerEntry {
        id: row.get(0)?,
        provider_message_id: row.get(1)?,
        user_id: row.get(2)?,
        processed_at: processed_at
            .map(|ts| DateTime::parse_from_rfc3339(&ts).map(|dt| dt.with_timezone(&Utc)))
            .transpose()?,
        category: row.get(4)?,
        archived: archived != 0,
        created_at: DateTime::parse_from_rfc3339(&created_at)?.with_timezone(&Utc),
    })
}
