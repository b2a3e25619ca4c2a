use chrono::{DateTime, SecondsFormat, Utc};
use libsql::{Row, params};
use thiserror::Error;
use uuid::Uuid;

use crate::db::{Database, DbError};

const WATCH_COLUMNS: &str = "id, user_id, account_email, cursor, topic, active, expires_at, last_processed_at, created_at, updated_at";

/// An active push registration for one mailbox. `cursor` is the last history
/// id the sync pipeline has fully reconciled; `last_processed_at` is the
/// receipt time of the newest message actually processed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Watch {
    pub id: String,
    pub user_id: String,
    pub account_email: String,
    pub cursor: String,
    pub topic: String,
    pub active: bool,
    pub expires_at: DateTime<Utc>,
    pub last_processed_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Error)]
pub enum WatchError {
    #[error("database error: {0}")]
    Database(#[from] DbError),
    #[error("sql error: {0}")]
    Sql(#[from] libsql::Error),
    #[error("datetime parse error: {0}")]
    DateTimeParse(#[from] chrono::ParseError),
    #[error("watch not found: {0}")]
    NotFound(String),
}

#[derive(Clone)]
pub struct WatchRepository {
    db: Database,
}

impl WatchRepository {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Creates the watch row for this (user, mailbox) pair or replaces the
    /// existing one in place. Replacement resets the cursor and expiry but
    /// keeps `last_processed_at` so the processing floor survives renewals.
    pub async fn upsert(
        &self,
        user_id: &str,
        account_email: &str,
        cursor: &str,
        topic: &str,
        expires_at: DateTime<Utc>,
    ) -> Result<Watch, WatchError> {
        let id = Uuid::new_v4().to_string();
        let now = now_rfc3339();
        let expires = to_rfc3339(expires_at);

        let conn = self.db.connection().await?;
        let mut rows = conn
            .query(
                &format!(
                    "INSERT INTO watches (id, user_id, account_email, cursor, topic, active, expires_at, last_processed_at, created_at, updated_at)
                     VALUES (?1, ?2, ?3, ?4, ?5, 1, ?6, NULL, ?7, ?7)
                     ON CONFLICT (user_id, account_email) DO UPDATE SET
                         cursor = excluded.cursor,
                         topic = excluded.topic,
                         active = 1,
                         expires_at = excluded.expires_at,
                         updated_at = excluded.updated_at
                     RETURNING {WATCH_COLUMNS}"
                ),
                params![id, user_id, account_email, cursor, topic, expires, now],
            )
            .await?;

        let row = rows
            .next()
            .await?
            .ok_or_else(|| WatchError::NotFound("upsert returned no row".into()))?;
        row_to_watch(row)
    }

    pub async fn get(&self, user_id: &str, account_email: &str) -> Result<Watch, WatchError> {
        let conn = self.db.connection().await?;
        let mut rows = conn
            .query(
                &format!(
                    "SELECT {WATCH_COLUMNS} FROM watches WHERE user_id = ?1 AND account_email = ?2"
                ),
                params![user_id, account_email],
            )
            .await?;

        match rows.next().await? {
            Some(row) => row_to_watch(row),
            None => Err(WatchError::NotFound(format!(
                "{user_id}/{account_email}"
            ))),
        }
    }

    /// Active watch for a mailbox, looked up when a notification arrives.
    pub async fn get_active_by_email(
        &self,
        account_email: &str,
    ) -> Result<Option<Watch>, WatchError> {
        let conn = self.db.connection().await?;
        let mut rows = conn
            .query(
                &format!(
                    "SELECT {WATCH_COLUMNS} FROM watches WHERE account_email = ?1 AND active = 1"
                ),
                params![account_email],
            )
            .await?;

        match rows.next().await? {
            Some(row) => Ok(Some(row_to_watch(row)?)),
            None => Ok(None),
        }
    }

    /// Moves the cursor forward and optionally records the receipt time of
    /// the newest processed message.
    pub async fn advance(
        &self,
        watch_id: &str,
        cursor: &str,
        processed_at: Option<DateTime<Utc>>,
    ) -> Result<Watch, WatchError> {
        let now = now_rfc3339();
        let conn = self.db.connection().await?;
        let mut rows = conn
            .query(
                &format!(
                    "UPDATE watches
                     SET cursor = ?2,
                         last_processed_at = COALESCE(?3, last_processed_at),
                         updated_at = ?4
                     WHERE id = ?1
                     RETURNING {WATCH_COLUMNS}"
                ),
                params![watch_id, cursor, processed_at.map(to_rfc3339), now],
            )
            .await?;

        match rows.next().await? {
            Some(row) => row_to_watch(row),
            None => Err(WatchError::NotFound(watch_id.to_string())),
        }
    }

    pub async fn deactivate(&self, watch_id: &str) -> Result<(), WatchError> {
        let now = now_rfc3339();
        let conn = self.db.connection().await?;
        let mut rows = conn
            .query(
                "UPDATE watches SET active = 0, updated_at = ?2 WHERE id = ?1 RETURNING id",
                params![watch_id, now],
            )
            .await?;

        match rows.next().await? {
            Some(_) => Ok(()),
            None => Err(WatchError::NotFound(watch_id.to_string())),
        }
    }

    /// Deactivates every active watch whose expiry has passed, returning the
    /// rows that were flipped.
    pub async fn sweep_expired(&self, now: DateTime<Utc>) -> Result<Vec<Watch>, WatchError> {
        let now_str = to_rfc3339(now);
        let conn = self.db.connection().await?;
        let mut rows = conn
            .query(
                &format!(
                    "UPDATE watches
                     SET active = 0, updated_at = ?1
                     WHERE active = 1 AND expires_at <= ?1
                     RETURNING {WATCH_COLUMNS}"
                ),
                params![now_str],
            )
            .await?;

        let mut swept = Vec::new();
        while let Some(row) = rows.next().await? {
            swept.push(row_to_watch(row)?);
        }
        Ok(swept)
    }

    /// Active watches expiring before the given threshold, oldest first.
    pub async fn list_expiring(
        &self,
        before: DateTime<Utc>,
    ) -> Result<Vec<Watch>, WatchError> {
        let before_str = to_rfc3339(before);
        let conn = self.db.connection().await?;
        let mut rows = conn
            .query(
                &format!(
                    "SELECT {WATCH_COLUMNS} FROM watches
                     WHERE active = 1 AND expires_at <= ?1
                     ORDER BY expires_at"
                ),
                params![before_str],
            )
            .await?;

        let mut watches = Vec::new();
        while let Some(row) = rows.next().await? {
            watches.push(row_to_watch(row)?);
        }
        Ok(watches)
    }
}

fn now_rfc3339() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)
}

fn to_rfc3339(value: DateTime<Utc>) -> String {
    value.to_rfc3339_opts(SecondsFormat::Millis, true)
}

fn row_to_watch(row: Row) -> Result<Watch, WatchError> {
    let active: i64 = row.get(5)?;
    let expires_at: String = row.get(6)?;
    let last_processed_at: Option<String> = row.get(7)?;
    let created_at: String = row.get(8)?;
    let updated_at: String = row.get(9)?;

    Ok(Watch {
        id: row.get(0)?,
        user_id: row.get(1)?,
        account_email: row.get(2)?,
        cursor: row.get(3)?,
        topic: row.get(4)?,
        active: active != 0,
        expires_at: DateTime::parse_from_rfc3339(&expires_at)?.with_timezone(&Utc),
        last_processed_at: last_processed_at
            .map(|ts| DateTime::parse_from_rfc3339(&ts).map(|dt| dt.with_timezone(&Utc)))
            .transpose()?,
        created_at: DateTime::parse_from_rfc3339(&created_at)?.with_timezone(&Utc),
        updated_at: DateTime::parse_from_rfc3339(&updated_at)?.with_timezone(&Utc),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::migrations::run_migrations;
    use chrono::Duration;
    use tempfile::TempDir;

    async fn setup_repo() -> (WatchRepository, TempDir) {
        let dir = TempDir::new().expect("temp dir");
        let db_name = format!("db_{}.sqlite", uuid::Uuid::new_v4());
        let db_path = dir.path().join(db_name);
        let db = Database::new(&db_path).await.expect("create db");
        run_migrations(&db).await.expect("migrations");
        (WatchRepository::new(db), dir)
    }

    #[tokio::test]
    async fn upsert_creates_then_replaces_in_place() {
        let (repo, _dir) = setup_repo().await;
        let expires = Utc::now() + Duration::days(7);

        let first = repo
            .upsert("user-1", "a@example.com", "100", "projects/p/topics/mail", expires)
            .await
            .expect("create watch");
        assert!(first.active);
        assert_eq!(first.cursor, "100");
        assert!(first.last_processed_at.is_none());

        let processed = Utc::now();
        repo.advance(&first.id, "105", Some(processed))
            .await
            .expect("advance");

        let later = Utc::now() + Duration::days(7);
        let replaced = repo
            .upsert("user-1", "a@example.com", "200", "projects/p/topics/mail", later)
            .await
            .expect("replace watch");

        assert_eq!(replaced.id, first.id, "row is replaced in place");
        assert_eq!(replaced.cursor, "200");
        assert!(replaced.active);
        assert!(
            replaced.last_processed_at.is_some(),
            "processing floor survives replacement"
        );
    }

    #[tokio::test]
    async fn advance_moves_cursor_and_keeps_floor_when_no_processed_at() {
        let (repo, _dir) = setup_repo().await;
        let watch = repo
            .upsert(
                "user-1",
                "a@example.com",
                "100",
                "projects/p/topics/mail",
                Utc::now() + Duration::days(7),
            )
            .await
            .expect("create watch");

        let processed = Utc::now();
        let advanced = repo
            .advance(&watch.id, "105", Some(processed))
            .await
            .expect("advance with processed_at");
        assert_eq!(advanced.cursor, "105");
        assert!(advanced.last_processed_at.is_some());

        // Cursor-only advance must not clear the floor.
        let floor = advanced.last_processed_at;
        let advanced = repo
            .advance(&watch.id, "110", None)
            .await
            .expect("advance without processed_at");
        assert_eq!(advanced.cursor, "110");
        assert_eq!(advanced.last_processed_at, floor);
    }

    #[tokio::test]
    async fn get_active_by_email_ignores_inactive_rows() {
        let (repo, _dir) = setup_repo().await;
        let watch = repo
            .upsert(
                "user-1",
                "a@example.com",
                "100",
                "projects/p/topics/mail",
                Utc::now() + Duration::days(7),
            )
            .await
            .expect("create watch");

        let found = repo
            .get_active_by_email("a@example.com")
            .await
            .expect("lookup");
        assert_eq!(found.map(|w| w.id), Some(watch.id.clone()));

        repo.deactivate(&watch.id).await.expect("deactivate");

        let missing = repo
            .get_active_by_email("a@example.com")
            .await
            .expect("lookup after deactivate");
        assert!(missing.is_none());
    }

    #[tokio::test]
    async fn sweep_expired_flips_only_past_expiry() {
        let (repo, _dir) = setup_repo().await;
        let expired = repo
            .upsert(
                "user-1",
                "old@example.com",
                "100",
                "projects/p/topics/mail",
                Utc::now() - Duration::hours(1),
            )
            .await
            .expect("create expired watch");
        let live = repo
            .upsert(
                "user-1",
                "live@example.com",
                "200",
                "projects/p/topics/mail",
                Utc::now() + Duration::days(7),
            )
            .await
            .expect("create live watch");

        let swept = repo.sweep_expired(Utc::now()).await.expect("sweep");
        assert_eq!(swept.len(), 1);
        assert_eq!(swept[0].id, expired.id);
        assert!(!swept[0].active);

        let still_live = repo
            .get_active_by_email("live@example.com")
            .await
            .expect("lookup live");
        assert_eq!(still_live.map(|w| w.id), Some(live.id));

        let second = repo.sweep_expired(Utc::now()).await.expect("second sweep");
        assert!(second.is_empty(), "sweep is idempotent");
    }

    #[tokio::test]
    async fn list_expiring_orders_by_expiry() {
        let (repo, _dir) = setup_repo().await;
        repo.upsert(
            "user-1",
            "soon@example.com",
            "1",
            "projects/p/topics/mail",
            Utc::now() + Duration::hours(2),
        )
        .await
        .expect("soon watch");
        repo.upsert(
            "user-1",
            "later@example.com",
            "2",
            "projects/p/topics/mail",
            Utc::now() + Duration::hours(10),
        )
        .await
        .expect("later watch");
        repo.upsert(
            "user-1",
            "far@example.com",
            "3",
            "projects/p/topics/mail",
            Utc::now() + Duration::days(6),
        )
        .await
        .expect("far watch");

        let due = repo
            .list_expiring(Utc::now() + Duration::hours(12))
            .await
            .expect("list expiring");
        assert_eq!(due.len(), 2);
        assert_eq!(due[0].account_email, "soon@example.com");
        assert_eq!(due[1].account_email, "later@example.com");
    }

    #[tokio::test]
    async fn missing_watch_reports_not_found() {
        let (repo, _dir) = setup_repo().await;

        let err = repo
            .get("user-1", "absent@example.com")
            .await
            .expect_err("missing watch");
        assert!(matches!(err, WatchError::NotFound(_)));

        let err = repo
            .advance("missing-id", "5", None)
            .await
            .expect_err("advance missing");
        assert!(matches!(err, WatchError::NotFound(_)));
    }
}
