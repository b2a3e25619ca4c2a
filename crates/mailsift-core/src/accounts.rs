use chrono::{DateTime, Duration, SecondsFormat, Utc};
use libsql::{Row, params};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::db::{Database, DbError};
use crate::gmail::oauth::{
    OAuthError, OAuthTokens, TOKEN_ENDPOINT, refresh_access_token_with_endpoint,
};

const ACCOUNT_COLUMNS: &str = "id, user_id, email, config_json, created_at, updated_at";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AccountConfig {
    pub client_id: String,
    pub client_secret: String,
    pub oauth: OAuthTokens,
}

/// A connected Gmail mailbox owned by a user.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Account {
    pub id: String,
    pub user_id: String,
    pub email: String,
    pub config: AccountConfig,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Error)]
pub enum AccountError {
    #[error("database error: {0}")]
    Database(#[from] DbError),
    #[error("sql error: {0}")]
    Sql(#[from] libsql::Error),
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("datetime parse error: {0}")]
    DateTimeParse(#[from] chrono::ParseError),
    #[error("account not found: {0}")]
    NotFound(String),
    #[error("optimistic locking conflict for account {0}")]
    Conflict(String),
    #[error("oauth error: {0}")]
    OAuth(#[from] OAuthError),
}

#[derive(Clone)]
pub struct AccountRepository {
    db: Database,
}

impl AccountRepository {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    pub async fn create(
        &self,
        user_id: impl Into<String>,
        email: impl Into<String>,
        config: AccountConfig,
    ) -> Result<Account, AccountError> {
        let id = Uuid::new_v4().to_string();
        let now = now_rfc3339();
        let config_json = serde_json::to_string(&config)?;

        let conn = self.db.connection().await?;
        let mut rows = conn
            .query(
                &format!(
                    "INSERT INTO accounts (id, user_id, email, config_json, created_at, updated_at)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?5)
                     RETURNING {ACCOUNT_COLUMNS}"
                ),
                params![id, user_id.into(), email.into(), config_json, now],
            )
            .await?;

        let row = rows
            .next()
            .await?
            .ok_or_else(|| AccountError::NotFound("insert failed".into()))?;
        row_to_account(row)
    }

    pub async fn get_by_id(&self, id: &str) -> Result<Account, AccountError> {
        let conn = self.db.connection().await?;
        let mut rows = conn
            .query(
                &format!("SELECT {ACCOUNT_COLUMNS} FROM accounts WHERE id = ?1"),
                params![id],
            )
            .await?;

        match rows.next().await? {
            Some(row) => row_to_account(row),
            None => Err(AccountError::NotFound(id.to_string())),
        }
    }

    pub async fn get_by_email(&self, email: &str) -> Result<Account, AccountError> {
        let conn = self.db.connection().await?;
        let mut rows = conn
            .query(
                &format!("SELECT {ACCOUNT_COLUMNS} FROM accounts WHERE email = ?1"),
                params![email],
            )
            .await?;

        match rows.next().await? {
            Some(row) => row_to_account(row),
            None => Err(AccountError::NotFound(email.to_string())),
        }
    }

    pub async fn list_by_user(&self, user_id: &str) -> Result<Vec<Account>, AccountError> {
        let conn = self.db.connection().await?;
        let mut rows = conn
            .query(
                &format!(
                    "SELECT {ACCOUNT_COLUMNS} FROM accounts WHERE user_id = ?1 ORDER BY created_at"
                ),
                params![user_id],
            )
            .await?;

        let mut accounts = Vec::new();
        while let Some(row) = rows.next().await? {
            accounts.push(row_to_account(row)?);
        }
        Ok(accounts)
    }

    pub async fn update_config(
        &self,
        id: &str,
        config: &AccountConfig,
    ) -> Result<Account, AccountError> {
        self.update_config_with_expected(id, config, None).await
    }

    pub async fn delete(&self, id: &str) -> Result<(), AccountError> {
        let conn = self.db.connection().await?;
        let mut rows = conn
            .query(
                "DELETE FROM accounts WHERE id = ?1 RETURNING id",
                params![id],
            )
            .await?;

        match rows.next().await? {
            Some(_) => Ok(()),
            None => Err(AccountError::NotFound(id.to_string())),
        }
    }

    /// Returns tokens that are strictly valid at the time of the call. A token
    /// whose expiry equals the current instant is treated as expired and
    /// refreshed before being handed out.
    pub async fn valid_tokens(
        &self,
        account_id: &str,
        http: &reqwest::Client,
    ) -> Result<OAuthTokens, AccountError> {
        self.valid_tokens_with_endpoint(account_id, http, TOKEN_ENDPOINT)
            .await
    }

    pub async fn valid_tokens_with_endpoint(
        &self,
        account_id: &str,
        http: &reqwest::Client,
        endpoint: &str,
    ) -> Result<OAuthTokens, AccountError> {
        let account = self.get_by_id(account_id).await?;
        let account = self
            .refresh_tokens_for_account_with_endpoint(account, http, Duration::zero(), endpoint)
            .await?;
        Ok(account.config.oauth)
    }

    pub async fn refresh_tokens_if_needed_with_endpoint(
        &self,
        account_id: &str,
        http: &reqwest::Client,
        buffer: Duration,
        endpoint: &str,
    ) -> Result<Account, AccountError> {
        let account = self.get_by_id(account_id).await?;
        self.refresh_tokens_for_account_with_endpoint(account, http, buffer, endpoint)
            .await
    }

    pub async fn refresh_tokens_for_account_with_endpoint(
        &self,
        account: Account,
        http: &reqwest::Client,
        buffer: Duration,
        endpoint: &str,
    ) -> Result<Account, AccountError> {
        if !account.config.oauth.needs_refresh(Utc::now(), buffer) {
            return Ok(account);
        }

        // Surface the missing grant before touching the network so callers
        // can treat it as a terminal auth failure.
        if account.config.oauth.refresh_token.is_empty() {
            return Err(AccountError::OAuth(OAuthError::MissingRefreshToken));
        }

        let refreshed = refresh_access_token_with_endpoint(
            http,
            &account.config.client_id,
            &account.config.client_secret,
            &account.config.oauth,
            endpoint,
        )
        .await?;

        let mut new_config = account.config.clone();
        new_config.oauth = refreshed;

        self.update_config_with_expected(&account.id, &new_config, Some(account.updated_at))
            .await
    }

    async fn update_config_with_expected(
        &self,
        id: &str,
        config: &AccountConfig,
        expected_updated_at: Option<DateTime<Utc>>,
    ) -> Result<Account, AccountError> {
        let now = now_rfc3339();
        let config_json = serde_json::to_string(config)?;
        let conn = self.db.connection().await?;

        let mut rows = if let Some(expected) = expected_updated_at {
            let expected_str = to_rfc3339(expected);
            conn.query(
                &format!(
                    "UPDATE accounts
                     SET config_json = ?1, updated_at = ?2
                     WHERE id = ?3 AND updated_at = ?4
                     RETURNING {ACCOUNT_COLUMNS}"
                ),
                params![config_json, now, id, expected_str],
            )
            .await?
        } else {
            conn.query(
                &format!(
                    "UPDATE accounts
                     SET config_json = ?1, updated_at = ?2
                     WHERE id = ?3
                     RETURNING {ACCOUNT_COLUMNS}"
                ),
                params![config_json, now, id],
            )
            .await?
        };

        match rows.next().await? {
            Some(row) => row_to_account(row),
            None => match expected_updated_at {
                Some(_) => Err(AccountError::Conflict(id.to_string())),
                None => Err(AccountError::NotFound(id.to_string())),
            },
        }
    }
}

fn now_rfc3339() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)
}

fn to_rfc3339(value: DateTime<Utc>) -> String {
    value.to_rfc3339_opts(SecondsFormat::Millis, true)
}

fn row_to_account(row: Row) -> Result<Account, AccountError> {
    let config_json: String = row.get(3)?;
    let created_at: String = row.get(4)?;
    let updated_at: String = row.get(5)?;

    Ok(Account {
        id: row.get(0)?,
        user_id: row.get(1)?,
        email: row.get(2)?,
        config: serde_json::from_str(&config_json)?,
        created_at: DateTime::parse_from_rfc3339(&created_at)?.with_timezone(&Utc),
        updated_at: DateTime::parse_from_rfc3339(&updated_at)?.with_timezone(&Utc),
    })
}
