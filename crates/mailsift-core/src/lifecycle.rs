use chrono::{DateTime, Utc};
use thiserror::Error;
use tracing::{info, warn};

use crate::accounts::{AccountError, AccountRepository};
use crate::gmail::types::WatchRequest;
use crate::gmail::{GmailClient, GmailClientError, TokenStore};
use crate::watches::{Watch, WatchError, WatchRepository};

#[derive(Debug, Error)]
pub enum LifecycleError {
    #[error("gmail error: {0}")]
    Gmail(#[from] GmailClientError),
    #[error("watch error: {0}")]
    Watch(#[from] WatchError),
    #[error("account error: {0}")]
    Account(#[from] AccountError),
    #[error("profile email {actual} does not match requested mailbox {expected}")]
    ProfileMismatch { expected: String, actual: String },
    #[error("invalid watch expiration: {0}")]
    InvalidExpiration(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SetupOutcome {
    /// A new registration was made with the provider.
    Created(Watch),
    /// An active, unexpired watch already covers this mailbox. No provider
    /// call was made.
    AlreadyActive(Watch),
}

/// Registers, renews, and tears down provider push watches, keeping the
/// watches table in step with what the provider believes.
pub struct WatchLifecycle {
    watches: WatchRepository,
    accounts: AccountRepository,
}

impl WatchLifecycle {
    pub fn new(watches: WatchRepository, accounts: AccountRepository) -> Self {
        Self { watches, accounts }
    }

    pub fn watches(&self) -> &WatchRepository {
        &self.watches
    }

    pub async fn setup<S: TokenStore>(
        &self,
        client: &GmailClient<S>,
        user_id: &str,
        account_email: &str,
        topic: &str,
    ) -> Result<SetupOutcome, LifecycleError> {
        match self.watches.get(user_id, account_email).await {
            Ok(existing) if existing.active && existing.expires_at > Utc::now() => {
                return Ok(SetupOutcome::AlreadyActive(existing));
            }
            Ok(_) | Err(WatchError::NotFound(_)) => {}
            Err(err) => return Err(err.into()),
        }

        let profile = client.get_profile().await?;
        if !profile.email_address.eq_ignore_ascii_case(account_email) {
            return Err(LifecycleError::ProfileMismatch {
                expected: account_email.to_string(),
                actual: profile.email_address,
            });
        }

        let watch = self.register(client, user_id, account_email, topic).await?;
        Ok(SetupOutcome::Created(watch))
    }

    /// Re-registers an existing watch regardless of its current expiry. The
    /// upsert keeps `last_processed_at`, so renewal never widens the
    /// processing window.
    pub async fn renew<S: TokenStore>(
        &self,
        client: &GmailClient<S>,
        watch: &Watch,
    ) -> Result<Watch, LifecycleError> {
        self.register(client, &watch.user_id, &watch.account_email, &watch.topic)
            .await
    }

    async fn register<S: TokenStore>(
        &self,
        client: &GmailClient<S>,
        user_id: &str,
        account_email: &str,
        topic: &str,
    ) -> Result<Watch, LifecycleError> {
        let response = client
            .watch(&WatchRequest {
                topic_name: topic.to_string(),
                label_ids: vec![],
                label_filter_behavior: None,
            })
            .await?;

        let expires_at = parse_expiration(&response.expiration)?;
        let watch = self
            .watches
            .upsert(
                user_id,
                account_email,
                &response.history_id,
                topic,
                expires_at,
            )
            .await?;

        info!(
            account = %account_email,
            cursor = %watch.cursor,
            expires_at = %watch.expires_at,
            "watch registered"
        );
        Ok(watch)
    }

    /// Marks watches past their provider expiry as inactive. Pure bookkeeping,
    /// no provider calls; run from a periodic sweep.
    pub async fn sweep_expired(&self, now: DateTime<Utc>) -> Result<Vec<Watch>, LifecycleError> {
        let swept = self.watches.sweep_expired(now).await?;
        for watch in &swept {
            info!(account = %watch.account_email, "watch expired, marked inactive");
        }
        Ok(swept)
    }

    /// Watches whose expiry falls within the lead window, for renewal.
    pub async fn list_due_for_renewal(
        &self,
        now: DateTime<Utc>,
        lead: chrono::Duration,
    ) -> Result<Vec<Watch>, LifecycleError> {
        Ok(self.watches.list_expiring(now + lead).await?)
    }

    /// Disconnects a mailbox. Stopping the provider watch is best-effort; the
    /// row is deactivated and the credential record deleted even when the
    /// provider call fails.
    pub async fn teardown<S: TokenStore>(
        &self,
        client: &GmailClient<S>,
        watch: &Watch,
        account_id: &str,
    ) -> Result<(), LifecycleError> {
        if let Err(err) = client.stop_watch().await {
            warn!(
                account = %watch.account_email,
                error = %err,
                "stop watch failed, proceeding with local teardown"
            );
        }

        self.watches.deactivate(&watch.id).await?;
        self.accounts.delete(account_id).await?;
        info!(account = %watch.account_email, "mailbox disconnected");
        Ok(())
    }
}

fn parse_expiration(expiration: &str) -> Result<DateTime<Utc>, LifecycleError> {
    let millis: i64 = expiration
        .parse()
        .map_err(|_| LifecycleError::InvalidExpiration(expiration.to_string()))?;
    DateTime::from_timestamp_millis(millis)
        .ok_or_else(|| LifecycleError::InvalidExpiration(expiration.to_string()))
}
