pub mod sync_mailbox;

use std::sync::Arc;

use async_trait::async_trait;
use reqwest::StatusCode;
use std::time::Duration;
use tracing::error;

use crate::accounts::{Account, AccountError, AccountRepository};
use crate::classify::Classifier;
use crate::config::SyncConfig;
use crate::db::Database;
use crate::gmail::oauth::TOKEN_ENDPOINT;
use crate::gmail::{GmailClient, GmailClientError, OAuthTokens, TokenStore};
use crate::publish::SYNC_MAILBOX_JOB;
use crate::queue::{Job, JobContext};
use crate::worker::{JobError, JobExecutor};

/// Persists refreshed tokens back to the owning account row, so a refresh
/// performed mid-job survives the process.
pub struct AccountTokenStore {
    accounts: AccountRepository,
    account_id: String,
}

impl AccountTokenStore {
    pub fn new(accounts: AccountRepository, account_id: impl Into<String>) -> Self {
        Self {
            accounts,
            account_id: account_id.into(),
        }
    }
}

#[async_trait]
impl TokenStore for AccountTokenStore {
    type Error = AccountError;

    async fn save_tokens(&self, tokens: &OAuthTokens) -> Result<(), Self::Error> {
        let account = self.accounts.get_by_id(&self.account_id).await?;
        let mut config = account.config;
        config.oauth = tokens.clone();
        self.accounts.update_config(&account.id, &config).await?;
        Ok(())
    }
}

/// Routes claimed jobs to their handlers. Holds everything a handler needs:
/// database handles, an HTTP client, the classifier, and sync tuning.
pub struct JobDispatcher {
    pub(crate) db: Database,
    pub(crate) http: reqwest::Client,
    pub(crate) classifier: Arc<dyn Classifier>,
    pub(crate) sync: SyncConfig,
    api_base: Option<String>,
    token_endpoint: Option<String>,
}

impl JobDispatcher {
    pub fn new(
        db: Database,
        http: reqwest::Client,
        classifier: Arc<dyn Classifier>,
        sync: SyncConfig,
    ) -> Self {
        Self {
            db,
            http,
            classifier,
            sync,
            api_base: None,
            token_endpoint: None,
        }
    }

    pub fn with_api_base(mut self, api_base: impl Into<String>) -> Self {
        self.api_base = Some(api_base.into());
        self
    }

    pub fn with_token_endpoint(mut self, token_endpoint: impl Into<String>) -> Self {
        self.token_endpoint = Some(token_endpoint.into());
        self
    }

    pub(crate) fn token_endpoint(&self) -> &str {
        self.token_endpoint.as_deref().unwrap_or(TOKEN_ENDPOINT)
    }

    pub(crate) fn build_client(
        &self,
        account: &Account,
        tokens: OAuthTokens,
    ) -> GmailClient<AccountTokenStore> {
        let store = AccountTokenStore::new(AccountRepository::new(self.db.clone()), &account.id);
        let mut client = GmailClient::new(
            self.http.clone(),
            "me",
            &account.config.client_id,
            &account.config.client_secret,
            tokens,
            Arc::new(store),
        );
        if let Some(api_base) = &self.api_base {
            client = client.with_api_base(api_base);
        }
        if let Some(endpoint) = &self.token_endpoint {
            client = client.with_token_endpoint(endpoint);
        }
        client
    }
}

#[async_trait]
impl JobExecutor for JobDispatcher {
    async fn execute(&self, job: Job, ctx: JobContext) -> Result<(), JobError> {
        match job.job_type.as_str() {
            SYNC_MAILBOX_JOB => sync_mailbox::run(self, job, ctx).await,
            other => {
                error!(job_type = %other, job_id = %job.id, "unknown job type");
                Err(JobError::Fatal(format!("unknown job type: {other}")))
            }
        }
    }
}

/// Token refresh failures and post-refresh 401s mean the grant is dead; the
/// watch must be deactivated before failing.
pub(crate) fn is_auth_error(err: &GmailClientError) -> bool {
    matches!(
        err,
        GmailClientError::Unauthorized | GmailClientError::OAuth(_)
    )
}

pub(crate) fn gmail_to_job_error(err: GmailClientError) -> JobError {
    match &err {
        GmailClientError::Http(e) => match e.status() {
            Some(StatusCode::TOO_MANY_REQUESTS) => {
                JobError::retryable_after(err.to_string(), Duration::from_secs(30))
            }
            Some(status) if status.is_server_error() => JobError::retryable(err.to_string()),
            Some(StatusCode::FORBIDDEN) => JobError::retryable(err.to_string()),
            Some(_) => JobError::Fatal(err.to_string()),
            // No status: connect or timeout.
            None => JobError::retryable(err.to_string()),
        },
        GmailClientError::Decode(_) | GmailClientError::TokenStore(_) => {
            JobError::retryable(err.to_string())
        }
        GmailClientError::Unauthorized | GmailClientError::OAuth(_) => {
            JobError::Fatal(err.to_string())
        }
    }
}
