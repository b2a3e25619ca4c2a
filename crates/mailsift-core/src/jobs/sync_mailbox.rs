use std::time::Duration;

use chrono::Utc;
use tracing::{debug, info, warn};

use crate::accounts::{AccountError, AccountRepository};
use crate::categories::CategoryRepository;
use crate::filter::ReceiptFilter;
use crate::jobs::{JobDispatcher, gmail_to_job_error, is_auth_error};
use crate::ledger::Ledger;
use crate::processor::{MessageProcessor, ProcessSummary, ProcessorError};
use crate::publish::SyncJobPayload;
use crate::queue::{Job, JobContext};
use crate::reconcile::{CandidateTier, find_candidates};
use crate::watches::{WatchError, WatchRepository};
use crate::worker::JobError;

/// One notification-driven sync pass over a mailbox. Every invocation is
/// treated as possibly-a-retry: credentials are re-read from the account row
/// and the ledger makes per-message work idempotent.
pub async fn run(dispatcher: &JobDispatcher, job: Job, _ctx: JobContext) -> Result<(), JobError> {
    let payload: SyncJobPayload = serde_json::from_value(job.payload)
        .map_err(|err| JobError::Fatal(format!("invalid sync payload: {err}")))?;

    let watches = WatchRepository::new(dispatcher.db.clone());
    let accounts = AccountRepository::new(dispatcher.db.clone());

    let watch = match watches.get(&payload.user_id, &payload.email).await {
        Ok(watch) => watch,
        Err(WatchError::NotFound(_)) => {
            info!(email = %payload.email, "no watch for mailbox, nothing to sync");
            return Ok(());
        }
        Err(err) => return Err(JobError::retryable(err.to_string())),
    };

    if !watch.active {
        info!(email = %payload.email, "watch inactive, nothing to sync");
        return Ok(());
    }

    if watch.cursor == payload.history_id {
        debug!(
            email = %payload.email,
            cursor = %watch.cursor,
            "cursor already at announced position"
        );
        return Ok(());
    }

    let account = accounts
        .get_by_id(&payload.account_id)
        .await
        .map_err(|err| match err {
            AccountError::NotFound(_) => JobError::Fatal(err.to_string()),
            other => JobError::retryable(other.to_string()),
        })?;

    let tokens = match accounts
        .valid_tokens_with_endpoint(&account.id, &dispatcher.http, dispatcher.token_endpoint())
        .await
    {
        Ok(tokens) => tokens,
        Err(err @ AccountError::OAuth(_)) => {
            warn!(
                email = %payload.email,
                error = %err,
                "credentials no longer refresh, deactivating watch"
            );
            watches
                .deactivate(&watch.id)
                .await
                .map_err(|e| JobError::retryable(e.to_string()))?;
            return Err(JobError::Fatal(err.to_string()));
        }
        Err(err) => return Err(JobError::retryable(err.to_string())),
    };

    let client = dispatcher.build_client(&account, tokens);
    let processor = MessageProcessor::new(
        Ledger::new(dispatcher.db.clone()),
        CategoryRepository::new(dispatcher.db.clone()),
        dispatcher.classifier.clone(),
    );
    let filter = ReceiptFilter::from_config(&dispatcher.sync);
    let now = Utc::now();
    let cutoff = filter.cutoff(now, watch.last_processed_at);

    let deadline = Duration::from_secs(dispatcher.sync.job_deadline_secs);
    let pass = tokio::time::timeout(deadline, async {
        let (candidates, tier) = find_candidates(
            &client,
            Some(&watch.cursor),
            &payload.history_id,
            &dispatcher.sync,
        )
        .await
        .map_err(ProcessorError::Gmail)?;

        processor
            .process_candidates(&client, &payload.user_id, &candidates, tier, &filter, cutoff)
            .await
            .map(|summary| (summary, tier))
    })
    .await;

    let (summary, tier) = match pass {
        Ok(Ok(result)) => result,
        Ok(Err(err)) => return Err(handle_pipeline_error(&watches, &watch.id, err).await),
        // Ledger progress is already durable; the retry resumes from the same
        // cursor and skips processed messages.
        Err(_elapsed) => {
            warn!(email = %payload.email, "sync deadline exceeded, will retry");
            return Err(JobError::retryable("sync deadline exceeded"));
        }
    };

    let processed_at = if summary.processed > 0 {
        Some(summary.newest_receipt.unwrap_or(now))
    } else {
        None
    };
    watches
        .advance(&watch.id, &payload.history_id, processed_at)
        .await
        .map_err(|err| JobError::retryable(err.to_string()))?;

    log_pass(&payload, &summary, tier);
    Ok(())
}

fn log_pass(payload: &SyncJobPayload, summary: &ProcessSummary, tier: CandidateTier) {
    info!(
        email = %payload.email,
        history_id = %payload.history_id,
        tier = ?tier,
        processed = summary.processed,
        archived = summary.archived,
        "sync pass complete"
    );
}

async fn handle_pipeline_error(
    watches: &WatchRepository,
    watch_id: &str,
    err: ProcessorError,
) -> JobError {
    match err {
        ProcessorError::Gmail(gmail_err) if is_auth_error(&gmail_err) => {
            warn!(error = %gmail_err, "authorization lost mid-sync, deactivating watch");
            if let Err(e) = watches.deactivate(watch_id).await {
                warn!(error = %e, "failed to deactivate watch after auth error");
            }
            JobError::Fatal(gmail_err.to_string())
        }
        ProcessorError::Gmail(gmail_err) => gmail_to_job_error(gmail_err),
        other => JobError::retryable(other.to_string()),
    }
}
