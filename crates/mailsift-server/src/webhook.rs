//! Pub/Sub push endpoint for Gmail notifications.
//!
//! The endpoint always acks with 200: a non-2xx response makes Pub/Sub
//! redeliver, and every failure here is either junk input (redelivery cannot
//! fix it) or something the next accepted notification reconciles anyway.

use std::sync::Arc;

use axum::{Router, body::Bytes, extract::State, http::StatusCode, routing::post};
use chrono::Utc;
use tracing::{debug, error, info, warn};

use mailsift_core::accounts::AccountRepository;
use mailsift_core::gmail::{GmailClient, NoopTokenStore};
use mailsift_core::throttle::NotificationThrottle;
use mailsift_core::watches::WatchRepository;
use mailsift_core::{
    MailboxNotification, PushEnvelope, SyncJobPayload, decode_notification, publish_sync_job,
};

use crate::AppState;

pub fn router() -> Router<AppState> {
    Router::new().route("/notifications/gmail", post(receive_notification))
}

/// POST /notifications/gmail
///
/// The body is parsed by hand so a malformed envelope can still be acked
/// instead of bouncing through axum's 400 rejection.
async fn receive_notification(State(state): State<AppState>, body: Bytes) -> StatusCode {
    let envelope: PushEnvelope = match serde_json::from_slice(&body) {
        Ok(envelope) => envelope,
        Err(err) => {
            warn!(error = %err, "dropping malformed push envelope");
            return StatusCode::OK;
        }
    };

    let notification = match decode_notification(&envelope) {
        Ok(notification) => notification,
        Err(err) => {
            warn!(error = %err, "dropping undecodable notification");
            return StatusCode::OK;
        }
    };

    if !state
        .throttle
        .admit(&notification.email_address, Utc::now())
    {
        debug!(email = %notification.email_address, "notification throttled");
        return StatusCode::OK;
    }

    if let Err(err) = handle_notification(&state, &notification).await {
        error!(
            email = %notification.email_address,
            error = %err,
            "notification handling failed"
        );
    }

    StatusCode::OK
}

async fn handle_notification(
    state: &AppState,
    notification: &MailboxNotification,
) -> Result<(), Box<dyn std::error::Error>> {
    let watches = WatchRepository::new(state.db.clone());
    let watch = match watches
        .get_active_by_email(&notification.email_address)
        .await?
    {
        Some(watch) => watch,
        None => {
            debug!(email = %notification.email_address, "no active watch, dropping notification");
            return Ok(());
        }
    };

    if watch.cursor == notification.history_id {
        debug!(
            email = %notification.email_address,
            cursor = %watch.cursor,
            "cursor already at announced position, dropping notification"
        );
        return Ok(());
    }

    let Some(account_id) = resolve_account(state, &watch.user_id, &notification.email_address).await
    else {
        warn!(
            email = %notification.email_address,
            user_id = %watch.user_id,
            "no account resolves to notified mailbox, dropping notification"
        );
        return Ok(());
    };

    let payload = SyncJobPayload {
        email: notification.email_address.clone(),
        history_id: notification.history_id.clone(),
        user_id: watch.user_id.clone(),
        account_id,
    };
    let job_id = publish_sync_job(&state.queue, &payload).await?;
    info!(
        email = %notification.email_address,
        history_id = %notification.history_id,
        job_id = %job_id,
        "sync job published"
    );
    Ok(())
}

/// The watch row does not record which credential serves the mailbox, so each
/// of the owning user's accounts is asked for its profile until the address
/// matches.
async fn resolve_account(state: &AppState, user_id: &str, email: &str) -> Option<String> {
    let accounts = AccountRepository::new(state.db.clone());
    let candidates = match accounts.list_by_user(user_id).await {
        Ok(candidates) => candidates,
        Err(err) => {
            error!(user_id = %user_id, error = %err, "account lookup failed");
            return None;
        }
    };

    for account in candidates {
        let tokens = match accounts
            .valid_tokens_with_endpoint(&account.id, &state.http, state.token_endpoint())
            .await
        {
            Ok(tokens) => tokens,
            Err(err) => {
                warn!(account_id = %account.id, error = %err, "skipping account, tokens unavailable");
                continue;
            }
        };

        let mut client = GmailClient::new(
            state.http.clone(),
            "me",
            &account.config.client_id,
            &account.config.client_secret,
            tokens,
            Arc::new(NoopTokenStore),
        );
        if let Some(api_base) = &state.gmail_api_base {
            client = client.with_api_base(api_base);
        }

        match client.get_profile().await {
            Ok(profile) if profile.email_address.eq_ignore_ascii_case(email) => {
                return Some(account.id);
            }
            Ok(_) => continue,
            Err(err) => {
                warn!(account_id = %account.id, error = %err, "profile lookup failed, skipping account");
            }
        }
    }

    None
}
