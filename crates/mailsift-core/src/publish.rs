use base64::Engine;
use base64::engine::general_purpose::{STANDARD, URL_SAFE_NO_PAD};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

use crate::queue::{JobQueue, QueueError};

pub const SYNC_MAILBOX_JOB: &str = "sync.mailbox";

/// Pub/Sub push delivery wrapper.
#[derive(Debug, Clone, Deserialize)]
pub struct PushEnvelope {
    pub message: PushMessage,
    pub subscription: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PushMessage {
    pub data: Option<String>,
    #[serde(rename = "messageId")]
    pub message_id: Option<String>,
    #[serde(rename = "publishTime")]
    pub publish_time: Option<String>,
}

/// Decoded Gmail push notification: which mailbox changed and the history
/// position it changed at.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MailboxNotification {
    pub email_address: String,
    pub history_id: String,
}

#[derive(Debug, Error)]
pub enum NotificationError {
    #[error("notification has no data field")]
    MissingData,
    #[error("invalid base64 payload: {0}")]
    Base64(#[from] base64::DecodeError),
    #[error("invalid notification json: {0}")]
    Json(#[from] serde_json::Error),
}

#[derive(Debug, Deserialize)]
struct RawNotification {
    #[serde(rename = "emailAddress")]
    email_address: String,
    #[serde(rename = "historyId")]
    history_id: HistoryIdValue,
}

/// Gmail has sent historyId both as a JSON number and as a string.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum HistoryIdValue {
    Number(u64),
    Text(String),
}

impl HistoryIdValue {
    fn into_string(self) -> String {
        match self {
            HistoryIdValue::Number(n) => n.to_string(),
            HistoryIdValue::Text(s) => s,
        }
    }
}

/// Decodes the base64 payload of a push envelope. Pub/Sub emits standard
/// base64 but some relays re-encode url-safe, so both alphabets are accepted.
pub fn decode_notification(envelope: &PushEnvelope) -> Result<MailboxNotification, NotificationError> {
    let data = envelope
        .message
        .data
        .as_deref()
        .ok_or(NotificationError::MissingData)?;

    let bytes = URL_SAFE_NO_PAD
        .decode(data)
        .or_else(|_| STANDARD.decode(data))?;
    let raw: RawNotification = serde_json::from_slice(&bytes)?;

    Ok(MailboxNotification {
        email_address: raw.email_address,
        history_id: raw.history_id.into_string(),
    })
}

/// Payload of a `sync.mailbox` job. Credentials are re-read from the account
/// row at execution time, so only identifiers travel in the payload.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SyncJobPayload {
    pub email: String,
    pub history_id: String,
    pub user_id: String,
    pub account_id: String,
}

impl SyncJobPayload {
    /// Two notifications for the same mailbox at the same history position
    /// collapse into one job.
    pub fn idempotency_key(&self) -> String {
        format!("{}:{}:{}", SYNC_MAILBOX_JOB, self.email, self.history_id)
    }
}

/// Enqueues a sync job for a notification. An already-enqueued duplicate is
/// success: the existing job id is returned.
pub async fn publish_sync_job(
    queue: &JobQueue,
    payload: &SyncJobPayload,
) -> Result<String, QueueError> {
    let key = payload.idempotency_key();
    let body = serde_json::to_value(payload)?;

    match queue.enqueue(SYNC_MAILBOX_JOB, body, Some(key.clone()), 0).await {
        Ok(job_id) => Ok(job_id),
        Err(QueueError::DuplicateIdempotency {
            existing_job_id: Some(existing),
            ..
        }) => {
            debug!(idempotency_key = %key, job_id = %existing, "sync job already enqueued");
            Ok(existing)
        }
        Err(err) => Err(err),
    }
}
