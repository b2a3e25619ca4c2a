use std::collections::HashSet;

use tracing::{debug, warn};

use crate::config::SyncConfig;
use crate::gmail::{GmailClient, GmailClientError, TokenStore};

/// How the candidate set was obtained. Downstream filtering depends on this:
/// every tier except `FullFallback` goes through the receipt-time filter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CandidateTier {
    /// Incremental history from the stored cursor.
    History,
    /// Stored cursor was stale; history replayed from the announced cursor.
    AnnouncedHistory,
    /// Both cursors failed; recent messages found by search query.
    HistoryUnavailable,
    /// Even the search came back empty; most-recent messages, unscoped.
    FullFallback,
}

/// Finds message ids a sync pass should consider, degrading through four
/// tiers as history becomes less trustworthy.
pub async fn find_candidates<S: TokenStore>(
    client: &GmailClient<S>,
    stored_cursor: Option<&str>,
    announced_cursor: &str,
    cfg: &SyncConfig,
) -> Result<(Vec<String>, CandidateTier), GmailClientError> {
    if let Some(cursor) = stored_cursor {
        match collect_history(client, cursor).await {
            Ok(ids) => return Ok((ids, CandidateTier::History)),
            Err(err) if is_history_unavailable(&err) => {
                debug!(cursor = %cursor, "stored history cursor rejected, retrying from announced cursor");
            }
            Err(err) => return Err(err),
        }
    }

    match collect_history(client, announced_cursor).await {
        Ok(ids) => return Ok((ids, CandidateTier::AnnouncedHistory)),
        Err(err) if is_history_unavailable(&err) => {
            debug!(cursor = %announced_cursor, "announced history cursor rejected, falling back to search");
        }
        Err(err) => return Err(err),
    }

    let query = format!("{} (in:inbox OR in:spam)", cfg.recency_query);
    let recent = collect_message_list(client, Some(&query), None).await?;
    if !recent.is_empty() {
        return Ok((recent, CandidateTier::HistoryUnavailable));
    }

    warn!(
        target: "mailsift::full_fallback",
        max_results = cfg.fallback_max_results,
        "history and recency search both empty, scanning most recent messages unfiltered"
    );
    let response = client
        .list_messages(None, None, true, Some(cfg.fallback_max_results))
        .await?;
    let ids = dedup(response.messages.into_iter().map(|m| m.id));
    Ok((ids, CandidateTier::FullFallback))
}

/// Paginates history for new messages. INBOX first; a mailbox whose new mail
/// all landed in spam would look empty under the INBOX scope, so an empty
/// result triggers a second pass scoped to SPAM.
async fn collect_history<S: TokenStore>(
    client: &GmailClient<S>,
    cursor: &str,
) -> Result<Vec<String>, GmailClientError> {
    let mut ids = collect_history_scope(client, cursor, "INBOX").await?;
    if ids.is_empty() {
        ids = collect_history_scope(client, cursor, "SPAM").await?;
    }
    Ok(ids)
}

async fn collect_history_scope<S: TokenStore>(
    client: &GmailClient<S>,
    cursor: &str,
    label_id: &str,
) -> Result<Vec<String>, GmailClientError> {
    let mut ids = Vec::new();
    let mut page_token: Option<String> = None;

    loop {
        let response = client
            .list_history(cursor, Some(label_id), page_token.as_deref(), None)
            .await?;

        for record in response.history {
            for added in record.messages_added.unwrap_or_default() {
                ids.push(added.message.id);
            }
        }

        match response.next_page_token {
            Some(token) => page_token = Some(token),
            None => break,
        }
    }

    Ok(dedup(ids.into_iter()))
}

async fn collect_message_list<S: TokenStore>(
    client: &GmailClient<S>,
    query: Option<&str>,
    max_results: Option<u32>,
) -> Result<Vec<String>, GmailClientError> {
    let mut ids = Vec::new();
    let mut page_token: Option<String> = None;

    loop {
        let response = client
            .list_messages(query, page_token.as_deref(), true, max_results)
            .await?;
        ids.extend(response.messages.into_iter().map(|m| m.id));

        match response.next_page_token {
            Some(token) => page_token = Some(token),
            None => break,
        }
    }

    Ok(dedup(ids.into_iter()))
}

/// Gmail reports a stale or unknown startHistoryId as 404.
fn is_history_unavailable(err: &GmailClientError) -> bool {
    match err {
        GmailClientError::Http(e) => {
            e.status() == Some(reqwest::StatusCode::NOT_FOUND)
                || e.status() == Some(reqwest::StatusCode::BAD_REQUEST)
        }
        _ => false,
    }
}

fn dedup(ids: impl Iterator<Item = String>) -> Vec<String> {
    let mut seen = HashSet::new();
    ids.filter(|id| seen.insert(id.clone())).collect()
}
