use std::sync::Arc;

use chrono::{DateTime, Utc};
use reqwest::StatusCode;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::categories::{CategoryError, CategoryRepository};
use crate::classify::{CategoryChoice, Classification, Classifier, ClassifyInput, fallback_summary};
use crate::filter::{ReceiptFilter, receipt_time};
use crate::gmail::parser::parse_message;
use crate::gmail::types::Message;
use crate::gmail::{GmailClient, GmailClientError, TokenStore};
use crate::ledger::{ClaimOutcome, Ledger, LedgerError};
use crate::reconcile::CandidateTier;

#[derive(Debug, Error)]
pub enum ProcessorError {
    #[error("gmail error: {0}")]
    Gmail(#[from] GmailClientError),
    #[error("ledger error: {0}")]
    Ledger(#[from] LedgerError),
    #[error("category error: {0}")]
    Categories(#[from] CategoryError),
}

/// Outcome of one sync pass over a candidate set.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ProcessSummary {
    pub processed: u32,
    pub archived: u32,
    pub newest_receipt: Option<DateTime<Utc>>,
}

/// Runs the per-message pipeline: claim, fetch, filter, relocate spam,
/// classify, record, archive. Transient provider errors propagate so the
/// owning job can retry without advancing the cursor.
pub struct MessageProcessor {
    ledger: Ledger,
    categories: CategoryRepository,
    classifier: Arc<dyn Classifier>,
}

impl MessageProcessor {
    pub fn new(
        ledger: Ledger,
        categories: CategoryRepository,
        classifier: Arc<dyn Classifier>,
    ) -> Self {
        Self {
            ledger,
            categories,
            classifier,
        }
    }

    pub async fn process_candidates<S: TokenStore>(
        &self,
        client: &GmailClient<S>,
        user_id: &str,
        candidates: &[String],
        tier: CandidateTier,
        filter: &ReceiptFilter,
        cutoff: DateTime<Utc>,
    ) -> Result<ProcessSummary, ProcessorError> {
        let mut summary = ProcessSummary::default();

        for message_id in candidates {
            match self.ledger.try_claim(message_id, user_id).await? {
                ClaimOutcome::AlreadyProcessed(_) => {
                    debug!(message_id = %message_id, "already processed, skipping");
                    continue;
                }
                ClaimOutcome::OwnedByOtherUser { owner_user_id } => {
                    warn!(
                        message_id = %message_id,
                        owner_user_id = %owner_user_id,
                        user_id = %user_id,
                        "provider message id already claimed by another user, processing anyway"
                    );
                }
                ClaimOutcome::Claimed(_) | ClaimOutcome::RetryIncomplete(_) => {}
            }

            let message = match client.get_message(message_id).await {
                Ok(message) => message,
                Err(err) if is_not_found(&err) => {
                    // Deleted between notification and sync. Record it so the
                    // next pass does not fetch it again.
                    debug!(message_id = %message_id, "message gone, recording as processed");
                    self.ledger.mark_processed(message_id, None, false).await?;
                    summary.processed += 1;
                    continue;
                }
                Err(err) => return Err(err.into()),
            };

            let receipt = receipt_time(&message);
            if tier != CandidateTier::FullFallback {
                match receipt {
                    None => {
                        warn!(message_id = %message_id, "no trustworthy receipt time, excluding");
                        continue;
                    }
                    Some(receipt) if !filter.accepts(receipt, cutoff) => {
                        debug!(
                            message_id = %message_id,
                            receipt = %receipt,
                            cutoff = %cutoff,
                            "receipt before cutoff, excluding"
                        );
                        continue;
                    }
                    Some(_) => {}
                }
            }

            if message.label_ids.iter().any(|l| l == "SPAM") {
                if let Err(err) = client
                    .modify_message(message_id, vec!["INBOX".into()], vec!["SPAM".into()])
                    .await
                {
                    warn!(message_id = %message_id, error = %err, "spam relocation failed, continuing");
                }
            }

            let classification = self.classify(user_id, &message).await?;
            info!(
                message_id = %message_id,
                category = classification.category.as_deref().unwrap_or("(none)"),
                confidence = classification.confidence,
                summary = %classification.summary,
                "message classified"
            );

            self.ledger
                .mark_processed(message_id, classification.category.as_deref(), false)
                .await?;
            summary.processed += 1;
            if let Some(receipt) = receipt {
                summary.newest_receipt = Some(match summary.newest_receipt {
                    Some(existing) => existing.max(receipt),
                    None => receipt,
                });
            }

            match client
                .modify_message(message_id, vec![], vec!["INBOX".into()])
                .await
            {
                Ok(_) => {
                    self.ledger
                        .mark_processed(message_id, classification.category.as_deref(), true)
                        .await?;
                    summary.archived += 1;
                }
                Err(err) => {
                    warn!(message_id = %message_id, error = %err, "archive failed, message stays in inbox");
                }
            }
        }

        Ok(summary)
    }

    /// Classification can fail or the user may have no categories; either way
    /// a synthesized summary is produced so storage never blocks.
    async fn classify(
        &self,
        user_id: &str,
        message: &Message,
    ) -> Result<Classification, ProcessorError> {
        let parsed = parse_message(message);
        let content = parsed.content_text();
        let categories = self.categories.list_by_user(user_id).await?;

        if categories.is_empty() {
            return Ok(Classification {
                category: None,
                summary: fallback_summary(parsed.subject.as_deref(), content.as_deref()),
                confidence: 0.0,
            });
        }

        let input = ClassifyInput {
            subject: parsed.subject.clone(),
            sender: parsed.from_email.clone(),
            body: content.clone(),
            categories: categories
                .into_iter()
                .map(|c| CategoryChoice {
                    name: c.name,
                    description: c.description,
                })
                .collect(),
        };

        match self.classifier.classify(&input).await {
            Ok(classification) => Ok(classification),
            Err(err) => {
                warn!(message_id = %message.id, error = %err, "classifier failed, using fallback summary");
                Ok(Classification {
                    category: None,
                    summary: fallback_summary(parsed.subject.as_deref(), content.as_deref()),
                    confidence: 0.0,
                })
            }
        }
    }
}

fn is_not_found(err: &GmailClientError) -> bool {
    matches!(err, GmailClientError::Http(e) if e.status() == Some(StatusCode::NOT_FOUND))
}
