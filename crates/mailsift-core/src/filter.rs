use chrono::{DateTime, Duration, Utc};
use regex::Regex;
use std::sync::OnceLock;
use tracing::warn;

use crate::config::SyncConfig;
use crate::gmail::parser::{header_value, header_values};
use crate::gmail::types::Message;

/// When a message was received, resolved from the most trustworthy source
/// available: the provider's internalDate, then the RFC2822 Date header, then
/// the date stamped on the final Received hop. None means no source could be
/// trusted; callers must treat that as "too old" and exclude the message.
pub fn receipt_time(message: &Message) -> Option<DateTime<Utc>> {
    if let Some(internal) = message.internal_date.as_deref() {
        if let Some(ts) = parse_internal_date(internal) {
            return Some(ts);
        }
        warn!(message_id = %message.id, internal_date = %internal, "unparseable internalDate");
    }

    if let Some(date) = header_value(message, "Date") {
        if let Some(ts) = parse_rfc2822(&date) {
            return Some(ts);
        }
        warn!(message_id = %message.id, date_header = %date, "unparseable Date header");
    }

    let received = header_values(message, "Received");
    if let Some(top) = received.first() {
        if let Some(ts) = parse_received(top) {
            return Some(ts);
        }
        warn!(message_id = %message.id, "unparseable Received header");
    }

    None
}

fn parse_internal_date(value: &str) -> Option<DateTime<Utc>> {
    let millis: i64 = value.parse().ok()?;
    DateTime::from_timestamp_millis(millis)
}

fn parse_rfc2822(value: &str) -> Option<DateTime<Utc>> {
    let cleaned = strip_trailing_comment(value.trim());
    DateTime::parse_from_rfc2822(&cleaned)
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}

/// The date in a Received header follows the final semicolon.
fn parse_received(value: &str) -> Option<DateTime<Utc>> {
    let (_, date_part) = value.rsplit_once(';')?;
    parse_rfc2822(date_part)
}

/// Drops a trailing "(UTC)"-style comment that chrono's RFC2822 parser
/// rejects.
fn strip_trailing_comment(value: &str) -> String {
    static COMMENT: OnceLock<Regex> = OnceLock::new();
    let re = COMMENT.get_or_init(|| Regex::new(r"\s*\([^)]*\)\s*$").expect("valid regex"));
    re.replace(value, "").into_owned()
}

/// Computes the acceptance window for a sync pass.
#[derive(Debug, Clone, Copy)]
pub struct ReceiptFilter {
    first_run_lookback: Duration,
    cutoff_buffer: Duration,
    max_window: Duration,
}

impl ReceiptFilter {
    pub fn from_config(cfg: &SyncConfig) -> Self {
        Self {
            first_run_lookback: Duration::minutes(cfg.first_run_lookback_mins),
            cutoff_buffer: Duration::minutes(cfg.cutoff_buffer_mins),
            max_window: Duration::minutes(cfg.max_window_mins),
        }
    }

    /// The oldest receipt time still accepted. A mailbox that has never
    /// processed anything gets a short lookback; afterwards the window is
    /// anchored just before the last processed message, clamped so a long
    /// outage cannot reopen the whole mailbox.
    pub fn cutoff(
        &self,
        now: DateTime<Utc>,
        last_processed_at: Option<DateTime<Utc>>,
    ) -> DateTime<Utc> {
        match last_processed_at {
            None => now - self.first_run_lookback,
            Some(floor) => {
                let anchored = floor - self.cutoff_buffer;
                let clamp = now - self.max_window;
                anchored.max(clamp)
            }
        }
    }

    /// Inclusive at the boundary: a receipt exactly at the cutoff is accepted.
    pub fn accepts(&self, receipt: DateTime<Utc>, cutoff: DateTime<Utc>) -> bool {
        receipt >= cutoff
    }
}
