use std::collections::HashMap;
use std::sync::Mutex;

use chrono::{DateTime, Duration, Utc};
use tracing::debug;

/// Per-mailbox rate limit applied where notifications enter the system.
/// Dropped notifications are safe: the next accepted one reconciles from the
/// stored cursor and covers everything the dropped ones announced.
pub trait NotificationThrottle: Send + Sync {
    /// Returns true when the notification should be admitted.
    fn admit(&self, account_email: &str, now: DateTime<Utc>) -> bool;
}

/// Sliding one-minute window per mailbox.
pub struct InMemoryThrottle {
    max_per_minute: u32,
    arrivals: Mutex<HashMap<String, Vec<DateTime<Utc>>>>,
}

impl InMemoryThrottle {
    pub fn new(max_per_minute: u32) -> Self {
        Self {
            max_per_minute,
            arrivals: Mutex::new(HashMap::new()),
        }
    }

    #[cfg(test)]
    fn tracked_mailboxes(&self) -> usize {
        match self.arrivals.lock() {
            Ok(guard) => guard.len(),
            Err(poisoned) => poisoned.into_inner().len(),
        }
    }
}

impl NotificationThrottle for InMemoryThrottle {
    fn admit(&self, account_email: &str, now: DateTime<Utc>) -> bool {
        let mut arrivals = match self.arrivals.lock() {
            Ok(guard) => guard,
            // A poisoned lock means a panic elsewhere; failing open keeps
            // notifications flowing.
            Err(poisoned) => poisoned.into_inner(),
        };

        let window_start = now - Duration::seconds(60);
        // Drop mailboxes whose newest arrival left the window, otherwise the
        // map grows with every distinct address ever seen.
        arrivals.retain(|_, times| times.last().is_some_and(|ts| *ts > window_start));

        let entry = arrivals.entry(account_email.to_string()).or_default();
        entry.retain(|ts| *ts > window_start);

        if entry.len() as u32 >= self.max_per_minute {
            debug!(account = %account_email, "notification throttled");
            return false;
        }

        entry.push(now);
        true
    }
}
