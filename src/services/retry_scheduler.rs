//! Persistent retry backlog for failed deliveries.
//!
//! Backoff grows through a fixed table and then plateaus at its last step.
//! There is no attempt ceiling: an object that never succeeds keeps being
//! retried daily until an operator intervenes.

use crate::{
    errors::RelayResult,
    models::retry::RetryEntry,
    services::ledger::Ledger,
};
use chrono::{DateTime, Utc};
use std::time::Duration;
use tracing::info;

const MINUTE: u64 = 60;
const HOUR: u64 = 60 * MINUTE;

/// 1 min, 5 min, 15 min, 1 h, 6 h, 24 h.
pub const DEFAULT_BACKOFF: [Duration; 6] = [
    Duration::from_secs(MINUTE),
    Duration::from_secs(5 * MINUTE),
    Duration::from_secs(15 * MINUTE),
    Duration::from_secs(HOUR),
    Duration::from_secs(6 * HOUR),
    Duration::from_secs(24 * HOUR),
];

/// Ascending delay table indexed by the number of failures already recorded.
#[derive(Debug, Clone)]
pub struct BackoffTable {
    steps: Vec<Duration>,
}

impl Default for BackoffTable {
    fn default() -> Self {
        Self {
            steps: DEFAULT_BACKOFF.to_vec(),
        }
    }
}

impl BackoffTable {
    /// Delay before the next attempt when `attempts` failures are already
    /// on record. Past the end of the table the last step repeats.
    pub fn delay_for(&self, attempts: u32) -> Duration {
        let last = self.steps.len() - 1;
        let index = usize::try_from(attempts).map_or(last, |a| a.min(last));
        self.steps[index]
    }
}

/// Retry queue operations on top of the ledger.
#[derive(Clone)]
pub struct RetryScheduler {
    ledger: Ledger,
    backoff: BackoffTable,
}

impl RetryScheduler {
    pub fn new(ledger: Ledger, backoff: BackoffTable) -> Self {
        Self { ledger, backoff }
    }

    /// Create or bump the single entry for `(bucket, key)`.
    pub async fn record_failure(
        &self,
        bucket: &str,
        key: &str,
        size: u64,
        error_message: &str,
    ) -> RelayResult<RetryEntry> {
        let entry = self
            .ledger
            .upsert_retry_entry(bucket, key, size, error_message, &self.backoff, Utc::now())
            .await?;

        info!(
            bucket,
            key,
            attempts = entry.attempts,
            next_retry_at = %entry.next_retry_at,
            "queued for retry"
        );
        Ok(entry)
    }

    /// Entries whose next retry time has passed, oldest-due first.
    pub async fn ready_entries(&self, now: DateTime<Utc>) -> RelayResult<Vec<RetryEntry>> {
        self.ledger.list_retry_entries_due(now).await
    }

    /// Drop an entry once its object is known to be delivered.
    pub async fn resolve(&self, entry: &RetryEntry) -> RelayResult<()> {
        if self.ledger.delete_retry_entry(entry.id).await? {
            info!(
                bucket = %entry.bucket,
                key = %entry.object_key,
                attempts = entry.attempts,
                "retry entry resolved"
            );
        }
        Ok(())
    }
}
