//! Per-bucket polling settings.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

/// A bucket discovered on the storage endpoint.
///
/// Created the first time the poller sees the bucket name. Only `enabled`
/// is changed from outside the pipeline; `last_checked_at` is advanced by
/// the poller after every scan, whether or not the scan succeeded.
#[derive(Serialize, Deserialize, Clone, FromRow, Debug)]
pub struct BucketSetting {
    pub bucket: String,

    /// Whether the poller scans this bucket.
    pub enabled: bool,

    pub discovered_at: DateTime<Utc>,

    pub last_checked_at: Option<DateTime<Utc>>,
}

/// Which bucket rows to return from the ledger.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BucketFilter {
    All,
    Enabled,
}
