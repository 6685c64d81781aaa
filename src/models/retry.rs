//! Outstanding delivery failure awaiting another attempt.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

/// One row per `(bucket, object_key)`; repeated failures update it in place.
#[derive(Serialize, Deserialize, Clone, FromRow, Debug)]
pub struct RetryEntry {
    pub id: i64,
    pub bucket: String,
    pub object_key: String,
    pub file_size: i64,

    /// Failed attempts recorded so far.
    pub attempts: i64,

    pub last_attempt_at: Option<DateTime<Utc>>,
    pub next_retry_at: DateTime<Utc>,

    /// Message of the most recent failure.
    pub error_message: String,
}
