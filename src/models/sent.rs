//! Append-only record of a fully delivered object.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{FromRow, types::Json};

/// Written once every part of an object has a confirmed delivery reference.
/// Its presence for `(bucket, object_key, etag)` is the only dedup signal.
#[derive(Serialize, Deserialize, Clone, FromRow, Debug)]
pub struct SentRecord {
    pub id: i64,
    pub bucket: String,
    pub object_key: String,
    pub etag: String,
    pub file_size: i64,

    /// Number of messages the object was delivered as (1 when unsplit).
    pub chunk_count: i64,

    /// Message identifiers returned by the delivery endpoint, in part order.
    pub delivery_refs: Json<Vec<String>>,

    pub sent_at: DateTime<Utc>,
}
