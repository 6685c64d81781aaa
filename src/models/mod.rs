//! Data models for the ingestion/delivery pipeline.
//!
//! Persistent rows (`BucketSetting`, `SentRecord`, `RetryEntry`, `LogEntry`)
//! map to ledger tables via `sqlx::FromRow` and serialize as JSON via
//! `serde` for the status endpoint. `ObjectIdentity` and `ChunkDescriptor`
//! only live in memory.

pub mod bucket;
pub mod chunk;
pub mod log_entry;
pub mod object;
pub mod retry;
pub mod sent;
