//! src/services/ledger.rs
//!
//! Ledger — the durable record store shared across poll cycles and process
//! restarts. Every write is a single statement or a single transaction, so
//! a crash mid-object leaves either "no sent record, maybe a retry entry"
//! or "a sent record". Nothing is cached in memory; callers re-read state
//! for every decision.

use crate::{
    errors::RelayResult,
    models::{
        bucket::{BucketFilter, BucketSetting},
        log_entry::{LogEntry, LogLevel},
        retry::RetryEntry,
        sent::SentRecord,
    },
    services::retry_scheduler::BackoffTable,
};
use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use sqlx::{SqlitePool, types::Json};
use std::sync::Arc;
use tracing::debug;

const SCHEMA: &str = include_str!("../../migrations/0001_init.sql");

const RETRY_COLUMNS: &str =
    "id, bucket, object_key, file_size, attempts, last_attempt_at, next_retry_at, error_message";

/// Aggregate counters reported by the heartbeat.
#[derive(Debug, Clone, Default, Serialize)]
pub struct LedgerStats {
    pub sent_count: i64,
    pub sent_bytes: i64,
    pub buckets_active: i64,
    pub buckets_total: i64,
    pub failed_uploads: i64,
    pub retry_queue_depth: i64,
    pub last_sent_at: Option<DateTime<Utc>>,
}

#[derive(Clone)]
pub struct Ledger {
    /// Shared SQLite connection pool.
    pub db: Arc<SqlitePool>,
}

impl Ledger {
    pub fn new(db: Arc<SqlitePool>) -> Self {
        Self { db }
    }

    /// Apply the embedded schema. Every statement is `IF NOT EXISTS`, so
    /// this is safe on every startup.
    pub async fn migrate(&self) -> RelayResult<usize> {
        let statements = SCHEMA
            .split(';')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .collect::<Vec<_>>();

        for stmt in &statements {
            debug!("Executing migration SQL: {}", stmt);
            sqlx::query(stmt).execute(&*self.db).await?;
        }

        Ok(statements.len())
    }

    // --- Sent records ---

    pub async fn has_sent_record(&self, bucket: &str, key: &str, etag: &str) -> RelayResult<bool> {
        let found: Option<i64> = sqlx::query_scalar(
            "SELECT id FROM sent_files WHERE bucket = ? AND object_key = ? AND etag = ?",
        )
        .bind(bucket)
        .bind(key)
        .bind(etag)
        .fetch_optional(&*self.db)
        .await?;

        Ok(found.is_some())
    }

    /// Record a completed delivery. Returns `false` when a record for the
    /// same identity already existed (a duplicate send after a crash), in
    /// which case the original row is kept.
    pub async fn write_sent_record(
        &self,
        bucket: &str,
        key: &str,
        etag: &str,
        size: u64,
        chunk_count: u32,
        delivery_refs: &[String],
    ) -> RelayResult<bool> {
        let result = sqlx::query(
            "INSERT INTO sent_files
                (bucket, object_key, etag, file_size, chunk_count, delivery_refs, sent_at)
             VALUES (?, ?, ?, ?, ?, ?, ?)
             ON CONFLICT(bucket, object_key, etag) DO NOTHING",
        )
        .bind(bucket)
        .bind(key)
        .bind(etag)
        .bind(clamp_size(size))
        .bind(i64::from(chunk_count.max(1)))
        .bind(Json(delivery_refs))
        .bind(Utc::now())
        .execute(&*self.db)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    pub async fn recent_sent(&self, limit: i64) -> RelayResult<Vec<SentRecord>> {
        let rows = sqlx::query_as::<_, SentRecord>(
            "SELECT id, bucket, object_key, etag, file_size, chunk_count, delivery_refs, sent_at
             FROM sent_files ORDER BY sent_at DESC, id DESC LIMIT ?",
        )
        .bind(limit)
        .fetch_all(&*self.db)
        .await?;

        Ok(rows)
    }

    // --- Buckets ---

    /// Register a bucket if it is unknown. Known buckets keep their
    /// `enabled` flag. Returns `true` when a row was created.
    pub async fn upsert_bucket(&self, bucket: &str, enabled_default: bool) -> RelayResult<bool> {
        let result = sqlx::query(
            "INSERT INTO bucket_settings (bucket, enabled, discovered_at)
             VALUES (?, ?, ?)
             ON CONFLICT(bucket) DO NOTHING",
        )
        .bind(bucket)
        .bind(enabled_default)
        .bind(Utc::now())
        .execute(&*self.db)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    pub async fn list_buckets(&self, filter: BucketFilter) -> RelayResult<Vec<BucketSetting>> {
        let sql = match filter {
            BucketFilter::All => {
                "SELECT bucket, enabled, discovered_at, last_checked_at
                 FROM bucket_settings ORDER BY bucket ASC"
            }
            BucketFilter::Enabled => {
                "SELECT bucket, enabled, discovered_at, last_checked_at
                 FROM bucket_settings WHERE enabled = 1 ORDER BY bucket ASC"
            }
        };

        Ok(sqlx::query_as::<_, BucketSetting>(sql)
            .fetch_all(&*self.db)
            .await?)
    }

    /// `None` when the bucket has never been discovered.
    pub async fn is_bucket_enabled(&self, bucket: &str) -> RelayResult<Option<bool>> {
        Ok(
            sqlx::query_scalar::<_, bool>("SELECT enabled FROM bucket_settings WHERE bucket = ?")
                .bind(bucket)
                .fetch_optional(&*self.db)
                .await?,
        )
    }

    /// Flip the flag owned by the administrative surface. That surface
    /// writes the shared database directly; here only tests need it.
    #[cfg(test)]
    pub async fn set_bucket_enabled(&self, bucket: &str, enabled: bool) -> RelayResult<bool> {
        let result = sqlx::query("UPDATE bucket_settings SET enabled = ? WHERE bucket = ?")
            .bind(enabled)
            .bind(bucket)
            .execute(&*self.db)
            .await?;

        Ok(result.rows_affected() == 1)
    }

    pub async fn touch_bucket_checked(&self, bucket: &str) -> RelayResult<()> {
        sqlx::query("UPDATE bucket_settings SET last_checked_at = ? WHERE bucket = ?")
            .bind(Utc::now())
            .bind(bucket)
            .execute(&*self.db)
            .await?;

        Ok(())
    }

    // --- Retry queue ---

    /// Record a failed delivery of `(bucket, key)`.
    ///
    /// Creates the entry with `attempts = 1` or bumps the existing one. The
    /// next eligible time is `now` plus the backoff for the attempt count
    /// held before this failure.
    pub async fn upsert_retry_entry(
        &self,
        bucket: &str,
        key: &str,
        size: u64,
        error_message: &str,
        backoff: &BackoffTable,
        now: DateTime<Utc>,
    ) -> RelayResult<RetryEntry> {
        let mut tx = self.db.begin().await?;

        let prior: Option<i64> =
            sqlx::query_scalar("SELECT attempts FROM retry_queue WHERE bucket = ? AND object_key = ?")
                .bind(bucket)
                .bind(key)
                .fetch_optional(&mut *tx)
                .await?;

        let prior_attempts = u32::try_from(prior.unwrap_or(0)).unwrap_or(u32::MAX);
        let delay = Duration::from_std(backoff.delay_for(prior_attempts)).unwrap_or_default();

        let entry = sqlx::query_as::<_, RetryEntry>(&format!(
            "INSERT INTO retry_queue
                (bucket, object_key, file_size, attempts, last_attempt_at, next_retry_at, error_message)
             VALUES (?, ?, ?, 1, ?, ?, ?)
             ON CONFLICT(bucket, object_key) DO UPDATE SET
                file_size = excluded.file_size,
                attempts = retry_queue.attempts + 1,
                last_attempt_at = excluded.last_attempt_at,
                next_retry_at = excluded.next_retry_at,
                error_message = excluded.error_message
             RETURNING {RETRY_COLUMNS}"
        ))
        .bind(bucket)
        .bind(key)
        .bind(clamp_size(size))
        .bind(now)
        .bind(now + delay)
        .bind(error_message)
        .fetch_one(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(entry)
    }

    /// Entries eligible at `now`, oldest-due first.
    pub async fn list_retry_entries_due(&self, now: DateTime<Utc>) -> RelayResult<Vec<RetryEntry>> {
        Ok(sqlx::query_as::<_, RetryEntry>(&format!(
            "SELECT {RETRY_COLUMNS} FROM retry_queue
             WHERE next_retry_at <= ? ORDER BY next_retry_at ASC, id ASC"
        ))
        .bind(now)
        .fetch_all(&*self.db)
        .await?)
    }

    #[cfg(test)]
    pub async fn get_retry_entry(&self, bucket: &str, key: &str) -> RelayResult<Option<RetryEntry>> {
        Ok(sqlx::query_as::<_, RetryEntry>(&format!(
            "SELECT {RETRY_COLUMNS} FROM retry_queue WHERE bucket = ? AND object_key = ?"
        ))
        .bind(bucket)
        .bind(key)
        .fetch_optional(&*self.db)
        .await?)
    }

    pub async fn delete_retry_entry(&self, id: i64) -> RelayResult<bool> {
        let result = sqlx::query("DELETE FROM retry_queue WHERE id = ?")
            .bind(id)
            .execute(&*self.db)
            .await?;

        Ok(result.rows_affected() == 1)
    }

    pub async fn retry_queue_depth(&self) -> RelayResult<i64> {
        Ok(sqlx::query_scalar("SELECT COUNT(*) FROM retry_queue")
            .fetch_one(&*self.db)
            .await?)
    }

    // --- Logs ---

    pub async fn add_log(
        &self,
        level: LogLevel,
        message: &str,
        metadata: Option<serde_json::Value>,
    ) -> RelayResult<()> {
        sqlx::query("INSERT INTO logs (level, message, metadata, created_at) VALUES (?, ?, ?, ?)")
            .bind(level.as_str())
            .bind(message)
            .bind(metadata.map(Json))
            .bind(Utc::now())
            .execute(&*self.db)
            .await?;

        Ok(())
    }

    pub async fn recent_logs(&self, limit: i64) -> RelayResult<Vec<LogEntry>> {
        Ok(sqlx::query_as::<_, LogEntry>(
            "SELECT id, level, message, metadata, created_at
             FROM logs ORDER BY created_at DESC, id DESC LIMIT ?",
        )
        .bind(limit)
        .fetch_all(&*self.db)
        .await?)
    }

    // --- Stats ---

    pub async fn stats_since(&self, since: DateTime<Utc>) -> RelayResult<LedgerStats> {
        let (sent_count, sent_bytes): (i64, i64) = sqlx::query_as(
            "SELECT COUNT(*), COALESCE(SUM(file_size), 0) FROM sent_files WHERE sent_at >= ?",
        )
        .bind(since)
        .fetch_one(&*self.db)
        .await?;

        let (buckets_total, buckets_active): (i64, i64) = sqlx::query_as(
            "SELECT COUNT(*), COALESCE(SUM(CASE WHEN enabled = 1 THEN 1 ELSE 0 END), 0)
             FROM bucket_settings",
        )
        .fetch_one(&*self.db)
        .await?;

        let failed_uploads: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM retry_queue WHERE last_attempt_at >= ?")
                .bind(since)
                .fetch_one(&*self.db)
                .await?;

        let last_sent_at: Option<DateTime<Utc>> =
            sqlx::query_scalar("SELECT sent_at FROM sent_files ORDER BY sent_at DESC LIMIT 1")
                .fetch_optional(&*self.db)
                .await?;

        Ok(LedgerStats {
            sent_count,
            sent_bytes,
            buckets_active,
            buckets_total,
            failed_uploads,
            retry_queue_depth: self.retry_queue_depth().await?,
            last_sent_at,
        })
    }
}

fn clamp_size(size: u64) -> i64 {
    i64::try_from(size).unwrap_or(i64::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::testing::{assert_close, memory_ledger};

    #[tokio::test]
    async fn sent_record_is_keyed_by_identity_triple() {
        let ledger = memory_ledger().await;

        assert!(!ledger.has_sent_record("b1", "report.txt", "\"abc\"").await.unwrap());
        let inserted = ledger
            .write_sent_record("b1", "report.txt", "\"abc\"", 1024, 1, &["42".to_string()])
            .await
            .unwrap();
        assert!(inserted);

        assert!(ledger.has_sent_record("b1", "report.txt", "\"abc\"").await.unwrap());
        assert!(!ledger.has_sent_record("b1", "report.txt", "\"def\"").await.unwrap());
        assert!(!ledger.has_sent_record("b2", "report.txt", "\"abc\"").await.unwrap());

        let again = ledger
            .write_sent_record("b1", "report.txt", "\"abc\"", 1024, 1, &["43".to_string()])
            .await
            .unwrap();
        assert!(!again);

        let rows = ledger.recent_sent(10).await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].delivery_refs.0, vec!["42".to_string()]);
        assert_eq!(rows[0].chunk_count, 1);
    }

    #[tokio::test]
    async fn upsert_bucket_keeps_operator_flag() {
        let ledger = memory_ledger().await;

        assert!(ledger.upsert_bucket("alpha", true).await.unwrap());
        assert!(ledger.set_bucket_enabled("alpha", false).await.unwrap());
        assert!(!ledger.upsert_bucket("alpha", true).await.unwrap());

        assert_eq!(ledger.is_bucket_enabled("alpha").await.unwrap(), Some(false));
        assert_eq!(ledger.is_bucket_enabled("missing").await.unwrap(), None);
        assert!(ledger.list_buckets(BucketFilter::Enabled).await.unwrap().is_empty());
        assert_eq!(ledger.list_buckets(BucketFilter::All).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn touch_bucket_sets_last_checked() {
        let ledger = memory_ledger().await;
        ledger.upsert_bucket("alpha", true).await.unwrap();
        ledger.touch_bucket_checked("alpha").await.unwrap();

        let buckets = ledger.list_buckets(BucketFilter::All).await.unwrap();
        assert!(buckets[0].last_checked_at.is_some());
    }

    #[tokio::test]
    async fn repeated_failures_update_one_entry() {
        let ledger = memory_ledger().await;
        let table = BackoffTable::default();
        let now = Utc::now();

        let first = ledger
            .upsert_retry_entry("b1", "dump.bin", 10, "timeout", &table, now)
            .await
            .unwrap();
        assert_eq!(first.attempts, 1);
        assert_close(first.next_retry_at, now + Duration::minutes(1));

        let second = ledger
            .upsert_retry_entry("b1", "dump.bin", 10, "reset by peer", &table, now)
            .await
            .unwrap();
        assert_eq!(second.id, first.id);
        assert_eq!(second.attempts, 2);
        assert_eq!(second.error_message, "reset by peer");
        assert_close(second.next_retry_at, now + Duration::minutes(5));

        assert_eq!(ledger.retry_queue_depth().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn due_entries_are_ordered_oldest_first() {
        let ledger = memory_ledger().await;
        let table = BackoffTable::default();
        let base = Utc::now() - Duration::hours(2);

        ledger
            .upsert_retry_entry("b1", "late", 1, "x", &table, base + Duration::minutes(30))
            .await
            .unwrap();
        ledger
            .upsert_retry_entry("b1", "early", 1, "x", &table, base)
            .await
            .unwrap();
        ledger
            .upsert_retry_entry("b1", "future", 1, "x", &table, Utc::now())
            .await
            .unwrap();

        let due = ledger.list_retry_entries_due(Utc::now()).await.unwrap();
        let keys: Vec<_> = due.iter().map(|e| e.object_key.as_str()).collect();
        assert_eq!(keys, vec!["early", "late"]);

        assert!(ledger.delete_retry_entry(due[0].id).await.unwrap());
        assert!(ledger.get_retry_entry("b1", "early").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn logs_and_stats_reflect_activity() {
        let ledger = memory_ledger().await;
        let since = Utc::now() - Duration::hours(24);

        ledger.upsert_bucket("alpha", true).await.unwrap();
        ledger.upsert_bucket("beta", false).await.unwrap();
        ledger
            .write_sent_record("alpha", "a", "\"1\"", 100, 1, &["1".into()])
            .await
            .unwrap();
        ledger
            .write_sent_record("alpha", "b", "\"2\"", 300, 2, &["2".into(), "3".into()])
            .await
            .unwrap();
        ledger
            .upsert_retry_entry("alpha", "c", 5, "boom", &BackoffTable::default(), Utc::now())
            .await
            .unwrap();
        ledger
            .add_log(LogLevel::Error, "boom", Some(serde_json::json!({ "key": "c" })))
            .await
            .unwrap();

        let stats = ledger.stats_since(since).await.unwrap();
        assert_eq!(stats.sent_count, 2);
        assert_eq!(stats.sent_bytes, 400);
        assert_eq!(stats.buckets_total, 2);
        assert_eq!(stats.buckets_active, 1);
        assert_eq!(stats.failed_uploads, 1);
        assert_eq!(stats.retry_queue_depth, 1);
        assert!(stats.last_sent_at.is_some());

        let logs = ledger.recent_logs(5).await.unwrap();
        assert_eq!(logs.len(), 1);
        assert_eq!(logs[0].level, "error");
    }
}
