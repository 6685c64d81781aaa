//! `GET /status`: read-only view of the ledger for operators.

use crate::{
    errors::AppError,
    models::{
        bucket::{BucketFilter, BucketSetting},
        log_entry::LogEntry,
        sent::SentRecord,
    },
    routes::routes::AppState,
};
use axum::{Json, extract::State};
use chrono::{DateTime, Utc};
use serde::Serialize;

const RECENT_LIMIT: i64 = 20;

#[derive(Serialize)]
pub struct StatusResponse {
    pub status: &'static str,
    pub started_at: DateTime<Utc>,
    pub uptime_seconds: i64,
    pub poll_interval_minutes: u32,
    pub retry_queue_depth: i64,
    pub buckets: Vec<BucketSetting>,
    pub recent_deliveries: Vec<SentRecord>,
    pub recent_logs: Vec<LogEntry>,
}

pub async fn status(State(state): State<AppState>) -> Result<Json<StatusResponse>, AppError> {
    let ledger = &state.ledger;

    Ok(Json(StatusResponse {
        status: "ok",
        started_at: state.started_at,
        uptime_seconds: (Utc::now() - state.started_at).num_seconds(),
        poll_interval_minutes: state.poll_interval_minutes,
        retry_queue_depth: ledger.retry_queue_depth().await?,
        buckets: ledger.list_buckets(BucketFilter::All).await?,
        recent_deliveries: ledger.recent_sent(RECENT_LIMIT).await?,
        recent_logs: ledger.recent_logs(RECENT_LIMIT).await?,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        models::log_entry::LogLevel,
        services::{retry_scheduler::BackoffTable, testing::memory_ledger},
    };
    use std::path::PathBuf;

    #[tokio::test]
    async fn status_summarises_the_ledger() {
        let ledger = memory_ledger().await;
        ledger.upsert_bucket("b1", true).await.unwrap();
        ledger
            .write_sent_record("b1", "a.txt", "\"a\"", 10, 1, &["m1".to_string()])
            .await
            .unwrap();
        ledger
            .upsert_retry_entry("b1", "b.txt", 5, "timeout", &BackoffTable::default(), Utc::now())
            .await
            .unwrap();
        ledger.add_log(LogLevel::Warn, "something odd", None).await.unwrap();

        let state = AppState {
            ledger,
            staging_dir: PathBuf::from("."),
            poll_interval_minutes: 7,
            started_at: Utc::now(),
        };
        let Json(body) = status(State(state)).await.unwrap();

        assert_eq!(body.poll_interval_minutes, 7);
        assert_eq!(body.retry_queue_depth, 1);
        assert_eq!(body.buckets.len(), 1);
        assert_eq!(body.recent_deliveries[0].object_key, "a.txt");
        assert_eq!(body.recent_logs[0].message, "something odd");
    }
}
