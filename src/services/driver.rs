//! src/services/driver.rs
//!
//! DeliveryDriver turns poller notifications into deliveries and runs the
//! retry sweep at the end of each cycle.
//!
//! Per-object failures stop here: they are logged (the processor has already
//! queued the retry) and the batch continues. A panicking delivery is
//! contained to its own task.

use crate::{
    errors::{RelayError, RelayResult},
    models::{log_entry::LogLevel, object::ObjectIdentity, retry::RetryEntry},
    services::{
        captions,
        ledger::Ledger,
        messenger::Messenger,
        poller::{CycleOutcome, PollListener},
        processor::FileProcessor,
        rate_limiter::RateLimiter,
        retry_scheduler::RetryScheduler,
        storage_client::ObjectStorage,
    },
};
use async_trait::async_trait;
use chrono::Utc;
use serde_json::json;
use std::{any::Any, sync::Arc, time::Duration};
use tokio::time;
use tracing::{error, info, warn};

/// Where (and whether) cycle errors are echoed to the delivery endpoint.
#[derive(Debug, Clone, Default)]
pub struct AlertSettings {
    pub destination: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub due: usize,
    pub resolved: usize,
    pub failed: usize,
    pub skipped_disabled: usize,
}

pub struct DeliveryDriver {
    processor: Arc<FileProcessor>,
    storage: Arc<dyn ObjectStorage>,
    messenger: Arc<dyn Messenger>,
    limiter: Arc<RateLimiter>,
    ledger: Ledger,
    retries: RetryScheduler,
    request_timeout: Duration,
    alerts: AlertSettings,
}

impl DeliveryDriver {
    pub fn new(
        processor: Arc<FileProcessor>,
        storage: Arc<dyn ObjectStorage>,
        messenger: Arc<dyn Messenger>,
        limiter: Arc<RateLimiter>,
        ledger: Ledger,
        retries: RetryScheduler,
        request_timeout: Duration,
        alerts: AlertSettings,
    ) -> Self {
        Self {
            processor,
            storage,
            messenger,
            limiter,
            ledger,
            retries,
            request_timeout,
            alerts,
        }
    }

    /// Run one delivery on its own task. Returns true on success.
    async fn deliver(&self, identity: ObjectIdentity) -> bool {
        let processor = Arc::clone(&self.processor);
        let task_identity = identity.clone();
        let joined = tokio::spawn(async move { processor.process_file(&task_identity).await }).await;

        match joined {
            Ok(Ok(_)) => true,
            Ok(Err(err)) => {
                warn!("Delivery of {} failed, left for retry: {}", identity, err);
                false
            }
            Err(join_err) if join_err.is_panic() => {
                let reason = panic_message(join_err.into_panic());
                error!("Delivery of {} panicked: {}", identity, reason);
                let message = format!("delivery panicked: {}", reason);
                if let Err(err) = self
                    .retries
                    .record_failure(&identity.bucket, &identity.key, identity.size, &message)
                    .await
                {
                    error!("Failed to add {} to retry queue: {}", identity, err);
                }
                self.audit(
                    LogLevel::Error,
                    format!("Delivery of {} panicked", identity),
                    json!({ "bucket": identity.bucket, "key": identity.key, "error": reason }),
                )
                .await;
                false
            }
            Err(join_err) => {
                warn!("Delivery of {} was cancelled: {}", identity, join_err);
                false
            }
        }
    }

    /// Re-offer due retry entries.
    ///
    /// The current etag comes from a HEAD request; an entry whose object
    /// already has a sent record is dropped without re-delivery.
    pub async fn sweep_retries(&self) -> RelayResult<SweepReport> {
        let due = self.retries.ready_entries(Utc::now()).await?;
        let mut report = SweepReport {
            due: due.len(),
            ..Default::default()
        };
        if due.is_empty() {
            return Ok(report);
        }

        info!("Retrying {} queued deliveries", due.len());
        for entry in due {
            if self.ledger.is_bucket_enabled(&entry.bucket).await? == Some(false) {
                report.skipped_disabled += 1;
                continue;
            }

            let identity = match self.head(&entry).await {
                Ok(identity) => identity,
                Err(err) => {
                    warn!("Retry of {}/{} could not stat object: {}", entry.bucket, entry.object_key, err);
                    self.retries
                        .record_failure(
                            &entry.bucket,
                            &entry.object_key,
                            u64::try_from(entry.file_size).unwrap_or(0),
                            &err.to_string(),
                        )
                        .await?;
                    report.failed += 1;
                    continue;
                }
            };

            if self
                .ledger
                .has_sent_record(&identity.bucket, &identity.key, &identity.etag)
                .await?
            {
                self.retries.resolve(&entry).await?;
                report.resolved += 1;
                continue;
            }

            if self.deliver(identity).await {
                self.retries.resolve(&entry).await?;
                report.resolved += 1;
            } else {
                report.failed += 1;
            }
        }

        info!(
            resolved = report.resolved,
            failed = report.failed,
            "Retry sweep complete"
        );
        Ok(report)
    }

    async fn head(&self, entry: &RetryEntry) -> RelayResult<ObjectIdentity> {
        match time::timeout(
            self.request_timeout,
            self.storage.head_object(&entry.bucket, &entry.object_key),
        )
        .await
        {
            Ok(result) => Ok(result?),
            Err(_) => Err(RelayError::transport(format!(
                "head {}/{} timed out",
                entry.bucket, entry.object_key
            ))),
        }
    }

    /// Send an admin alert, paced like every other delivery call.
    async fn send_alert(&self, destination: &str, text: &str) {
        self.limiter.acquire().await;
        if let Err(err) = self.messenger.send_text(destination, text).await {
            warn!("Failed to send admin alert: {}", err);
        }
    }

    async fn audit(&self, level: LogLevel, message: String, metadata: serde_json::Value) {
        if let Err(err) = self.ledger.add_log(level, &message, Some(metadata)).await {
            warn!("Failed to write log entry: {}", err);
        }
    }
}

#[async_trait]
impl PollListener for DeliveryDriver {
    async fn on_new_object(&self, identity: ObjectIdentity) {
        self.deliver(identity).await;
    }

    async fn on_error(&self, err: &RelayError) {
        error!("Poll cycle failed: {}", err);
        self.audit(
            LogLevel::Error,
            "Polling cycle failed".to_string(),
            json!({ "error": err.to_string() }),
        )
        .await;

        if let Some(destination) = &self.alerts.destination {
            let text = captions::admin_alert(&format!("Polling cycle failed: {}", err));
            self.send_alert(destination, &text).await;
        }
    }

    async fn after_cycle(&self, outcome: &CycleOutcome) {
        if matches!(outcome, CycleOutcome::Skipped) {
            return;
        }
        if let Err(err) = self.sweep_retries().await {
            error!("Retry sweep failed: {}", err);
        }
    }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
