//! src/services/poller.rs
//!
//! BucketPoller — periodic discovery of buckets and undelivered objects.
//!
//! A cycle lists buckets, registers new ones, scans every enabled bucket and
//! notifies the listener of each object without a sent record, in listing
//! order. Only one cycle runs at a time; a cycle requested while another is
//! active is skipped, not queued.

use crate::{
    errors::{RelayError, RelayResult},
    models::{bucket::BucketFilter, object::ObjectIdentity},
    services::{ledger::Ledger, storage_client::ObjectStorage},
};
use async_trait::async_trait;
use std::{
    future::Future,
    sync::{
        Arc, Mutex,
        atomic::{AtomicBool, Ordering},
    },
    time::{Duration, Instant},
};
use tokio::{
    task::JoinHandle,
    time::{self, MissedTickBehavior},
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

pub const MIN_INTERVAL_MINUTES: u32 = 1;
pub const MAX_INTERVAL_MINUTES: u32 = 1440;

/// Receives the poller's notifications.
///
/// Calls are awaited in order from inside the cycle, so the listener sees
/// new objects in listing order and the cycle guard covers its work.
#[async_trait]
pub trait PollListener: Send + Sync {
    async fn on_new_object(&self, identity: ObjectIdentity);

    /// A cycle-level failure; the cycle was abandoned.
    async fn on_error(&self, error: &RelayError);

    /// Runs at the end of every non-skipped cycle, still under the guard.
    async fn after_cycle(&self, _outcome: &CycleOutcome) {}
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CycleReport {
    pub buckets_discovered: usize,
    pub buckets_scanned: usize,
    pub buckets_failed: usize,
    pub objects_listed: usize,
    pub objects_malformed: usize,
    pub new_objects: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CycleOutcome {
    Completed(CycleReport),
    /// Bucket enumeration (or the ledger) failed before scanning.
    Aborted,
    /// Another cycle held the guard.
    Skipped,
}

/// Held for the duration of one cycle; clears the flag on every exit path.
struct CycleGuard<'a> {
    flag: &'a AtomicBool,
}

impl<'a> CycleGuard<'a> {
    fn acquire(flag: &'a AtomicBool) -> Option<Self> {
        flag.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| Self { flag })
    }
}

impl Drop for CycleGuard<'_> {
    fn drop(&mut self) {
        self.flag.store(false, Ordering::Release);
    }
}

struct Worker {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

pub struct BucketPoller {
    storage: Arc<dyn ObjectStorage>,
    ledger: Ledger,
    listener: Arc<dyn PollListener>,
    interval: Duration,
    request_timeout: Duration,
    polling: AtomicBool,
    worker: Mutex<Option<Worker>>,
}

impl BucketPoller {
    /// Fails with a validation error unless `interval_minutes` is 1..=1440.
    pub fn new(
        storage: Arc<dyn ObjectStorage>,
        ledger: Ledger,
        listener: Arc<dyn PollListener>,
        interval_minutes: u32,
        request_timeout: Duration,
    ) -> RelayResult<Self> {
        if !(MIN_INTERVAL_MINUTES..=MAX_INTERVAL_MINUTES).contains(&interval_minutes) {
            return Err(RelayError::validation(format!(
                "polling interval must be between {} and {} minutes, got {}",
                MIN_INTERVAL_MINUTES, MAX_INTERVAL_MINUTES, interval_minutes
            )));
        }

        Ok(Self {
            storage,
            ledger,
            listener,
            interval: Duration::from_secs(u64::from(interval_minutes) * 60),
            request_timeout,
            polling: AtomicBool::new(false),
            worker: Mutex::new(None),
        })
    }

    pub fn is_polling(&self) -> bool {
        self.polling.load(Ordering::Acquire)
    }

    /// Run a cycle now, then every interval, on a background task.
    ///
    /// Returns false if the poller was already started.
    pub fn start(self: &Arc<Self>) -> bool {
        let Ok(mut slot) = self.worker.lock() else {
            error!("Poller state poisoned; not starting");
            return false;
        };
        if slot.is_some() {
            warn!("Polling service already running");
            return false;
        }

        info!("Starting polling service ({}min interval)", self.interval.as_secs() / 60);

        let cancel = CancellationToken::new();
        let poller = Arc::clone(self);
        let token = cancel.clone();
        let handle = tokio::spawn(async move {
            let mut ticker = time::interval(poller.interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    biased;
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => {
                        poller.poll_once().await;
                    }
                }
            }
            debug!("polling loop exited");
        });

        *slot = Some(Worker { cancel, handle });
        true
    }

    /// Cancel the timer and wait for an in-flight cycle to finish.
    pub async fn stop(&self) {
        let worker = match self.worker.lock() {
            Ok(mut slot) => slot.take(),
            Err(_) => None,
        };
        let Some(worker) = worker else {
            return;
        };

        worker.cancel.cancel();
        if self.is_polling() {
            info!("Waiting for the current poll cycle to finish");
        }
        if let Err(err) = worker.handle.await {
            error!("Polling task ended abnormally: {}", err);
        }
        info!("Polling service stopped");
    }

    /// One guarded cycle.
    pub async fn poll_once(&self) -> CycleOutcome {
        let Some(_guard) = CycleGuard::acquire(&self.polling) else {
            warn!("Previous poll still running, skipping this cycle");
            return CycleOutcome::Skipped;
        };

        let started = Instant::now();
        info!("Polling buckets...");

        let outcome = match self.scan().await {
            Ok(report) => {
                info!(
                    buckets = report.buckets_scanned,
                    failed = report.buckets_failed,
                    new_objects = report.new_objects,
                    "Polling complete ({}ms)",
                    started.elapsed().as_millis()
                );
                CycleOutcome::Completed(report)
            }
            Err(err) => {
                error!("Polling error: {}", err);
                self.listener.on_error(&err).await;
                CycleOutcome::Aborted
            }
        };

        self.listener.after_cycle(&outcome).await;
        outcome
    }

    async fn scan(&self) -> RelayResult<CycleReport> {
        let mut report = CycleReport::default();

        let buckets = self
            .bounded("list buckets", self.storage.list_buckets())
            .await?;
        info!("Found {} buckets", buckets.len());

        for bucket in buckets.iter().filter(|b| !b.name.is_empty()) {
            match self.ledger.upsert_bucket(&bucket.name, true).await {
                Ok(true) => {
                    info!("New bucket discovered: {}", bucket.name);
                    report.buckets_discovered += 1;
                }
                Ok(false) => {}
                Err(err) => warn!("Failed to add bucket {}: {}", bucket.name, err),
            }
        }

        for setting in self.ledger.list_buckets(BucketFilter::Enabled).await? {
            match self.scan_bucket(&setting.bucket, &mut report).await {
                Ok(()) => report.buckets_scanned += 1,
                Err(err) => {
                    report.buckets_failed += 1;
                    error!("Error checking bucket {}: {}", setting.bucket, err);
                }
            }

            if let Err(err) = self.ledger.touch_bucket_checked(&setting.bucket).await {
                warn!("Failed to update last check for {}: {}", setting.bucket, err);
            }
        }

        Ok(report)
    }

    async fn scan_bucket(&self, bucket: &str, report: &mut CycleReport) -> RelayResult<()> {
        let objects = self
            .bounded(&format!("list objects in {}", bucket), self.storage.list_objects(bucket))
            .await?;
        report.objects_listed += objects.len();

        let mut new_in_bucket = 0usize;
        for listed in objects {
            let Some(identity) = listed.into_identity(bucket) else {
                report.objects_malformed += 1;
                continue;
            };

            if self
                .ledger
                .has_sent_record(bucket, &identity.key, &identity.etag)
                .await?
            {
                continue;
            }

            info!("New file detected: {}", identity);
            new_in_bucket += 1;
            report.new_objects += 1;
            self.listener.on_new_object(identity).await;
        }

        if new_in_bucket > 0 {
            info!("Found {} new files in {}", new_in_bucket, bucket);
        }
        Ok(())
    }

    async fn bounded<T, E>(&self, what: &str, call: impl Future<Output = Result<T, E>>) -> RelayResult<T>
    where
        E: Into<RelayError>,
    {
        match time::timeout(self.request_timeout, call).await {
            Ok(result) => result.map_err(Into::into),
            Err(_) => Err(RelayError::transport(format!("{} timed out", what))),
        }
    }
}
