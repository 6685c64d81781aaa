//! Periodic status message summarising the last window of activity.

use crate::{
    errors::{RelayError, RelayResult},
    services::{
        captions,
        ledger::Ledger,
        messenger::{DeliveryRef, Messenger},
        rate_limiter::RateLimiter,
    },
};
use chrono::{DateTime, Utc};
use std::{sync::Arc, time::Duration};
use tokio::{task::JoinHandle, time};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Longest supported reporting window (one year).
pub const MAX_HEARTBEAT_HOURS: u64 = 24 * 365;

pub struct Heartbeat {
    ledger: Ledger,
    messenger: Arc<dyn Messenger>,
    limiter: Arc<RateLimiter>,
    destination: String,
    hours: u64,
}

impl Heartbeat {
    /// `None` when `hours` is zero (heartbeat disabled). Longer windows
    /// are capped at `MAX_HEARTBEAT_HOURS`.
    pub fn new(
        ledger: Ledger,
        messenger: Arc<dyn Messenger>,
        limiter: Arc<RateLimiter>,
        destination: String,
        hours: u64,
    ) -> Option<Self> {
        (hours > 0).then_some(Self {
            ledger,
            messenger,
            limiter,
            destination,
            hours: hours.min(MAX_HEARTBEAT_HOURS),
        })
    }

    fn period(&self) -> Duration {
        Duration::from_secs(self.hours * 3600)
    }

    /// Send one report covering the window ending at `now`.
    pub async fn send_once(&self, now: DateTime<Utc>) -> RelayResult<DeliveryRef> {
        let window = chrono::Duration::from_std(self.period())
            .map_err(|err| RelayError::validation(format!("heartbeat window: {}", err)))?;
        let stats = self.ledger.stats_since(now - window).await?;
        let text = captions::heartbeat(&stats, self.hours, &(now + window));

        self.limiter.acquire().await;
        Ok(self.messenger.send_text(&self.destination, &text).await?)
    }

    /// Report every period until `cancel` fires. The first report goes out
    /// one period after start.
    pub fn spawn(self, cancel: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            let period = self.period();
            let mut ticker = time::interval_at(time::Instant::now() + period, period);
            ticker.set_missed_tick_behavior(time::MissedTickBehavior::Delay);
            info!("Heartbeat every {}h", self.hours);

            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        match self.send_once(Utc::now()).await {
                            Ok(reference) => info!("Heartbeat sent (message ID: {})", reference),
                            Err(err) => warn!("Failed to send heartbeat: {}", err),
                        }
                    }
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::testing::{FakeMessenger, memory_ledger};

    async fn heartbeat(hours: u64) -> (Arc<FakeMessenger>, Ledger, Option<Heartbeat>) {
        let messenger = FakeMessenger::new();
        let ledger = memory_ledger().await;
        let hb = Heartbeat::new(
            ledger.clone(),
            messenger.clone(),
            Arc::new(RateLimiter::new(Duration::ZERO)),
            "chat".into(),
            hours,
        );
        (messenger, ledger, hb)
    }

    #[tokio::test]
    async fn zero_hours_disables_the_heartbeat() {
        let (_, _, hb) = heartbeat(0).await;
        assert!(hb.is_none());
    }

    #[tokio::test]
    async fn report_reflects_the_ledger() {
        let (messenger, ledger, hb) = heartbeat(24).await;
        ledger.upsert_bucket("b1", true).await.unwrap();
        ledger.upsert_bucket("b2", true).await.unwrap();
        ledger.set_bucket_enabled("b2", false).await.unwrap();
        ledger
            .write_sent_record("b1", "a.txt", "\"a\"", 2048, 1, &["m1".to_string()])
            .await
            .unwrap();

        hb.unwrap().send_once(Utc::now()).await.unwrap();

        let texts = messenger.texts();
        assert_eq!(texts.len(), 1);
        assert!(texts[0].contains("📊 Last 24 Hours:"));
        assert!(texts[0].contains("• Backups Sent: 1 files (2 KB)"));
        assert!(texts[0].contains("• Buckets Active: 1/2"));
        assert!(texts[0].contains("• Retry Queue: Empty"));
    }

    #[tokio::test]
    async fn cancelled_before_the_first_period_sends_nothing() {
        let (messenger, _ledger, hb) = heartbeat(1).await;
        let cancel = CancellationToken::new();
        let handle = hb.unwrap().spawn(cancel.clone());

        tokio::time::sleep(Duration::from_millis(20)).await;
        cancel.cancel();
        handle.await.unwrap();

        assert!(messenger.texts().is_empty());
    }

    #[tokio::test]
    async fn oversized_windows_are_capped() {
        let (messenger, _ledger, hb) = heartbeat(u64::MAX).await;
        let hb = hb.unwrap();
        assert_eq!(hb.period(), Duration::from_secs(MAX_HEARTBEAT_HOURS * 3600));

        let cancel = CancellationToken::new();
        let handle = hb.spawn(cancel.clone());
        tokio::time::sleep(Duration::from_millis(20)).await;
        cancel.cancel();
        handle.await.unwrap();

        assert!(messenger.texts().is_empty());
    }
}
