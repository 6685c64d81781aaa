//! Process-wide pacing of outbound delivery calls.

use std::time::Duration;
use tokio::{
    sync::Mutex,
    time::{Instant, sleep_until},
};

/// Enforces a minimum spacing between consecutive sends.
///
/// Shared by every whole-file, chunk and text send. Callers queue on the
/// inner lock, so a burst drains at most one send per `min_interval`.
#[derive(Debug)]
pub struct RateLimiter {
    min_interval: Duration,
    last_send: Mutex<Option<Instant>>,
}

impl RateLimiter {
    pub fn new(min_interval: Duration) -> Self {
        Self {
            min_interval,
            last_send: Mutex::new(None),
        }
    }

    /// Wait until a send is allowed and claim the slot.
    pub async fn acquire(&self) {
        let mut last = self.last_send.lock().await;
        if let Some(previous) = *last {
            let ready_at = previous + self.min_interval;
            if Instant::now() < ready_at {
                sleep_until(ready_at).await;
            }
        }
        *last = Some(Instant::now());
    }
}
