//! Rate limiter for forward fan-outs.
//!
//! Spaces consecutive sends of one account by a fixed interval so a
//! fan-out to many groups does not trip Telegram's flood protection, and
//! pushes the next slot out when Telegram answers with a flood wait.

use std::time::Duration;

use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, warn};

/// Rate limiter that enforces minimum intervals between operations.
#[derive(Debug)]
pub struct RateLimiter {
    /// Minimum duration between allowed operations.
    min_interval: Duration,

    /// Earliest instant the next operation may run.
    next_allowed: Mutex<Option<Instant>>,
}

impl RateLimiter {
    /// Creates a new rate limiter with the specified minimum interval.
    #[must_use]
    pub fn new(min_interval: Duration) -> Self {
        Self {
            min_interval,
            next_allowed: Mutex::new(None),
        }
    }

    /// Waits until an operation is allowed, then reserves the following slot.
    ///
    /// Returns the duration waited (0 if no wait was needed).
    pub async fn wait_and_acquire(&self) -> Duration {
        let mut next = self.next_allowed.lock().await;

        let now = Instant::now();
        let wait_duration = next.map_or(Duration::ZERO, |at| at.saturating_duration_since(now));

        if !wait_duration.is_zero() {
            debug!("Rate limiter: waiting {:?} before next send", wait_duration);
            tokio::time::sleep(wait_duration).await;
        }

        *next = Some(Instant::now() + self.min_interval);
        wait_duration
    }

    /// Handles a flood wait error from Telegram by deferring the next slot.
    pub async fn handle_flood_wait(&self, wait_seconds: u32) {
        warn!("Received flood wait from Telegram: {} seconds", wait_seconds);

        let until = Instant::now() + Duration::from_secs(u64::from(wait_seconds));
        let mut next = self.next_allowed.lock().await;
        *next = Some(next.map_or(until, |at| at.max(until)));
    }
}
