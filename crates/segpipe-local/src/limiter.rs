//! Minimum-spacing limiter for provider calls.
//!
//! No burst allowance: each call starts at least `min_interval` after the previous call
//! *completed*. The lock is held for the whole call, so every caller sharing one limiter
//! (all extractions in a process) is serialized through it.

use std::future::Future;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;

#[derive(Debug)]
pub struct RateLimiter {
    min_interval: Duration,
    last_call: Mutex<Option<Instant>>,
}

impl RateLimiter {
    pub fn new(min_interval: Duration) -> Self {
        Self {
            min_interval,
            last_call: Mutex::new(None),
        }
    }

    pub fn min_interval(&self) -> Duration {
        self.min_interval
    }

    /// Wait out the remaining spacing, run `call`, and record its completion time.
    pub async fn run<F, Fut, T>(&self, call: F) -> T
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = T>,
    {
        let mut last = self.last_call.lock().await;
        if let Some(prev) = *last {
            let since = prev.elapsed();
            let wait = self.min_interval.saturating_sub(since);
            if !wait.is_zero() {
                tracing::debug!(
                    wait_ms = wait.as_millis() as u64,
                    since_last_ms = since.as_millis() as u64,
                    "spacing provider call"
                );
                tokio::time::sleep(wait).await;
            }
        }
        let out = call().await;
        *last = Some(Instant::now());
        out
    }
}
