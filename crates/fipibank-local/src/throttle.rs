//! Request pacing and bounded retry for the crawl loop and asset downloads.

use fipibank_core::Result;
use rand::Rng;
use std::future::Future;
use std::ops::Range;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::warn;

pub const DEFAULT_JITTER_MS: Range<u64> = 500..1200;

/// Minimum spacing between requests (from a requests-per-second rate) plus random jitter.
#[derive(Debug)]
pub struct Throttle {
    min_interval: Duration,
    jitter_ms: Range<u64>,
    last: Mutex<Option<Instant>>,
}

impl Throttle {
    /// `rate <= 0` disables the fixed interval; jitter still applies.
    pub fn new(rate_per_sec: f64) -> Self {
        let min_interval = if rate_per_sec > 0.0 && rate_per_sec.is_finite() {
            Duration::from_secs_f64(1.0 / rate_per_sec)
        } else {
            Duration::ZERO
        };
        Self {
            min_interval,
            jitter_ms: DEFAULT_JITTER_MS,
            last: Mutex::new(None),
        }
    }

    pub fn with_jitter_ms(mut self, jitter_ms: Range<u64>) -> Self {
        self.jitter_ms = jitter_ms;
        self
    }

    pub fn min_interval(&self) -> Duration {
        self.min_interval
    }

    fn jitter(&self) -> Duration {
        if self.jitter_ms.is_empty() {
            return Duration::ZERO;
        }
        Duration::from_millis(rand::rng().random_range(self.jitter_ms.clone()))
    }

    /// Sleep until the next request is allowed, then mark it as sent.
    pub async fn wait(&self) {
        let mut last = self.last.lock().await;
        let jitter = self.jitter();
        if let Some(prev) = *last {
            let due = prev + self.min_interval + jitter;
            tokio::time::sleep_until(due).await;
        } else if !jitter.is_zero() {
            tokio::time::sleep(jitter).await;
        }
        *last = Some(Instant::now());
    }
}

/// Fixed number of attempts with a constant pause; no backoff growth.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub attempts: u32,
    pub pause: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: 3,
            pause: Duration::from_millis(1500),
        }
    }
}

/// Run `op` until it succeeds or the attempts run out; the last error propagates.
pub async fn with_retry<T, F, Fut>(policy: RetryPolicy, what: &str, mut op: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let attempts = policy.attempts.max(1);
    let mut attempt = 1;
    loop {
        match op().await {
            Ok(v) => return Ok(v),
            Err(e) if attempt < attempts => {
                warn!(what, attempt, attempts, error = %e, "retrying");
                tokio::time::sleep(policy.pause).await;
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}
