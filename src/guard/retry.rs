use std::future::Future;
use std::time::Duration;

use rand::Rng;
use tokio::time::sleep;

use crate::platform::PlatformResult;

/// Bounded retry for transient platform failures (429, 5xx, timeouts).
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub attempts: u32,
    pub backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: 2,
            backoff: Duration::from_millis(500),
        }
    }
}

impl RetryPolicy {
    pub fn new(attempts: u32, backoff: Duration) -> Self {
        Self {
            attempts: attempts.max(1),
            backoff,
        }
    }

    /// Run `op`, retrying only `PlatformError::Transient`. The last error is returned as-is.
    pub async fn run<T, F, Fut>(&self, what: &str, mut op: F) -> PlatformResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = PlatformResult<T>>,
    {
        let mut attempt = 1;
        loop {
            match op().await {
                Err(e) if e.is_transient() && attempt < self.attempts => {
                    let jitter_ms = rand::rng().random_range(0..=self.backoff.as_millis() as u64 / 4);
                    let wait = self.backoff * attempt + Duration::from_millis(jitter_ms);
                    tracing::debug!(what, attempt, error = %e, ?wait, "transient failure, retrying");
                    sleep(wait).await;
                    attempt += 1;
                }
                other => return other,
            }
        }
    }
}
