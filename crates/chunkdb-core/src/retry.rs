//! Per-call deadlines and bounded retry for idempotent operations.

use std::future::Future;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Total attempts, including the first one.
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self { Self { max_attempts: 3, base_delay_ms: 100, max_delay_ms: 2_000 } }
}

impl RetryPolicy {
    pub fn none() -> Self { Self { max_attempts: 1, ..Self::default() } }

    /// Exponential backoff: base, 2*base, 4*base, ... capped at `max_delay_ms`.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = 1u64 << attempt.min(16);
        Duration::from_millis(self.base_delay_ms.saturating_mul(factor).min(self.max_delay_ms))
    }

    /// Run `op` until it succeeds, fails permanently, or attempts run out.
    /// Only [`Error::is_transient`] failures are retried.
    pub async fn run<T, F, Fut>(&self, operation: &str, mut op: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let attempts = self.max_attempts.max(1);
        let mut attempt = 0;
        loop {
            match op().await {
                Ok(value) => return Ok(value),
                Err(err) if err.is_transient() && attempt + 1 < attempts => {
                    let delay = self.delay_for(attempt);
                    warn!(
                        operation,
                        attempt = attempt + 1,
                        ?delay,
                        error = %err,
                        "retrying transient failure"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(err) => return Err(err),
            }
        }
    }
}

/// Deadline and retry settings applied to every backend call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CallOptions {
    pub deadline_ms: u64,
    pub retry: RetryPolicy,
}

impl Default for CallOptions {
    fn default() -> Self { Self { deadline_ms: 30_000, retry: RetryPolicy::default() } }
}

impl CallOptions {
    pub fn deadline(&self) -> Duration { Duration::from_millis(self.deadline_ms) }
}

/// Bound `fut` by `deadline`; expiry becomes [`Error::Timeout`].
pub async fn with_deadline<T>(
    operation: &str,
    deadline: Duration,
    fut: impl Future<Output = Result<T>>,
) -> Result<T> {
    match tokio::time::timeout(deadline, fut).await {
        Ok(result) => result,
        Err(_) => Err(Error::Timeout { operation: operation.to_string(), after: deadline }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn fast() -> RetryPolicy { RetryPolicy { max_attempts: 3, base_delay_ms: 1, max_delay_ms: 5 } }

    #[tokio::test]
    async fn retries_transient_then_succeeds() {
        let counter = AtomicU32::new(0);
        let calls = &counter;
        let out = fast()
            .run("upsert", move || async move {
                if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err(Error::transient("test", "flaky"))
                } else {
                    Ok(7)
                }
            })
            .await
            .expect("eventually succeeds");
        assert_eq!(out, 7);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn permanent_errors_are_not_retried() {
        let counter = AtomicU32::new(0);
        let calls = &counter;
        let err = fast()
            .run("create", move || async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err::<(), _>(Error::InvalidRequest("bad".into()))
            })
            .await
            .expect_err("fails");
        assert!(matches!(err, Error::InvalidRequest(_)));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn deadline_expires() {
        let err = with_deadline("slow", Duration::from_millis(10), async {
            tokio::time::sleep(Duration::from_millis(200)).await;
            Ok(())
        })
        .await
        .expect_err("times out");
        assert!(err.is_transient());
    }
}
