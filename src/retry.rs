//! Bounded retry with linear backoff, shared by the market-data cache's
//! outbound fetches and the live executor's transaction sender.

use std::future::Future;
use std::time::Duration;

pub struct RetryPolicy {
    pub attempts: u32,
    pub base_delay: Duration,
}

impl RetryPolicy {
    pub const fn new(attempts: u32, base_delay: Duration) -> Self {
        Self { attempts, base_delay }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(3, Duration::from_millis(250))
    }
}

/// Runs `op` up to `policy.attempts` times, sleeping `base_delay * attempt`
/// between tries (linear backoff). Returns the last error if every attempt
/// fails.
pub async fn with_backoff<T, E, F, Fut>(policy: &RetryPolicy, mut op: F) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
{
    let mut last_err = None;
    for attempt in 0..policy.attempts.max(1) {
        match op().await {
            Ok(v) => return Ok(v),
            Err(e) => {
                last_err = Some(e);
                if attempt + 1 < policy.attempts {
                    tokio::time::sleep(policy.base_delay * (attempt + 1)).await;
                }
            }
        }
    }
    Err(last_err.expect("at least one attempt runs"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[tokio::test]
    async fn test_retries_until_success() {
        let calls = AtomicU32::new(0);
        let policy = RetryPolicy::new(3, Duration::from_millis(1));
        let result: Result<u32, &str> = with_backoff(&policy, || {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            async move { if n < 2 { Err("not yet") } else { Ok(42) } }
        })
        .await;
        assert_eq!(result, Ok(42));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_exhausts_attempts() {
        let policy = RetryPolicy::new(2, Duration::from_millis(1));
        let result: Result<u32, &str> = with_backoff(&policy, || async { Err("always fails") }).await;
        assert_eq!(result, Err("always fails"));
    }
}
