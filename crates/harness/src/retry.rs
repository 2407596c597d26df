//! Bounded retry with exponential backoff.
//!
//! Every blocking wait in the harness carries a deadline; this is the one
//! retry shape they all share. Transient failures are absorbed here, the
//! final error is returned to the caller.

use std::{
    future::Future,
    time::Duration,
};
use tracing::warn;

/// Retry budget for one kind of operation.
#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    /// Total attempts, including the first one.
    pub attempts: u32,
    /// Delay before the second attempt; doubles each retry.
    pub base_delay: Duration,
    /// Ceiling on the per-retry delay.
    pub max_delay: Duration,
}

impl BackoffPolicy {
    pub const fn new(attempts: u32, base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            attempts,
            base_delay,
            max_delay,
        }
    }

    /// Delay to sleep after the given zero-based failed attempt.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = 1u32 << attempt.min(16);
        self.base_delay
            .saturating_mul(factor)
            .min(self.max_delay)
    }
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self::new(5, Duration::from_millis(500), Duration::from_secs(10))
    }
}

/// Runs `op` until it succeeds or the attempt budget is spent.
pub async fn with_backoff<T, E, F, Fut>(
    policy: BackoffPolicy,
    what: &str,
    mut op: F,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: std::fmt::Display,
{
    let mut attempt = 0u32;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(error) if attempt + 1 < policy.attempts => {
                let delay = policy.delay_for(attempt);
                warn!(%error, attempt, ?delay, "{what} failed, retrying");
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            Err(error) => return Err(error),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{
        AtomicU32,
        Ordering,
    };

    #[test]
    fn delays_double_up_to_the_cap() {
        let policy = BackoffPolicy::new(10, Duration::from_millis(100), Duration::from_millis(450));
        assert_eq!(policy.delay_for(0), Duration::from_millis(100));
        assert_eq!(policy.delay_for(1), Duration::from_millis(200));
        assert_eq!(policy.delay_for(2), Duration::from_millis(400));
        assert_eq!(policy.delay_for(3), Duration::from_millis(450));
        assert_eq!(policy.delay_for(16), Duration::from_millis(450));
    }

    #[tokio::test(start_paused = true)]
    async fn succeeds_after_transient_failures() {
        let calls = AtomicU32::new(0);
        let result: Result<u32, &str> =
            with_backoff(BackoffPolicy::default(), "test op", || {
                let n = calls.fetch_add(1, Ordering::SeqCst);
                async move { if n < 2 { Err("transient") } else { Ok(n) } }
            })
            .await;
        assert_eq!(result, Ok(2));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn gives_up_after_budget() {
        let calls = AtomicU32::new(0);
        let policy = BackoffPolicy::new(3, Duration::from_millis(1), Duration::from_millis(1));
        let result: Result<(), &str> = with_backoff(policy, "test op", || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err("always down") }
        })
        .await;
        assert_eq!(result, Err("always down"));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }
}
