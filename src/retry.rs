use std::{future::Future, time::Duration};

use tokio::time::sleep;
use tracing::warn;

use crate::model_client::ModelError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub initial_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_delay: Duration::from_millis(1000),
        }
    }
}

impl RetryPolicy {
    /// Delay before retry number `retry` (1-based); doubles every time.
    pub fn delay_for(&self, retry: u32) -> Duration {
        let exponent = retry.saturating_sub(1).min(31);
        self.initial_delay.saturating_mul(1u32 << exponent)
    }
}

/// Runs `operation` until it succeeds, fails with a non-retryable error, or
/// the retry budget is spent. The error of the final attempt is returned as is.
pub async fn with_retry<T, F, Fut>(policy: RetryPolicy, mut operation: F) -> Result<T, ModelError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, ModelError>>,
{
    let mut retries = 0;

    loop {
        match operation().await {
            Ok(value) => return Ok(value),
            Err(err) if err.is_retryable() && retries < policy.max_retries => {
                retries += 1;
                let delay = policy.delay_for(retries);
                warn!(
                    error = %err,
                    retry = retries,
                    max_retries = policy.max_retries,
                    delay_ms = delay.as_millis() as u64,
                    "Model call failed, retrying"
                );
                sleep(delay).await;
            }
            Err(err) => return Err(err),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{
        atomic::{AtomicU32, Ordering},
        Arc,
    };

    use tokio::time::Instant;

    use super::*;

    fn policy(initial_ms: u64) -> RetryPolicy {
        RetryPolicy {
            max_retries: 3,
            initial_delay: Duration::from_millis(initial_ms),
        }
    }

    #[test]
    fn delay_doubles_each_retry() {
        let policy = policy(500);
        assert_eq!(policy.delay_for(1), Duration::from_millis(500));
        assert_eq!(policy.delay_for(2), Duration::from_millis(1000));
        assert_eq!(policy.delay_for(3), Duration::from_millis(2000));
    }

    #[tokio::test(start_paused = true)]
    async fn overloaded_twice_then_success() {
        let attempts = Arc::new(AtomicU32::new(0));
        let started = Instant::now();

        let counter = attempts.clone();
        let result = with_retry(policy(100), move || {
            let counter = counter.clone();
            async move {
                let attempt = counter.fetch_add(1, Ordering::SeqCst);
                if attempt < 2 {
                    Err(ModelError::Overloaded("busy".into()))
                } else {
                    Ok("generated")
                }
            }
        })
        .await;

        assert_eq!(result.expect("third attempt succeeds"), "generated");
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
        // Two delayed retries: 100ms then 200ms.
        let elapsed = started.elapsed();
        assert!(elapsed >= Duration::from_millis(300), "elapsed {elapsed:?}");
        assert!(elapsed < Duration::from_millis(400), "elapsed {elapsed:?}");
    }

    #[tokio::test(start_paused = true)]
    async fn non_retryable_errors_propagate_immediately() {
        let attempts = Arc::new(AtomicU32::new(0));
        let counter = attempts.clone();

        let result: Result<(), _> = with_retry(policy(100), move || {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Err(ModelError::Authentication("bad key".into()))
            }
        })
        .await;

        assert!(matches!(result, Err(ModelError::Authentication(_))));
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn exhausted_retries_surface_last_error() {
        let attempts = Arc::new(AtomicU32::new(0));
        let counter = attempts.clone();

        let result: Result<(), _> = with_retry(policy(10), move || {
            let counter = counter.clone();
            async move {
                let attempt = counter.fetch_add(1, Ordering::SeqCst);
                Err(ModelError::Server {
                    status: 502,
                    message: format!("attempt {attempt}"),
                })
            }
        })
        .await;

        assert_eq!(attempts.load(Ordering::SeqCst), 4);
        match result {
            Err(ModelError::Server { status, message }) => {
                assert_eq!(status, 502);
                assert_eq!(message, "attempt 3");
            }
            other => panic!("unexpected result: {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn rate_limits_are_retried() {
        let attempts = Arc::new(AtomicU32::new(0));
        let counter = attempts.clone();

        let result = with_retry(policy(10), move || {
            let counter = counter.clone();
            async move {
                if counter.fetch_add(1, Ordering::SeqCst) == 0 {
                    Err(ModelError::RateLimited("slow down".into()))
                } else {
                    Ok(7)
                }
            }
        })
        .await;

        assert_eq!(result.expect("retried"), 7);
        assert_eq!(attempts.load(Ordering::SeqCst), 2);
    }
}
