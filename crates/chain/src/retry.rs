//! Bounded timeout + exponential backoff around single RPC calls.

use std::fmt::Display;
use std::future::Future;
use std::time::Duration;

use matrixsync_core::AppError;

/// Per-call budget: every attempt is cut off after `timeout`, and at most
/// `max_attempts` attempts are made before the caller defers the work.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub timeout: Duration,
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(10),
            max_attempts: 3,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(8),
        }
    }
}

impl RetryPolicy {
    pub fn new(timeout: Duration, max_attempts: u32) -> Self {
        Self {
            timeout,
            max_attempts: max_attempts.max(1),
            ..Self::default()
        }
    }

    /// Delay before attempt `attempt + 1`: `base * 2^(attempt - 1)`, capped.
    pub fn delay_after(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }
}

/// Run `op` under `policy`.
///
/// Exhausting the budget yields [`AppError::RpcTimeout`] when the final
/// attempt timed out, [`AppError::Rpc`] when it failed outright. Both are
/// deferrable.
pub async fn with_retry<T, E, F, Fut>(policy: &RetryPolicy, call: &str, mut op: F) -> Result<T, AppError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: Display,
{
    let mut attempt = 0;
    loop {
        attempt += 1;
        let failure = match tokio::time::timeout(policy.timeout, op()).await {
            Ok(Ok(value)) => {
                if attempt > 1 {
                    tracing::info!(call, attempt, "RPC call recovered");
                }
                return Ok(value);
            }
            Ok(Err(e)) => AppError::Rpc(format!("{call}: {e}")),
            Err(_) => AppError::RpcTimeout {
                call: call.to_string(),
                attempts: attempt,
            },
        };

        if attempt >= policy.max_attempts {
            tracing::error!(call, attempts = attempt, error = %failure, "Giving up on RPC call");
            return Err(failure);
        }

        let wait = policy.delay_after(attempt);
        tracing::warn!(
            call,
            attempt,
            wait_ms = wait.as_millis() as u64,
            error = %failure,
            "RPC call failed, backing off"
        );
        tokio::time::sleep(wait).await;
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, Ordering};

    use super::*;

    fn fast_policy(max_attempts: u32) -> RetryPolicy {
        RetryPolicy {
            timeout: Duration::from_millis(50),
            max_attempts,
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(4),
        }
    }

    #[test]
    fn delays_grow_exponentially_and_cap() {
        let policy = RetryPolicy {
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(500),
            ..RetryPolicy::default()
        };
        assert_eq!(policy.delay_after(1), Duration::from_millis(100));
        assert_eq!(policy.delay_after(2), Duration::from_millis(200));
        assert_eq!(policy.delay_after(3), Duration::from_millis(400));
        assert_eq!(policy.delay_after(4), Duration::from_millis(500));
        assert_eq!(policy.delay_after(30), Duration::from_millis(500));
    }

    #[tokio::test]
    async fn retries_until_success() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();
        let result = with_retry(&fast_policy(5), "flaky", || {
            let counter = counter.clone();
            async move {
                if counter.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err("connection reset")
                } else {
                    Ok(7u64)
                }
            }
        })
        .await;

        assert_eq!(result.unwrap(), 7);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn persistent_failure_exhausts_budget() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();
        let result: Result<(), _> = with_retry(&fast_policy(3), "broken", || {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Err("503")
            }
        })
        .await;

        assert!(matches!(result, Err(AppError::Rpc(msg)) if msg.contains("broken")));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn hanging_call_times_out() {
        let result: Result<(), _> = with_retry(&fast_policy(2), "stuck", || async {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok::<(), &str>(())
        })
        .await;

        match result {
            Err(err @ AppError::RpcTimeout { .. }) => assert!(err.is_deferrable()),
            other => panic!("expected timeout, got {other:?}"),
        }
    }
}
