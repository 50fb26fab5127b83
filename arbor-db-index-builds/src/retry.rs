//! Bounded retry with exponential backoff
//!
//! Replication-state races (not-primary, bounded lock waits expiring) are
//! expected conditions, not failures. Phases wrap their lock-and-mutate
//! sections in [`with_retries`] so the race is an explicit, testable state
//! instead of ad-hoc sleeps. Only errors classified transient are retried;
//! everything else propagates on first occurrence, and exhaustion returns the
//! last transient error for the caller to escalate.

use crate::error::{IndexBuildError, Result};
use std::future::Future;
use std::time::Duration;
use tracing::debug;

/// Backoff policy for a retry loop
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Total attempts, including the first
    pub max_attempts: u32,
    /// Backoff before the second attempt
    pub initial_backoff: Duration,
    /// Backoff ceiling
    pub max_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 20,
            initial_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_secs(30),
        }
    }
}

impl RetryPolicy {
    /// Policy with the given attempt bound and default backoff
    pub fn with_max_attempts(max_attempts: u32) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            ..Self::default()
        }
    }

    /// Backoff before attempt `attempt + 1` (`attempt` is 0-based)
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exp = attempt.min(20);
        let factor = 1u64.checked_shl(exp).unwrap_or(u64::MAX);
        let millis = (self.initial_backoff.as_millis() as u64)
            .saturating_mul(factor)
            .min(self.max_backoff.as_millis() as u64);
        Duration::from_millis(millis)
    }
}

/// Run `op` until it succeeds, fails non-transiently, or exhausts the policy.
pub async fn with_retries<T, F, Fut>(policy: &RetryPolicy, op_name: &str, mut op: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut attempt = 0u32;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(err) if err.is_transient() && attempt + 1 < policy.max_attempts => {
                let backoff = policy.backoff(attempt);
                debug!(
                    op = op_name,
                    attempt,
                    backoff_ms = backoff.as_millis() as u64,
                    error = %err,
                    "Retrying after transient error"
                );
                tokio::time::sleep(backoff).await;
                attempt += 1;
            }
            Err(err) => return Err(err),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn test_backoff_doubles_and_caps() {
        let policy = RetryPolicy {
            max_attempts: 10,
            initial_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_millis(450),
        };
        assert_eq!(policy.backoff(0), Duration::from_millis(100));
        assert_eq!(policy.backoff(1), Duration::from_millis(200));
        assert_eq!(policy.backoff(2), Duration::from_millis(400));
        assert_eq!(policy.backoff(3), Duration::from_millis(450));
        // Saturates rather than overflowing for absurd attempt counts.
        assert_eq!(policy.backoff(u32::MAX), Duration::from_millis(450));
    }

    #[tokio::test(start_paused = true)]
    async fn test_retries_transient_until_success() {
        let calls = AtomicU32::new(0);
        let result = with_retries(&RetryPolicy::default(), "test", || async {
            if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                Err(IndexBuildError::LockTimeout("collection"))
            } else {
                Ok(7)
            }
        })
        .await
        .unwrap();
        assert_eq!(result, 7);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_non_transient_not_retried() {
        let calls = AtomicU32::new(0);
        let err = with_retries(&RetryPolicy::default(), "test", || async {
            calls.fetch_add(1, Ordering::SeqCst);
            Err::<(), _>(IndexBuildError::ConstraintViolation("dup".into()))
        })
        .await
        .unwrap_err();
        assert_eq!(err, IndexBuildError::ConstraintViolation("dup".into()));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhaustion_returns_last_error() {
        let policy = RetryPolicy {
            max_attempts: 3,
            initial_backoff: Duration::from_millis(1),
            max_backoff: Duration::from_millis(2),
        };
        let calls = AtomicU32::new(0);
        let err = with_retries(&policy, "test", || async {
            calls.fetch_add(1, Ordering::SeqCst);
            Err::<(), _>(IndexBuildError::NotPrimary("stepped down".into()))
        })
        .await
        .unwrap_err();
        assert!(matches!(err, IndexBuildError::NotPrimary(_)));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }
}
