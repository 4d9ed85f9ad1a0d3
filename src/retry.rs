use std::future::Future;
use std::time::Duration;

use rand::Rng;
use tokio_util::sync::CancellationToken;

use crate::error::{FleetError, Result};

/// Exponential backoff with jitter for calls against remote APIs.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Retries after the first attempt.
    pub max_retries: u32,
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub factor: f64,
    /// Fraction of the delay to randomize in both directions, e.g. 0.25 for ±25%.
    pub jitter: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            factor: 2.0,
            jitter: 0.25,
        }
    }
}

impl RetryPolicy {
    /// No retries at all.
    pub fn none() -> Self {
        Self {
            max_retries: 0,
            ..Self::default()
        }
    }

    /// Delay before retry number `attempt` (0-based), without jitter.
    pub fn base_delay(&self, attempt: u32) -> Duration {
        let scaled = self.initial_delay.as_secs_f64() * self.factor.powi(attempt as i32);
        let capped = scaled.min(self.max_delay.as_secs_f64());
        Duration::from_secs_f64(capped.max(0.0))
    }

    /// Delay before retry number `attempt`, jittered and capped at `max_delay`.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let base = self.base_delay(attempt).as_secs_f64();
        let jitter = self.jitter.clamp(0.0, 1.0);
        let spread = if jitter > 0.0 {
            rand::thread_rng().gen_range(-jitter..=jitter)
        } else {
            0.0
        };
        let jittered = (base * (1.0 + spread)).min(self.max_delay.as_secs_f64());
        Duration::from_secs_f64(jittered.max(0.0))
    }
}

/// Linear backoff used between connection attempts: `base * (attempt + 1)`.
pub fn linear_backoff(base: Duration, attempt: u32) -> Duration {
    base.saturating_mul(attempt.saturating_add(1))
}

/// Sleep for `delay` unless `cancel` fires first.
pub async fn sleep_or_cancel(delay: Duration, cancel: &CancellationToken) -> Result<()> {
    tokio::select! {
        _ = cancel.cancelled() => Err(FleetError::Cancelled),
        _ = tokio::time::sleep(delay) => Ok(()),
    }
}

/// Run `op` until it succeeds, fails with a non-transient error, or the policy is exhausted.
pub async fn retry<T, F, Fut>(
    policy: &RetryPolicy,
    cancel: &CancellationToken,
    what: &str,
    mut op: F,
) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut attempt = 0;
    loop {
        if cancel.is_cancelled() {
            return Err(FleetError::Cancelled);
        }
        match op().await {
            Ok(value) => return Ok(value),
            Err(e) if e.is_transient() && attempt < policy.max_retries => {
                let delay = policy.delay_for(attempt);
                tracing::warn!(
                    operation = what,
                    attempt = attempt + 1,
                    delay_ms = delay.as_millis() as u64,
                    error = %e,
                    "Transient failure, retrying"
                );
                sleep_or_cancel(delay, cancel).await?;
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn fast() -> RetryPolicy {
        RetryPolicy {
            initial_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(5),
            ..RetryPolicy::default()
        }
    }

    #[test]
    fn delays_grow_exponentially_and_cap() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.base_delay(0), Duration::from_secs(1));
        assert_eq!(policy.base_delay(1), Duration::from_secs(2));
        assert_eq!(policy.base_delay(2), Duration::from_secs(4));
        assert_eq!(policy.base_delay(10), Duration::from_secs(30));
    }

    #[test]
    fn jitter_stays_within_bounds() {
        let policy = RetryPolicy::default();
        for _ in 0..100 {
            let d = policy.delay_for(1).as_secs_f64();
            assert!((1.5..=2.5).contains(&d), "delay {} out of range", d);
        }
        for _ in 0..100 {
            assert!(policy.delay_for(8) <= policy.max_delay);
        }
    }

    #[test]
    fn linear_backoff_scales_with_attempt() {
        let base = Duration::from_millis(500);
        assert_eq!(linear_backoff(base, 0), Duration::from_millis(500));
        assert_eq!(linear_backoff(base, 2), Duration::from_millis(1500));
    }

    #[tokio::test]
    async fn retries_transient_errors_until_success() {
        let counter = AtomicU32::new(0);
        let calls = &counter;
        let cancel = CancellationToken::new();
        let result = retry(&fast(), &cancel, "test", move || async move {
            if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                Err(FleetError::Timeout("slow".to_string()))
            } else {
                Ok(42)
            }
        })
        .await;

        assert_eq!(result.unwrap(), 42);
        assert_eq!(counter.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn permanent_errors_are_not_retried() {
        let counter = AtomicU32::new(0);
        let calls = &counter;
        let cancel = CancellationToken::new();
        let result: Result<()> = retry(&fast(), &cancel, "test", move || async move {
            calls.fetch_add(1, Ordering::SeqCst);
            Err(FleetError::Unauthorized("bad token".to_string()))
        })
        .await;

        assert!(matches!(result, Err(FleetError::Unauthorized(_))));
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn gives_up_after_max_retries() {
        let counter = AtomicU32::new(0);
        let calls = &counter;
        let cancel = CancellationToken::new();
        let result: Result<()> = retry(&fast(), &cancel, "test", move || async move {
            calls.fetch_add(1, Ordering::SeqCst);
            Err(FleetError::Timeout("slow".to_string()))
        })
        .await;

        assert!(result.is_err());
        assert_eq!(counter.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn cancelled_before_start() {
        let cancel = CancellationToken::new();
        cancel.cancel();
        let result: Result<()> = retry(&fast(), &cancel, "test", || async { Ok(()) }).await;
        assert!(matches!(result, Err(FleetError::Cancelled)));
    }
}
