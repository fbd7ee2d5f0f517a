// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Exponential backoff policy.
//!
//! The request executor and the change subscriber run their own attempt loops
//! (they need per-attempt timeouts, error classification and cancellation) and
//! only borrow delays from [`RetryConfig::delay_for`]. [`retry`] is the plain
//! loop used for local startup work such as opening the state store.
//!
//! ```
//! use site_sync::RetryConfig;
//! use std::time::Duration;
//!
//! let policy = RetryConfig::default();
//! assert_eq!(policy.delay_for(0), Duration::from_secs(1));
//! assert_eq!(policy.delay_for(2), Duration::from_secs(4));
//! assert_eq!(policy.delay_for(10), Duration::from_secs(30));
//! ```

use std::fmt::Display;
use std::future::Future;
use std::time::Duration;

use tracing::{debug, warn};

/// Backoff policy: `initial_delay * factor^n`, capped at `max_delay`.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryConfig {
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub factor: f64,
    /// Total attempts allowed; `None` retries forever.
    pub max_retries: Option<usize>,
}

impl Default for RetryConfig {
    /// Three attempts at 1s, 2s, 4s... capped at 30s.
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            factor: 2.0,
            max_retries: Some(3),
        }
    }
}

impl RetryConfig {
    /// Local startup work: five quick attempts, giving up within a few seconds.
    #[must_use]
    pub fn startup() -> Self {
        Self {
            initial_delay: Duration::from_millis(200),
            max_delay: Duration::from_secs(2),
            factor: 2.0,
            max_retries: Some(5),
        }
    }

    /// Delay to wait after `failures` consecutive failures (zero-based).
    #[must_use]
    pub fn delay_for(&self, failures: u32) -> Duration {
        let scaled = self.initial_delay.as_secs_f64() * self.factor.powi(failures.min(32) as i32);
        if scaled.is_finite() && scaled < self.max_delay.as_secs_f64() {
            Duration::from_secs_f64(scaled)
        } else {
            self.max_delay
        }
    }

    /// Whether `attempts` made so far use up the budget.
    #[must_use]
    pub fn is_exhausted(&self, attempts: usize) -> bool {
        self.max_retries.is_some_and(|max| attempts >= max)
    }
}

/// Run `operation` until it succeeds or the policy's attempts run out.
/// Returns the last error on exhaustion.
pub async fn retry<F, Fut, T, E>(label: &str, policy: &RetryConfig, mut operation: F) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: Display,
{
    let mut attempts = 0usize;
    loop {
        let err = match operation().await {
            Ok(value) => {
                if attempts > 0 {
                    debug!(label, retries = attempts, "Succeeded after retrying");
                }
                return Ok(value);
            }
            Err(err) => err,
        };

        attempts += 1;
        if policy.is_exhausted(attempts) {
            warn!(label, attempts, error = %err, "Giving up");
            return Err(err);
        }
        let delay = policy.delay_for(attempts as u32 - 1);
        warn!(label, attempts, error = %err, delay_ms = delay.as_millis() as u64, "Attempt failed, backing off");
        tokio::time::sleep(delay).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn quick(max: usize) -> RetryConfig {
        RetryConfig {
            initial_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(5),
            factor: 2.0,
            max_retries: Some(max),
        }
    }

    #[tokio::test]
    async fn flaky_open_eventually_succeeds() {
        let calls = AtomicUsize::new(0);
        let result: Result<&str, String> = retry("open", &quick(5), || {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if n < 2 {
                    Err(format!("locked ({})", n))
                } else {
                    Ok("pool")
                }
            }
        })
        .await;

        assert_eq!(result, Ok("pool"));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn exhaustion_returns_last_error() {
        let calls = AtomicUsize::new(0);
        let result: Result<(), String> = retry("open", &quick(4), || {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            async move { Err(format!("attempt {}", n)) }
        })
        .await;

        assert_eq!(result, Err("attempt 3".to_string()));
        assert_eq!(calls.load(Ordering::SeqCst), 4);
    }

    #[test]
    fn delays_double_until_capped() {
        let policy = RetryConfig::default();
        let delays: Vec<u64> = (0..7).map(|n| policy.delay_for(n).as_secs()).collect();
        assert_eq!(delays, vec![1, 2, 4, 8, 16, 30, 30]);
        assert_eq!(policy.delay_for(u32::MAX), Duration::from_secs(30));
    }

    #[test]
    fn unbounded_policy_is_never_exhausted() {
        let policy = RetryConfig { max_retries: None, ..RetryConfig::startup() };
        assert!(!policy.is_exhausted(usize::MAX));
        assert!(RetryConfig::startup().is_exhausted(5));
        assert!(!RetryConfig::startup().is_exhausted(4));
    }
}
