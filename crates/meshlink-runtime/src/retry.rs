//! Exponential backoff with jitter.
//!
//! Used in two places: the supervisor's relaunch delays (driven by the
//! configured [`RestartPolicy`]) and the fixed-interval polling that waits
//! for a freshly launched agent to start accepting connections.
//!
//! Jitter is seeded from the system clock so no `rand` dependency is needed.

use meshlink_types::RestartPolicy;
use std::time::Duration;
use tracing::{debug, warn};

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

/// Backoff parameters.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryConfig {
    /// Attempt ceiling. For retries this includes the first try; for
    /// relaunches it is the number of restarts allowed.
    pub max_attempts: u32,
    /// Delay before the first retry, in milliseconds.
    pub min_delay_ms: u64,
    /// Upper bound for any single delay, in milliseconds.
    pub max_delay_ms: u64,
    /// Jitter factor in `[0, 1]`. The delay is stretched by up to this fraction.
    pub jitter: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self::from(&RestartPolicy::default())
    }
}

impl From<&RestartPolicy> for RetryConfig {
    fn from(policy: &RestartPolicy) -> Self {
        Self {
            max_attempts: policy.max_restarts,
            min_delay_ms: policy.min_delay_ms,
            max_delay_ms: policy.max_delay_ms.max(policy.min_delay_ms),
            jitter: policy.jitter.clamp(0.0, 1.0),
        }
    }
}

impl RetryConfig {
    /// Constant `interval` between attempts for up to `window` in total.
    pub fn polling(window: Duration, interval: Duration) -> Self {
        let interval_ms = (interval.as_millis() as u64).max(1);
        let window_ms = window.as_millis() as u64;
        Self {
            max_attempts: (window_ms / interval_ms).saturating_add(1).min(u32::MAX as u64) as u32,
            min_delay_ms: interval_ms,
            max_delay_ms: interval_ms,
            jitter: 0.0,
        }
    }

    /// Whether restart number `attempt` (1-based) is still within the ceiling.
    pub fn allows(&self, attempt: u32) -> bool {
        attempt <= self.max_attempts
    }
}

/// Result of [`retry_async`].
#[derive(Debug)]
pub enum RetryOutcome<T, E> {
    Success { result: T, attempts: u32 },
    Exhausted { last_error: E, attempts: u32 },
}

impl<T, E> RetryOutcome<T, E> {
    pub fn into_result(self) -> Result<T, E> {
        match self {
            RetryOutcome::Success { result, .. } => Ok(result),
            RetryOutcome::Exhausted { last_error, .. } => Err(last_error),
        }
    }
}

// ---------------------------------------------------------------------------
// Backoff computation
// ---------------------------------------------------------------------------

/// Delay for a 0-indexed attempt:
/// `min(min_delay * 2^attempt, max_delay) * (1 + random * jitter)`, clamped
/// to `max_delay`.
pub fn compute_backoff(config: &RetryConfig, attempt: u32) -> u64 {
    let base = config
        .min_delay_ms
        .saturating_mul(1u64.checked_shl(attempt).unwrap_or(u64::MAX));
    let capped = base.min(config.max_delay_ms);

    if config.jitter <= 0.0 {
        return capped;
    }

    let stretched = (capped as f64) * (1.0 + pseudo_random_fraction() * config.jitter);
    (stretched as u64).min(config.max_delay_ms)
}

/// Value in `[0, 1)` from the clock's sub-second nanos. Not cryptographic.
fn pseudo_random_fraction() -> f64 {
    let nanos = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .subsec_nanos();
    let mixed = nanos.wrapping_mul(2654435761);
    (mixed as f64) / ((u32::MAX as f64) + 1.0)
}

// ---------------------------------------------------------------------------
// Retry loop
// ---------------------------------------------------------------------------

/// Run `operation` until it succeeds, `should_retry` rejects an error, or
/// `config.max_attempts` is reached.
pub async fn retry_async<F, Fut, T, E, P>(
    config: &RetryConfig,
    mut operation: F,
    should_retry: P,
) -> RetryOutcome<T, E>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T, E>>,
    P: Fn(&E) -> bool,
    E: std::fmt::Display,
{
    let max = config.max_attempts.max(1);
    let mut attempt = 0;

    loop {
        attempt += 1;
        let err = match operation().await {
            Ok(result) => {
                if attempt > 1 {
                    debug!(attempt, "Succeeded after {} failed attempts", attempt - 1);
                }
                return RetryOutcome::Success {
                    result,
                    attempts: attempt,
                };
            }
            Err(err) => err,
        };

        if !should_retry(&err) {
            debug!(attempt, "Not retryable: {err}");
            return RetryOutcome::Exhausted {
                last_error: err,
                attempts: attempt,
            };
        }
        if attempt >= max {
            warn!(attempt, max_attempts = max, "Retries exhausted: {err}");
            return RetryOutcome::Exhausted {
                last_error: err,
                attempts: attempt,
            };
        }

        let delay_ms = compute_backoff(config, attempt - 1);
        debug!(attempt, delay_ms, "Retrying after error: {err}");
        tokio::time::sleep(Duration::from_millis(delay_ms)).await;
    }
}
