//! Jittered retry delays.
//!
//! [`backoff`] spreads concurrent retries by up to 20% either side of the
//! requested interval. [`grow_interval`] doubles an interval up to a ceiling
//! and is used by [`retry`] to space out repeated failures such as API rate
//! limiting. The readiness poller keeps a fixed cadence and only applies
//! [`backoff`] jitter.

use std::fmt::Display;
use std::future::Future;
use std::time::Duration;

use rand::Rng;
use tokio::time::sleep;
use tracing::warn;

const JITTER_LOWER_NUMERATOR: u32 = 4;
const JITTER_UPPER_NUMERATOR: u32 = 6;
const JITTER_DENOMINATOR: u32 = 5;

/// Returns `base` with uniform jitter in the range `[0.8 * base, 1.2 * base]`.
///
/// `max` is not applied here; callers escalating an interval cap it with
/// [`grow_interval`]. When the jitter bounds cannot be computed `base` is
/// returned unchanged.
#[must_use]
pub fn backoff(base: Duration, max: Duration) -> Duration {
    backoff_with(base, max, &mut rand::thread_rng())
}

/// Variant of [`backoff`] that draws from the supplied random source.
#[must_use]
pub fn backoff_with<R: Rng + ?Sized>(base: Duration, _max: Duration, rng: &mut R) -> Duration {
    let Some((lower, upper)) = jitter_bounds(base) else {
        return base;
    };
    if lower >= upper {
        return base;
    }
    rng.gen_range(lower..=upper)
}

fn jitter_bounds(interval: Duration) -> Option<(Duration, Duration)> {
    let lower = interval
        .checked_mul(JITTER_LOWER_NUMERATOR)?
        .checked_div(JITTER_DENOMINATOR)?;
    let upper = interval
        .checked_mul(JITTER_UPPER_NUMERATOR)?
        .checked_div(JITTER_DENOMINATOR)?;
    Some((lower, upper))
}

/// Doubles `current`, capped at `max`.
#[must_use]
pub fn grow_interval(current: Duration, max: Duration) -> Duration {
    current.saturating_mul(2).min(max)
}

/// Spacing applied by [`retry`] between attempts.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct RetryPolicy {
    /// Interval used before the second attempt.
    pub initial: Duration,
    /// Ceiling for the escalated interval.
    pub max: Duration,
    /// Total number of attempts, including the first.
    pub max_attempts: u32,
}

impl RetryPolicy {
    /// Creates a policy.
    #[must_use]
    pub const fn new(initial: Duration, max: Duration, max_attempts: u32) -> Self {
        Self {
            initial,
            max,
            max_attempts,
        }
    }

    /// Policy that never retries.
    #[must_use]
    pub const fn no_retry() -> Self {
        Self::new(Duration::ZERO, Duration::ZERO, 1)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(Duration::from_secs(2), Duration::from_secs(30), 5)
    }
}

/// Runs `operation` until it succeeds, fails with an error that
/// `is_retryable` rejects, or the policy runs out of attempts.
///
/// `operation` receives the 1-based attempt number.
///
/// # Errors
///
/// Returns the last error produced by `operation`.
pub async fn retry<T, E, Op, Fut, C>(
    policy: &RetryPolicy,
    is_retryable: C,
    mut operation: Op,
) -> Result<T, E>
where
    Op: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, E>>,
    C: Fn(&E) -> bool,
    E: Display,
{
    let mut interval = policy.initial;
    let mut attempt: u32 = 1;
    loop {
        match operation(attempt).await {
            Ok(value) => return Ok(value),
            Err(err) if attempt < policy.max_attempts && is_retryable(&err) => {
                let delay = backoff(interval, policy.max);
                warn!(attempt, ?delay, error = %err, "retrying after transient failure");
                sleep(delay).await;
                interval = grow_interval(interval, policy.max);
                attempt = attempt.saturating_add(1);
            }
            Err(err) => return Err(err),
        }
    }
}
