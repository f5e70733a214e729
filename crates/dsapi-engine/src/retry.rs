//! Bounded retry with exponential backoff and jitter.
//!
//! The operation reports each failed attempt as either
//! [`RetryError::Transient`] (sleep and try again) or [`RetryError::Stop`]
//! (surface immediately). After a failed attempt the primitive sleeps
//! `base + rand(0..base/2)` and doubles `base`. Sleeps are interrupted by
//! request cancellation.

use std::future::Future;
use std::time::Duration;

use rand::Rng;
use tracing::debug;

use crate::context::RequestContext;
use crate::error::{DsError, Result};

/// Failure of a single attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetryError {
    /// Worth another attempt.
    Transient(DsError),
    /// Do not retry; return this error now.
    Stop(DsError),
}

impl From<DsError> for RetryError {
    fn from(err: DsError) -> Self {
        RetryError::Transient(err)
    }
}

/// Attempt budget for one retry loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryBudget {
    /// Maximum number of attempts (not retries).
    pub max_attempts: u32,
    /// Delay after the first failure; doubled after each subsequent one.
    pub base_delay: Duration,
}

impl RetryBudget {
    /// Creates a budget.
    pub const fn new(max_attempts: u32, base_delay: Duration) -> Self {
        Self {
            max_attempts,
            base_delay,
        }
    }

    /// Upper bound on the total time spent sleeping when every attempt fails.
    pub fn max_total_sleep(&self) -> Duration {
        let mut total = Duration::ZERO;
        let mut base = self.base_delay;
        for _ in 1..self.max_attempts {
            total += base + base / 2;
            base *= 2;
        }
        total
    }
}

/// Delay after a failure given the current base: `base + rand(0..base/2)`.
pub fn jittered(base: Duration) -> Duration {
    let half_ms = (base.as_millis() / 2) as u64;
    if half_ms == 0 {
        return base;
    }
    let jitter = rand::thread_rng().gen_range(0..half_ms);
    base + Duration::from_millis(jitter)
}

/// Invokes `op` up to `budget.max_attempts` times.
///
/// Returns the first success, the error of a `Stop`, or the last transient
/// error once the budget is exhausted. Cancellation of `ctx` during a sleep
/// returns `Cancelled`.
pub async fn retry<T, F, Fut>(ctx: &RequestContext, budget: RetryBudget, mut op: F) -> Result<T>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = std::result::Result<T, RetryError>>,
{
    let attempts = budget.max_attempts.max(1);
    let mut base = budget.base_delay;
    let mut attempt = 0u32;

    loop {
        attempt += 1;
        match op(attempt).await {
            Ok(value) => return Ok(value),
            Err(RetryError::Stop(e)) => {
                debug!(attempt, error = %e, "retry: stop requested");
                return Err(e);
            }
            Err(RetryError::Transient(e)) => {
                if matches!(e, DsError::Cancelled) || attempt >= attempts {
                    debug!(attempt, error = %e, "retry: giving up");
                    return Err(e);
                }
                let delay = jittered(base);
                debug!(attempt, delay_ms = delay.as_millis() as u64, error = %e, "retry: backing off");
                ctx.sleep(delay).await?;
                base *= 2;
            }
        }
    }
}
