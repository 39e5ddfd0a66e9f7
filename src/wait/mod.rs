//! Bounded polling with a deadline.
//!
//! Address resolution, tunnel setup, provisioning, and several drivers all
//! retry an operation until it succeeds or a time budget runs out. They
//! share [`poll_until`], which guarantees the budget is exhausted exactly at
//! the deadline rather than one interval early or late.

use std::fmt;
use std::future::Future;
use std::time::Duration;

use tokio::time::{Instant, sleep, timeout};
use tracing::debug;

/// Time budget and retry cadence for one polling loop.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct PollPolicy {
    /// Total time allowed, measured from the first attempt.
    pub timeout: Duration,
    /// Pause between attempts.
    pub interval: Duration,
}

impl PollPolicy {
    /// Creates a policy.
    #[must_use]
    pub const fn new(timeout: Duration, interval: Duration) -> Self {
        Self { timeout, interval }
    }
}

/// Raised when a polling loop runs out of time.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Exhausted<E> {
    /// Number of attempts made.
    pub attempts: u32,
    /// Time spent polling.
    pub elapsed: Duration,
    /// Error from the most recent failed attempt, if any attempt failed
    /// rather than reporting "not yet".
    pub last_error: Option<E>,
    /// Whether the final attempt was still running when the deadline
    /// passed.
    pub stalled: bool,
}

impl<E: fmt::Display> Exhausted<E> {
    /// Renders the last error, or a generic note when every attempt simply
    /// reported "not yet".
    #[must_use]
    pub fn describe_last(&self) -> String {
        if self.stalled {
            return String::from("the last attempt did not finish before the deadline");
        }
        self.last_error.as_ref().map_or_else(
            || String::from("no attempt succeeded"),
            ToString::to_string,
        )
    }
}

/// Repeats `attempt` until it yields a value or `policy.timeout` elapses.
///
/// Each attempt returns `Ok(Some(value))` on success, `Ok(None)` when the
/// condition is not met yet, or `Err(error)` for a transient failure that is
/// absorbed and retried. At least one attempt is always made; a zero timeout
/// means exactly one, which then runs to completion. The final attempt runs
/// at the deadline itself.
///
/// With a non-zero timeout every attempt is cut off at the deadline, so an
/// attempt that hangs cannot hold the loop past it.
///
/// # Errors
///
/// Returns [`Exhausted`] carrying the last transient error once the deadline
/// passes without success.
pub async fn poll_until<T, E, F, Fut>(
    what: &str,
    policy: PollPolicy,
    mut attempt: F,
) -> Result<T, Exhausted<E>>
where
    E: fmt::Display,
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<Option<T>, E>>,
{
    let started = Instant::now();
    let deadline = started + policy.timeout;
    let mut attempts = 0_u32;
    let mut last_error = None;

    loop {
        attempts = attempts.saturating_add(1);
        let pending = attempt(attempts);
        let outcome = if policy.timeout.is_zero() {
            Some(pending.await)
        } else {
            timeout(deadline.saturating_duration_since(Instant::now()), pending)
                .await
                .ok()
        };
        let stalled = outcome.is_none();
        match outcome {
            Some(Ok(Some(value))) => return Ok(value),
            Some(Ok(None)) => debug!(what, attempts, "not ready yet"),
            Some(Err(err)) => {
                debug!(what, attempts, error = %err, "attempt failed; retrying");
                last_error = Some(err);
            }
            None => debug!(what, attempts, "attempt still running at the deadline"),
        }

        let now = Instant::now();
        if now >= deadline {
            return Err(Exhausted {
                attempts,
                elapsed: now.duration_since(started),
                last_error,
                stalled,
            });
        }
        sleep(policy.interval.min(deadline.duration_since(now))).await;
    }
}
