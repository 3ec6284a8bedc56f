//! Blocking submission with retry
//!
//! [`LoadLimiter::submit_until`] keeps resubmitting a rejected load, sleeping for the
//! delay suggested by each rejection, until it is accepted or the caller's budget runs out.
//!
//! Semantics:
//! - A rejection without a retry hint ends the loop at once with
//!   [`LoadLimiterError::RejectedNoRetryHint`]; it never busy-loops.
//! - A hint longer than the remaining budget ends the loop with
//!   [`LoadLimiterError::Timeout`] without sleeping, since acceptance could only come late.
//! - The budget is checked after every submission and again after waking, before the next
//!   submission, so a load is never committed after the timeout.
//! - Synchronization errors are returned as they are, never turned into timeouts.
//! - Cancellation is cooperative: a single in-flight `submit` is not interrupted.
//!
//! Sleeping goes through the limiter's [`crate::Sleeper`]; tests can inject
//! [`crate::AdvancingSleeper`] together with a [`crate::ManualClock`].

use crate::error::LoadLimiterError;
use crate::limiter::{LoadLimiter, SubmitResult};
use std::time::Duration;
use tracing::debug;

/// Shortest pause between two attempts, so that a zero hint cannot spin.
const MIN_RETRY_PAUSE: Duration = Duration::from_millis(1);

/// States of a `submit_until` run. `Accepted`, `RejectedTerminal` and `TimedOut` are
/// terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryState {
    /// About to submit.
    Pending,
    /// The load was committed.
    Accepted,
    /// Rejected; sleep for the delay, then submit again.
    RejectedRetryable(Duration),
    /// Rejected with no hint; waiting cannot help.
    RejectedTerminal,
    /// The budget is exhausted.
    TimedOut,
}

impl RetryState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Accepted | Self::RejectedTerminal | Self::TimedOut)
    }

    /// Transition after a submission that finished `elapsed` into a `timeout` budget.
    pub fn after_submit(result: &SubmitResult, elapsed: Duration, timeout: Duration) -> Self {
        if result.accepted {
            return Self::Accepted;
        }
        let Some(delay) = result.retry_in() else {
            return Self::RejectedTerminal;
        };
        let delay = delay.max(MIN_RETRY_PAUSE);
        match timeout.checked_sub(elapsed) {
            Some(remaining) if delay <= remaining => Self::RejectedRetryable(delay),
            _ => Self::TimedOut,
        }
    }

    /// Transition after waking from a sleep, `elapsed` into a `timeout` budget.
    pub fn after_wake(elapsed: Duration, timeout: Duration) -> Self {
        if elapsed > timeout {
            Self::TimedOut
        } else {
            Self::Pending
        }
    }
}

impl LoadLimiter {
    /// Submit `amount` for `tenant`, retrying after each suggested delay until accepted or
    /// until `timeout` has elapsed.
    pub async fn submit_until(
        &self,
        tenant: &str,
        amount: u64,
        timeout: Duration,
    ) -> Result<(), LoadLimiterError> {
        let clock = self.inner.clock.clone();
        let started = clock.now_millis();
        let elapsed = || Duration::from_millis(clock.now_millis().saturating_sub(started));

        let mut state = RetryState::Pending;
        let mut attempts = 0usize;
        loop {
            state = match state {
                RetryState::Pending => {
                    attempts += 1;
                    let result = self.submit(tenant, amount).await?;
                    RetryState::after_submit(&result, elapsed(), timeout)
                }
                RetryState::RejectedRetryable(delay) => {
                    debug!(target: "loadgate::retry", tenant = %tenant, amount, attempts, delay_ms = delay.as_millis() as u64, "waiting before resubmitting");
                    self.inner.sleeper.sleep(delay).await;
                    RetryState::after_wake(elapsed(), timeout)
                }
                RetryState::Accepted => return Ok(()),
                RetryState::RejectedTerminal => {
                    return Err(LoadLimiterError::RejectedNoRetryHint {
                        requested: amount,
                        max_load: self.inner.config.max_load(),
                    });
                }
                RetryState::TimedOut => {
                    let elapsed = elapsed();
                    debug!(target: "loadgate::retry", tenant = %tenant, amount, attempts, elapsed_ms = elapsed.as_millis() as u64, "gave up waiting for capacity");
                    return Err(LoadLimiterError::Timeout { elapsed, timeout });
                }
            };
        }
    }
}
