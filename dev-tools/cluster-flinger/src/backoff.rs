// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Polling remote conditions with exponential backoff.

use std::future::Future;
use std::time::Duration;
use thiserror::Error;

pub use ::backoff::backoff::Backoff;
pub use ::backoff::ExponentialBackoff;

/// Return a backoff policy for polling a service that was just launched and
/// is expected to come up within seconds to a few minutes.
pub fn readiness_policy() -> ExponentialBackoff {
    const INITIAL_INTERVAL: Duration = Duration::from_millis(250);
    const MAX_INTERVAL: Duration = Duration::from_secs(5);
    policy_with_max(INITIAL_INTERVAL, MAX_INTERVAL)
}

fn policy_with_max(
    initial_interval: Duration,
    max_interval: Duration,
) -> ExponentialBackoff {
    let current_interval = initial_interval;
    ExponentialBackoff {
        current_interval,
        initial_interval,
        multiplier: 2.0,
        max_interval,
        // Deadlines are enforced by `wait_for_condition` itself.
        max_elapsed_time: None,
        ..ExponentialBackoff::default()
    }
}

/// Result of one check in [`wait_for_condition`].
#[derive(Debug)]
pub enum CondCheckError<E> {
    /// The condition does not hold yet; check again later.
    NotYet,
    /// Checking failed in a way that will not resolve by waiting.
    Failed(E),
}

impl<E> From<E> for CondCheckError<E> {
    fn from(error: E) -> Self {
        CondCheckError::Failed(error)
    }
}

#[derive(Debug, Error)]
pub enum PollError<E: std::error::Error + 'static> {
    #[error("timed out after {0:?}")]
    TimedOut(Duration),

    #[error("permanent error")]
    PermanentError(#[source] E),
}

/// Call `cond` until it returns `Ok`, a permanent error, or `timeout`
/// elapses, sleeping between attempts according to `policy`.
///
/// The deadline runs on tokio's clock, so tests with paused time see it
/// advance along with their sleeps.
pub async fn wait_for_condition<O, E, Func, Fut>(
    mut policy: ExponentialBackoff,
    timeout: Duration,
    mut cond: Func,
) -> Result<O, PollError<E>>
where
    E: std::error::Error + 'static,
    Func: FnMut() -> Fut,
    Fut: Future<Output = Result<O, CondCheckError<E>>>,
{
    let start = tokio::time::Instant::now();
    let deadline = start + timeout;
    policy.reset();

    loop {
        match cond().await {
            Ok(value) => return Ok(value),
            Err(CondCheckError::Failed(error)) => {
                return Err(PollError::PermanentError(error))
            }
            Err(CondCheckError::NotYet) => (),
        }

        let now = tokio::time::Instant::now();
        if now >= deadline {
            return Err(PollError::TimedOut(now - start));
        }
        let interval = policy.next_backoff().unwrap_or(policy.max_interval);
        tokio::time::sleep(interval.min(deadline - now)).await;
    }
}
