// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Bounded-time polling primitives.
//!
//! Two flavors live here: [`wait_for_condition`], a plain
//! check-immediately-then-every-interval wait, and
//! [`poll_until_consistent`], a debounce that only succeeds once the
//! condition has held across a run of consecutive checks. The latter
//! guards against acting on a single lucky observation of flapping state
//! (DNS answers appearing and disappearing while a pod becomes ready).

use std::future::Future;
use std::time::Duration;

use thiserror::Error;
use tokio::time::sleep;
use tokio::time::Instant;

/// Result of one condition check inside [`wait_for_condition`].
#[derive(Debug, PartialEq)]
pub enum CondCheckError<E> {
    /// Not done yet; check again after the poll interval.
    NotYet,
    /// Stop polling; the underlying check failed for good.
    Failed(E),
}

impl<E> From<E> for CondCheckError<E> {
    fn from(err: E) -> Self {
        CondCheckError::Failed(err)
    }
}

#[derive(Debug, Error, PartialEq)]
pub enum PollError<E: std::error::Error> {
    #[error("poll timed out after {0:?}")]
    TimedOut(Duration),

    #[error("poll condition failed permanently")]
    PermanentError(#[source] E),
}

/// Invokes `cond` immediately and then at `poll_interval` until it
/// succeeds, returns a permanent error, or `poll_max` has elapsed.
pub async fn wait_for_condition<T, E, Func, Fut>(
    mut cond: Func,
    poll_interval: &Duration,
    poll_max: &Duration,
) -> Result<T, PollError<E>>
where
    E: std::error::Error,
    Func: FnMut() -> Fut,
    Fut: Future<Output = Result<T, CondCheckError<E>>>,
{
    let poll_start = Instant::now();
    loop {
        match cond().await {
            Ok(value) => return Ok(value),
            Err(CondCheckError::Failed(err)) => {
                return Err(PollError::PermanentError(err));
            }
            Err(CondCheckError::NotYet) => (),
        }
        if poll_start.elapsed() >= *poll_max {
            return Err(PollError::TimedOut(*poll_max));
        }
        sleep(*poll_interval).await;
    }
}

/// Parameters for [`poll_until_consistent`].
///
/// The defaults (5-minute window, 15 confirmations, 1-second interval)
/// are tuned for DNS convergence of pods on a statefulset and are kept
/// as-is for every caller that does not override them.
#[derive(Debug, Clone, Copy)]
pub struct ConsistencyPolicy {
    /// Overall deadline for the whole poll.
    pub window: Duration,
    /// Number of additional consecutive successes required after the
    /// first before the condition counts as stable.
    pub confirmations: u32,
    /// Delay between outer attempts, and between the first success and
    /// the confirmation run.
    pub interval: Duration,
}

impl Default for ConsistencyPolicy {
    fn default() -> ConsistencyPolicy {
        ConsistencyPolicy {
            window: Duration::from_secs(5 * 60),
            confirmations: 15,
            interval: Duration::from_secs(1),
        }
    }
}

#[derive(Debug, Error, PartialEq)]
#[error("poll did not hold consistently within {window:?}")]
pub struct ConsistencyTimeout {
    pub window: Duration,
}

/// Polls until `poll` has returned `true` for one initial check plus
/// `confirmations` consecutive follow-up checks.
///
/// A single `false` during the confirmation run discards all progress;
/// the outer loop then starts over after one interval. Only the gap
/// between the initial success and the confirmation run waits; the
/// confirmation checks themselves run back to back. If no full run
/// completes within the window, the poll fails.
pub async fn poll_until_consistent<Func, Fut>(
    policy: &ConsistencyPolicy,
    mut poll: Func,
) -> Result<(), ConsistencyTimeout>
where
    Func: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = Instant::now() + policy.window;
    while Instant::now() < deadline {
        if poll().await {
            sleep(policy.interval).await;
            let mut consistent = true;
            for _ in 0..policy.confirmations {
                if !poll().await {
                    consistent = false;
                    break;
                }
            }
            if consistent {
                return Ok(());
            }
        }
        sleep(policy.interval).await;
    }
    Err(ConsistencyTimeout { window: policy.window })
}
