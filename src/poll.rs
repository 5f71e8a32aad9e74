//! Poll-until-or-timeout primitive
//!
//! Shared by boot readiness, address resolution, service readiness and
//! shutdown confirmation. The check is always run at least once, and once
//! more at the deadline, so a condition that flips during the final sleep
//! is still observed.

use crate::error::VmgateResult;
use std::future::Future;
use std::time::Duration;
use tokio::time::{sleep, Instant};
use tracing::trace;

/// Interval and deadline for a polled wait
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollSpec {
    pub interval: Duration,
    pub timeout: Duration,
}

impl PollSpec {
    pub fn new(interval: Duration, timeout: Duration) -> Self {
        Self { interval, timeout }
    }

    /// Run `check` until it yields a value or the deadline passes.
    ///
    /// Returns `Ok(None)` on timeout; errors from `check` abort the wait.
    pub async fn until<T, F, Fut>(&self, what: &str, mut check: F) -> VmgateResult<Option<T>>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = VmgateResult<Option<T>>>,
    {
        let started = Instant::now();
        let deadline = started + self.timeout;
        let mut attempts = 0u32;

        loop {
            attempts += 1;
            if let Some(value) = check().await? {
                trace!(what, attempts, "condition met");
                return Ok(Some(value));
            }

            let now = Instant::now();
            if now >= deadline {
                trace!(what, attempts, "deadline elapsed");
                return Ok(None);
            }
            sleep(self.interval.min(deadline - now)).await;
        }
    }

    /// Boolean form of [`PollSpec::until`]
    pub async fn until_true<F, Fut>(&self, what: &str, mut check: F) -> VmgateResult<bool>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = VmgateResult<bool>>,
    {
        let met = self
            .until(what, || {
                let fut = check();
                async move { Ok(fut.await?.then_some(())) }
            })
            .await?;
        Ok(met.is_some())
    }

    /// Whole seconds of the deadline, for error messages
    pub fn timeout_secs(&self) -> u64 {
        self.timeout.as_secs()
    }
}
