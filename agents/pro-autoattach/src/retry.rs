//! Retry Policy
//!
//! Fixed sequence of sleeps between attempts. Only errors the caller marks
//! as recoverable are retried; everything else propagates on the spot.

use std::fmt::Display;
use std::future::Future;
use std::time::Duration;
use tracing::{debug, warn};

/// Ordered sleeps between attempts, consumed left to right
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RetryPolicy {
    sleeps: Vec<Duration>,
}

impl RetryPolicy {
    pub fn new(sleeps: Vec<Duration>) -> Self {
        Self { sleeps }
    }

    /// Build from seconds, e.g. `[0.5, 1.0, 1.0]`
    pub fn from_secs(sleeps: &[f64]) -> Self {
        Self::new(sleeps.iter().map(|s| Duration::from_secs_f64(*s)).collect())
    }

    /// Single attempt, no retry
    pub fn none() -> Self {
        Self::default()
    }

    pub fn sleeps(&self) -> &[Duration] {
        &self.sleeps
    }

    /// Total attempts this policy allows
    pub fn max_attempts(&self) -> usize {
        self.sleeps.len() + 1
    }

    /// Run `op`, retrying while `is_recoverable` holds and sleeps remain
    ///
    /// Once the sleeps are exhausted the error of the final attempt is
    /// returned, whatever its kind.
    pub async fn run<T, E, F, Fut, P>(&self, is_recoverable: P, mut op: F) -> Result<T, E>
    where
        E: Display,
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        P: Fn(&E) -> bool,
    {
        let mut remaining = self.sleeps.iter();

        loop {
            let err = match op().await {
                Ok(value) => return Ok(value),
                Err(err) => err,
            };

            if !is_recoverable(&err) {
                debug!(error = %err, "Non-recoverable error, not retrying");
                return Err(err);
            }

            let Some(sleep) = remaining.next() else {
                warn!(error = %err, "Retries exhausted");
                return Err(err);
            };

            warn!(
                error = %err,
                retry_in_ms = sleep.as_millis() as u64,
                retries_left = remaining.len(),
                "Recoverable error, retrying"
            );
            tokio::time::sleep(*sleep).await;
        }
    }
}
