//! Retry policy for allocation and platform mapping
//!
//! The map path must never fail halfway and leave a partially built entry
//! behind, so transient exhaustion is absorbed by retrying. The default policy
//! retries until success; a bounded policy turns exhaustion into
//! [`Error::RetryExhausted`] instead.
//!
//! Waiting between attempts starts with [`crossbeam::utils::Backoff`]
//! spinning, then falls back to short sleeps once the backoff is completed.

use std::fmt;
use std::time::Duration;

use crossbeam::utils::Backoff;
use serde::{Deserialize, Serialize};
use tracing::{trace, warn};

use crate::error::{Error, Result};

/// Default sleep between attempts once spinning is exhausted (microseconds)
pub const DEFAULT_RETRY_SLEEP_US: u64 = 50;

/// Default number of failures between warnings
pub const DEFAULT_WARN_EVERY: u32 = 1000;

/// How often, and how patiently, a failing operation is retried.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Give up after this many failed attempts (`None` retries forever)
    pub max_attempts: Option<u32>,
    /// Sleep between attempts after the spin phase, in microseconds (0 yields)
    pub sleep_after_spin_us: u64,
    /// Emit a warning every this many consecutive failures (0 disables)
    pub warn_every: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: None,
            sleep_after_spin_us: DEFAULT_RETRY_SLEEP_US,
            warn_every: DEFAULT_WARN_EVERY,
        }
    }
}

/// A value produced by a retried operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Retried<T> {
    /// The successful result
    pub value: T,
    /// Failed attempts before the success
    pub retries: u32,
}

impl RetryPolicy {
    /// Retry forever.
    pub fn unbounded() -> Self {
        Self::default()
    }

    /// Give up after `max_attempts` failures.
    pub fn bounded(max_attempts: u32) -> Self {
        Self {
            max_attempts: Some(max_attempts),
            ..Self::default()
        }
    }

    /// Sleep duration used once spinning is exhausted.
    pub fn sleep_after_spin(&self) -> Duration {
        Duration::from_micros(self.sleep_after_spin_us)
    }

    /// Validate the policy.
    pub fn validate(&self) -> Result<()> {
        if self.max_attempts == Some(0) {
            return Err(Error::Config("max_attempts must be > 0 when set".into()));
        }
        Ok(())
    }

    /// Run `attempt` until it succeeds or the policy gives up.
    pub fn run<T, E, F>(&self, operation: &'static str, mut attempt: F) -> Result<Retried<T>>
    where
        E: fmt::Display,
        F: FnMut() -> std::result::Result<T, E>,
    {
        let backoff = Backoff::new();
        let mut failures: u32 = 0;

        loop {
            let err = match attempt() {
                Ok(value) => {
                    return Ok(Retried {
                        value,
                        retries: failures,
                    })
                }
                Err(e) => e,
            };

            failures = failures.saturating_add(1);

            if let Some(max) = self.max_attempts {
                if failures >= max {
                    warn!(operation, attempts = failures, "giving up: {}", err);
                    return Err(Error::RetryExhausted {
                        operation,
                        attempts: failures,
                    });
                }
            }

            if self.warn_every != 0 && failures % self.warn_every == 0 {
                warn!(operation, attempts = failures, "still retrying: {}", err);
            } else {
                trace!(operation, attempts = failures, "retrying: {}", err);
            }

            if !backoff.is_completed() {
                backoff.snooze();
            } else if self.sleep_after_spin_us == 0 {
                std::thread::yield_now();
            } else {
                std::thread::sleep(self.sleep_after_spin());
            }
        }
    }
}
