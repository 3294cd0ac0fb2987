// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Bounded retries for backend calls and platform paging.
//!
//! Every Redis and SQL call goes through [`retry`] with one of the presets
//! below. Platform fetches use [`retry_when`] so that only transient errors
//! (rate limits, timeouts) are retried, at a flat delay.
//!
//! ```
//! use tally_engine::RetryConfig;
//! use std::time::Duration;
//!
//! assert_eq!(RetryConfig::startup().attempts, 5);
//! assert_eq!(RetryConfig::query().attempts, 3);
//!
//! let paging = RetryConfig::paging(Duration::from_secs(1), 5);
//! assert_eq!(paging.delays().take(3).collect::<Vec<_>>(), vec![Duration::from_secs(1); 3]);
//! ```

use std::fmt::Display;
use std::future::Future;
use std::time::Duration;

use tracing::{debug, warn};

/// How many times to attempt an operation and how long to wait in between.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryConfig {
    /// Total attempts, the first one included. Never zero.
    pub attempts: usize,
    pub first_delay: Duration,
    pub delay_cap: Duration,
    pub multiplier: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self::query()
    }
}

impl RetryConfig {
    /// Backend connections at startup: 5 attempts, giving up after roughly
    /// five seconds so a bad URL surfaces quickly.
    #[must_use]
    pub fn startup() -> Self {
        Self {
            attempts: 5,
            first_delay: Duration::from_millis(200),
            delay_cap: Duration::from_secs(2),
            multiplier: 2.0,
        }
    }

    /// Single store reads and writes.
    #[must_use]
    pub fn query() -> Self {
        Self {
            attempts: 3,
            first_delay: Duration::from_millis(100),
            delay_cap: Duration::from_secs(2),
            multiplier: 2.0,
        }
    }

    /// Flat `delay` between history page fetches.
    #[must_use]
    pub fn paging(delay: Duration, attempts: usize) -> Self {
        Self {
            attempts: attempts.max(1),
            first_delay: delay,
            delay_cap: delay,
            multiplier: 1.0,
        }
    }

    #[cfg(test)]
    pub fn test() -> Self {
        Self {
            attempts: 3,
            first_delay: Duration::from_millis(1),
            delay_cap: Duration::from_millis(10),
            multiplier: 2.0,
        }
    }

    /// The wait before each retry, in order. Unbounded; callers stop after
    /// `attempts - 1` of them.
    pub fn delays(&self) -> impl Iterator<Item = Duration> + '_ {
        std::iter::successors(Some(self.first_delay.min(self.delay_cap)), move |prev| {
            Some(prev.mul_f64(self.multiplier).min(self.delay_cap))
        })
    }
}

/// Runs `operation` until it succeeds or `config.attempts` are used up,
/// returning the last error.
pub async fn retry<F, Fut, T, E>(op: &str, config: &RetryConfig, operation: F) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: Display,
{
    retry_when(op, config, |_| true, operation).await
}

/// [`retry`], except an error that `retryable` rejects is returned at once.
pub async fn retry_when<F, Fut, T, E, P>(
    op: &str,
    config: &RetryConfig,
    retryable: P,
    mut operation: F,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: Display,
    P: Fn(&E) -> bool,
{
    let attempts = config.attempts.max(1);
    let mut delays = config.delays();
    let mut attempt = 1;

    loop {
        let err = match operation().await {
            Ok(value) => {
                if attempt > 1 {
                    debug!(op, attempt, "Recovered after retry");
                }
                return Ok(value);
            }
            Err(err) => err,
        };

        if attempt >= attempts || !retryable(&err) {
            return Err(err);
        }

        // `delays()` never ends.
        let wait = delays.next().unwrap_or(config.delay_cap);
        warn!(op, attempt, attempts, error = %err, wait_ms = wait.as_millis() as u64, "Retrying");
        tokio::time::sleep(wait).await;
        attempt += 1;
    }
}
