// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Retry with exponential backoff for opening the embedded store.
//!
//! A store file can be briefly locked by another process (a previous
//! instance still shutting down, a backup tool). Opening retries a few
//! times before the provider is declared failed and the cache disabled.
//!
//! # Example
//!
//! ```
//! use query_cache::RetryConfig;
//!
//! let open = RetryConfig::store_open();
//! assert_eq!(open.max_attempts, 3);
//!
//! let once = RetryConfig::no_retry();
//! assert_eq!(once.max_attempts, 1);
//! ```

use std::future::Future;
use std::time::Duration;

use tokio::time::sleep;
use tracing::{info, warn};

#[derive(Debug, Clone)]
pub struct RetryConfig {
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub factor: f64,
    /// Total attempts including the first one. Always at least 1.
    pub max_attempts: usize,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self::store_open()
    }
}

impl RetryConfig {
    /// Opening the SQLite file: 3 attempts, ~350ms worst case.
    #[must_use]
    pub fn store_open() -> Self {
        Self {
            initial_delay: Duration::from_millis(50),
            max_delay: Duration::from_millis(500),
            factor: 3.0,
            max_attempts: 3,
        }
    }

    #[must_use]
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            ..Self::store_open()
        }
    }

    #[must_use]
    pub fn with_attempts(mut self, attempts: usize) -> Self {
        self.max_attempts = attempts.max(1);
        self
    }

    /// Delay before the attempt following `attempt` (1-based).
    #[must_use]
    pub fn delay_after(&self, attempt: usize) -> Duration {
        let exp = attempt.saturating_sub(1).min(16) as i32;
        self.initial_delay.mul_f64(self.factor.powi(exp)).min(self.max_delay)
    }

    #[cfg(test)]
    pub fn test() -> Self {
        Self {
            initial_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(5),
            factor: 2.0,
            max_attempts: 3,
        }
    }
}

pub async fn retry<F, Fut, T, E>(operation_name: &str, config: &RetryConfig, mut operation: F) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: std::fmt::Display,
{
    let max_attempts = config.max_attempts.max(1);
    let mut attempt = 0;

    loop {
        attempt += 1;
        match operation().await {
            Ok(val) => {
                if attempt > 1 {
                    info!(operation = operation_name, attempt, "Operation succeeded after retry");
                }
                return Ok(val);
            }
            Err(err) if attempt >= max_attempts => return Err(err),
            Err(err) => {
                let delay = config.delay_after(attempt);
                warn!(
                    operation = operation_name,
                    attempt,
                    max_attempts,
                    error = %err,
                    ?delay,
                    "Operation failed, retrying"
                );
                sleep(delay).await;
            }
        }
    }
}
