//! Retry policy with exponential backoff
//!
//! A single policy object shared by the provider pool and the object storage
//! adapter. Callers classify errors as transient; only transient failures are
//! retried, and never past an optional deadline.
//!
//! # Example
//!
//! ```rust
//! use panorama_tsdb::retry::RetryPolicy;
//! use std::time::Duration;
//!
//! let policy = RetryPolicy {
//!     jitter: false,
//!     ..Default::default()
//! };
//! assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(200));
//! ```

use std::future::Future;
use std::time::Duration;
use tokio::time::Instant;
use tracing::debug;

/// Retry policy with exponential backoff
#[derive(Clone, Debug, PartialEq)]
pub struct RetryPolicy {
    /// Maximum number of retry attempts after the first call
    /// Default: 3
    pub max_retries: u32,

    /// Initial delay between retries
    /// Default: 100ms
    pub initial_delay: Duration,

    /// Maximum delay between retries
    /// Default: 5 seconds
    pub max_delay: Duration,

    /// Multiplier for exponential backoff
    /// Default: 2.0
    pub multiplier: f64,

    /// Add random jitter to delays
    /// Default: true
    pub jitter: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(5),
            multiplier: 2.0,
            jitter: true,
        }
    }
}

impl RetryPolicy {
    /// A policy that never retries
    pub fn none() -> Self {
        Self {
            max_retries: 0,
            ..Default::default()
        }
    }

    /// Calculate delay for a given attempt number (0-indexed)
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let base_delay =
            self.initial_delay.as_millis() as f64 * self.multiplier.powi(attempt as i32);

        let delay_ms = base_delay.min(self.max_delay.as_millis() as f64);

        let final_delay = if self.jitter {
            // Add up to 25% jitter
            let jitter = rand::random::<f64>() * 0.25;
            delay_ms * (1.0 + jitter)
        } else {
            delay_ms
        };

        Duration::from_millis(final_delay as u64)
    }

    /// Check if we should retry after the given attempt
    pub fn should_retry(&self, attempt: u32) -> bool {
        attempt < self.max_retries
    }

    /// Run `op` until it succeeds, fails permanently, or retries run out
    ///
    /// `is_transient` decides whether an error may be retried. When a
    /// `deadline` is given, a retry whose backoff would end past the deadline
    /// is not attempted and the last error is returned instead.
    pub async fn run<F, Fut, T, E>(
        &self,
        operation: &str,
        deadline: Option<Instant>,
        is_transient: impl Fn(&E) -> bool,
        mut op: F,
    ) -> Result<T, E>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: std::fmt::Display,
    {
        let mut attempt = 0;
        loop {
            match op().await {
                Ok(value) => return Ok(value),
                Err(e) => {
                    if !self.should_retry(attempt) || !is_transient(&e) {
                        return Err(e);
                    }
                    let delay = self.delay_for_attempt(attempt);
                    if let Some(deadline) = deadline {
                        if Instant::now() + delay >= deadline {
                            debug!(operation, attempt, "Retry skipped: deadline would be exceeded");
                            return Err(e);
                        }
                    }
                    debug!(
                        operation,
                        attempt = attempt + 1,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "Transient failure, retrying"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                },
            }
        }
    }
}
