//! Bounded retries for history endpoint calls.
//!
//! A history fetch gets a small, fixed number of attempts. Transient
//! failures (endpoint hiccups, timeouts, a channel that is still coming up)
//! are retried with exponential backoff; everything else is returned at once
//! so a consumer learns about a bad request without waiting for the backoff.
//!
//! # Example
//!
//! ```
//! use moldwatch_core::{Error, RetryConfig, with_retry};
//!
//! # async fn example() -> Result<(), Error> {
//! let config = RetryConfig::for_query();
//! assert_eq!(config.max_attempts(), 3);
//!
//! let rows = with_retry(&config, "history query", || async {
//!     Ok::<_, Error>(42)
//! })
//! .await?;
//! # Ok(())
//! # }
//! ```

use std::future::Future;
use std::time::Duration;

use rand::Rng;
use tracing::{debug, warn};

use crate::error::{Error, Result};

/// Backoff policy for history queries.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Retries after the first attempt (0 = single attempt).
    pub max_retries: u32,
    /// Delay before the first retry.
    pub initial_delay: Duration,
    /// Upper bound for any single delay.
    pub max_delay: Duration,
    /// Growth factor between consecutive delays.
    pub backoff_multiplier: f64,
    /// Stretch each delay by up to 25% at random.
    pub jitter: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self::for_query()
    }
}

impl RetryConfig {
    /// Three attempts in total, starting at 500ms and doubling.
    ///
    /// A dead endpoint is reported to the consumer within a couple of
    /// seconds instead of being retried indefinitely.
    pub fn for_query() -> Self {
        Self {
            max_retries: 2,
            initial_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(5),
            backoff_multiplier: 2.0,
            jitter: true,
        }
    }

    /// A single attempt.
    pub fn none() -> Self {
        Self {
            max_retries: 0,
            ..Self::for_query()
        }
    }

    /// Set the number of retries.
    #[must_use]
    pub fn max_retries(mut self, retries: u32) -> Self {
        self.max_retries = retries;
        self
    }

    /// Set the first delay.
    #[must_use]
    pub fn initial_delay(mut self, delay: Duration) -> Self {
        self.initial_delay = delay;
        self
    }

    /// Set the delay cap.
    #[must_use]
    pub fn max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = delay;
        self
    }

    /// Set the growth factor.
    #[must_use]
    pub fn backoff_multiplier(mut self, multiplier: f64) -> Self {
        self.backoff_multiplier = multiplier;
        self
    }

    /// Enable or disable jitter.
    #[must_use]
    pub fn jitter(mut self, enabled: bool) -> Self {
        self.jitter = enabled;
        self
    }

    /// Total number of attempts, including the first one.
    pub fn max_attempts(&self) -> u32 {
        self.max_retries.saturating_add(1)
    }

    /// Delay to wait after the `failed`-th failed attempt (1-based).
    fn backoff(&self, failed: u32) -> Duration {
        let exponent = failed.saturating_sub(1).min(32) as i32;
        let factor = self.backoff_multiplier.max(1.0).powi(exponent);
        let cap = self.max_delay.as_secs_f64();
        let delay = Duration::from_secs_f64((self.initial_delay.as_secs_f64() * factor).min(cap));
        if self.jitter {
            delay.mul_f64(1.0 + rand::rng().random::<f64>() * 0.25)
        } else {
            delay
        }
    }
}

/// Run `operation` until it succeeds, fails terminally or runs out of attempts.
///
/// Terminal errors (see [`is_retryable`]) are returned from the attempt that
/// produced them. After the last attempt the last error is returned as is.
pub async fn with_retry<F, Fut, T>(config: &RetryConfig, operation_name: &str, operation: F) -> Result<T>
where
    F: Fn() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let attempts = config.max_attempts();
    let mut attempt = 1;
    loop {
        let error = match operation().await {
            Ok(value) => {
                if attempt > 1 {
                    debug!("{} succeeded on attempt {}", operation_name, attempt);
                }
                return Ok(value);
            }
            Err(e) => e,
        };

        if !is_retryable(&error) || attempt >= attempts {
            return Err(error);
        }

        let delay = config.backoff(attempt);
        warn!(
            "{} attempt {}/{} failed: {}; retrying in {:?}",
            operation_name, attempt, attempts, error, delay
        );
        tokio::time::sleep(delay).await;
        attempt += 1;
    }
}

/// Whether a failed attempt is worth repeating.
pub fn is_retryable(error: &Error) -> bool {
    match error {
        Error::Endpoint(_) | Error::Timeout { .. } | Error::Connection { .. } | Error::NotConnected => {
            true
        }
        // A `Query` error is already the verdict of a retry loop or a
        // rejected request
        Error::Query { .. }
        | Error::Subscription { .. }
        | Error::Normalization(_)
        | Error::Cancelled
        | Error::InvalidConfig(_)
        | Error::Parse(_) => false,
    }
}

/// Map a non-success HTTP status from the history endpoint to an error.
///
/// Server errors, `408 Request Timeout` and `429 Too Many Requests` are
/// transient. Any other status is a terminal [`Error::Query`].
pub fn endpoint_status_error(device_id: &str, status: u16, message: String) -> Error {
    if status >= 500 || status == 408 || status == 429 {
        Error::Endpoint(message)
    } else {
        Error::Query {
            device_id: device_id.to_string(),
            attempts: 1,
            reason: message,
        }
    }
}
