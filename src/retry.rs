//! Retry utilities with exponential backoff
//!
//! The core never retries a call on its own. Callers (and [`Client`] when a
//! [`RetryConfig`] is configured) consult a [`BackoffAdvisor`] to decide
//! whether and when to try again.
//!
//! # Examples
//!
//! ```rust,no_run
//! use llm_wire::retry::{retry_with_advisor, RetryConfig};
//! use std::time::Duration;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let config = RetryConfig::default()
//!     .with_max_attempts(3)
//!     .with_initial_delay(Duration::from_secs(1));
//!
//! let result = retry_with_advisor(&config, || async {
//!     // Your async operation here
//!     Ok::<_, llm_wire::Error>(42)
//! }).await?;
//! # Ok(())
//! # }
//! ```
//!
//! [`Client`]: crate::Client

use crate::{Error, Result};
use std::future::Future;
use std::time::Duration;
use tokio::time::sleep;

/// Decides whether a failed attempt should be retried.
pub trait BackoffAdvisor: Send + Sync {
    /// `attempt` is zero-based: 0 is the attempt that just failed first.
    /// Returns the delay before the next attempt and whether to make one.
    fn advise_backoff(&self, error: &Error, attempt: u32) -> (Duration, bool);
}

/// Configuration for retry behavior
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Maximum number of attempts, the first one included
    pub max_attempts: u32,

    /// Initial delay before first retry
    pub initial_delay: Duration,

    /// Maximum delay between retries
    pub max_delay: Duration,

    /// Multiplier for exponential backoff (e.g., 2.0 doubles the delay each time)
    pub backoff_multiplier: f64,

    /// Add random jitter to prevent thundering herd (0.0 to 1.0)
    pub jitter_factor: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
            backoff_multiplier: 2.0,
            jitter_factor: 0.1,
        }
    }
}

impl RetryConfig {
    /// Create a new retry configuration
    pub fn new() -> Self {
        Self::default()
    }

    /// Set maximum number of attempts
    pub fn with_max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = attempts;
        self
    }

    /// Set initial delay
    pub fn with_initial_delay(mut self, delay: Duration) -> Self {
        self.initial_delay = delay;
        self
    }

    /// Set maximum delay
    pub fn with_max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = delay;
        self
    }

    /// Set backoff multiplier
    pub fn with_backoff_multiplier(mut self, multiplier: f64) -> Self {
        self.backoff_multiplier = multiplier;
        self
    }

    /// Set jitter factor (0.0 to 1.0)
    pub fn with_jitter_factor(mut self, jitter: f64) -> Self {
        self.jitter_factor = jitter.clamp(0.0, 1.0);
        self
    }

    /// Delay before the retry that follows failed attempt `attempt`
    pub fn calculate_delay(&self, attempt: u32) -> Duration {
        let base_delay_ms = self.initial_delay.as_millis() as f64;
        let exponential_delay = base_delay_ms * self.backoff_multiplier.powi(attempt as i32);
        let capped_delay = exponential_delay.min(self.max_delay.as_millis() as f64);

        let jitter_range = capped_delay * self.jitter_factor;
        let jitter = rand::random::<f64>() * jitter_range;
        let final_delay = capped_delay + jitter - (jitter_range / 2.0);

        Duration::from_millis(final_delay.max(0.0) as u64)
    }

    fn has_attempts_left(&self, attempt: u32) -> bool {
        attempt.saturating_add(1) < self.max_attempts
    }
}

/// Retries transient errors until `max_attempts` is reached.
impl BackoffAdvisor for RetryConfig {
    fn advise_backoff(&self, error: &Error, attempt: u32) -> (Duration, bool) {
        let retry = self.has_attempts_left(attempt) && is_retryable_error(error);
        (self.calculate_delay(attempt), retry)
    }
}

/// Retries every error, transient or not.
struct Unconditional<'a>(&'a RetryConfig);

impl BackoffAdvisor for Unconditional<'_> {
    fn advise_backoff(&self, _error: &Error, attempt: u32) -> (Duration, bool) {
        (self.0.calculate_delay(attempt), self.0.has_attempts_left(attempt))
    }
}

/// Run `operation` until it succeeds or `advisor` declines another attempt.
/// The last error is returned as is.
pub async fn retry_with_advisor<A, F, Fut, T>(advisor: &A, mut operation: F) -> Result<T>
where
    A: BackoffAdvisor + ?Sized,
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut attempt = 0u32;
    loop {
        match operation().await {
            Ok(result) => return Ok(result),
            Err(err) => {
                let (delay, retry) = advisor.advise_backoff(&err, attempt);
                if !retry {
                    return Err(err);
                }
                log::debug!(
                    "attempt {} failed ({}), retrying in {:?}",
                    attempt + 1,
                    err,
                    delay
                );
                sleep(delay).await;
                attempt += 1;
            }
        }
    }
}

/// Retry an async operation with exponential backoff, whatever the error
///
/// ```rust,no_run
/// use llm_wire::retry::{retry_with_backoff, RetryConfig};
///
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let config = RetryConfig::default().with_max_attempts(3);
/// let value = retry_with_backoff(config, || async { Ok::<_, llm_wire::Error>(1) }).await?;
/// # Ok(())
/// # }
/// ```
pub async fn retry_with_backoff<F, Fut, T>(config: RetryConfig, operation: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    retry_with_advisor(&Unconditional(&config), operation).await
}

/// Determine if an error is retryable
///
/// Returns true for transient errors like network issues, timeouts, rate
/// limits and 5xx server errors. Returns false for client errors,
/// configuration errors, provider-reported failures, cancellation and
/// protocol incompatibilities.
pub fn is_retryable_error(error: &Error) -> bool {
    match error {
        Error::Http(_) => true,
        Error::Timeout => true,
        Error::Stream(_) => true,
        Error::Api { status, .. } => *status >= 500 || *status == 429,
        Error::ConnectionClosed { .. } | Error::WebSocket(_) => !error.is_protocol_incompatible(),
        _ => false,
    }
}
