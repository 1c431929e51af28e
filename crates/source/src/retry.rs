//! Retry logic with exponential backoff and jitter.
//!
//! Only retryable failures (see [`keel_core::Error::is_retryable`]) are
//! retried. Permanent errors return immediately.

use std::future::Future;
use std::time::Duration;

use keel_core::{Result, RetryConfig};
use rand::Rng;
use tracing::warn;

/// Default retry configuration.
const DEFAULT_MAX_RETRIES: u32 = 3;
const DEFAULT_BASE_DELAY_MS: u64 = 100;
const DEFAULT_MAX_DELAY_MS: u64 = 10_000;
const DEFAULT_JITTER_FACTOR: f64 = 0.1;

/// Retry policy configuration.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Maximum number of retry attempts
    pub max_retries: u32,
    /// Base delay for exponential backoff (milliseconds)
    pub base_delay_ms: u64,
    /// Maximum delay between retries (milliseconds)
    pub max_delay_ms: u64,
    /// Jitter factor to add randomness (0.0 - 1.0)
    pub jitter_factor: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: DEFAULT_MAX_RETRIES,
            base_delay_ms: DEFAULT_BASE_DELAY_MS,
            max_delay_ms: DEFAULT_MAX_DELAY_MS,
            jitter_factor: DEFAULT_JITTER_FACTOR,
        }
    }
}

impl From<&RetryConfig> for RetryPolicy {
    fn from(config: &RetryConfig) -> Self {
        Self {
            max_retries: config.max_retries,
            base_delay_ms: config.base_delay_ms,
            max_delay_ms: config.max_delay_ms,
            jitter_factor: config.jitter_factor,
        }
    }
}

impl RetryPolicy {
    /// Create a new retry policy with custom settings.
    pub const fn new(max_retries: u32, base_delay_ms: u64, max_delay_ms: u64) -> Self {
        Self {
            max_retries,
            base_delay_ms,
            max_delay_ms,
            jitter_factor: DEFAULT_JITTER_FACTOR,
        }
    }

    /// Set jitter factor.
    #[must_use]
    pub const fn with_jitter(mut self, jitter_factor: f64) -> Self {
        self.jitter_factor = jitter_factor;
        self
    }

    /// Calculate delay for the given attempt number using exponential backoff with jitter.
    ///
    /// Delay formula: min(base_delay * 2^attempt, max_delay) + jitter
    pub fn calculate_delay(&self, attempt: u32) -> Duration {
        let exponential_delay = self
            .base_delay_ms
            .saturating_mul(2_u64.saturating_pow(attempt));
        let capped_delay = exponential_delay.min(self.max_delay_ms);

        #[allow(clippy::cast_precision_loss, clippy::cast_possible_truncation, clippy::cast_sign_loss)]
        let jitter_ms = {
            let jitter_range = (capped_delay as f64) * self.jitter_factor;
            if jitter_range > 0.0 {
                rand::thread_rng().gen_range(0.0..jitter_range).floor() as u64
            } else {
                0
            }
        };

        Duration::from_millis(capped_delay.saturating_add(jitter_ms))
    }

    /// Create a retry state for tracking attempts.
    pub fn state(&self) -> RetryState {
        RetryState::new(self.clone())
    }

    /// Run `operation` until it succeeds, fails permanently, or retries run out.
    ///
    /// `operation` receives the zero-based attempt number.
    ///
    /// # Errors
    ///
    /// Returns the last error once retries are exhausted, or the first
    /// non-retryable error.
    pub async fn run<T, F, Fut>(&self, what: &str, mut operation: F) -> Result<T>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut state = self.state();
        loop {
            match operation(state.current_attempt()).await {
                Ok(value) => return Ok(value),
                Err(e) if e.is_retryable() => match state.next_retry() {
                    Some(delay) => {
                        warn!(
                            operation = what,
                            attempt = state.current_attempt(),
                            max_retries = self.max_retries,
                            delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                            error = %e,
                            "Retrying after failure"
                        );
                        tokio::time::sleep(delay).await;
                    }
                    None => return Err(e),
                },
                Err(e) => return Err(e),
            }
        }
    }
}

/// Retry state for tracking retry attempts.
#[derive(Debug, Clone)]
pub struct RetryState {
    policy: RetryPolicy,
    attempt: u32,
}

impl RetryState {
    /// Create a new retry state.
    pub const fn new(policy: RetryPolicy) -> Self {
        Self { policy, attempt: 0 }
    }

    /// Get current attempt number (0-indexed).
    pub const fn current_attempt(&self) -> u32 {
        self.attempt
    }

    /// Check if more retries are available.
    pub const fn can_retry(&self) -> bool {
        self.attempt < self.policy.max_retries
    }

    /// Record a retry attempt and get the delay before next retry.
    ///
    /// Returns None if no more retries are available.
    pub fn next_retry(&mut self) -> Option<Duration> {
        if !self.can_retry() {
            return None;
        }

        let delay = self.policy.calculate_delay(self.attempt);
        self.attempt = self.attempt.saturating_add(1);
        Some(delay)
    }

    /// Reset retry state to initial state.
    pub fn reset(&mut self) {
        self.attempt = 0;
    }
}
