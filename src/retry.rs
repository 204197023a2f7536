//! Retry policy with exponential back-off and jitter.
//!
//! The policy is a pure decision function over the retry number: whether
//! another attempt is allowed and how long to wait before it. [`RetryPolicy::run`]
//! drives an async operation through it.

use std::future::Future;
use std::time::Duration;

use rand::Rng;

use crate::config::ConfigError;

/// Errors that can tell the retry loop whether another attempt makes sense
pub trait Retryable {
    fn is_retryable(&self) -> bool {
        true
    }
}

/// Back-off schedule applied between delivery attempts
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    max_retries: u32,
    delay: Option<Duration>,
    jitter: f64,
}

impl RetryPolicy {
    /// Create a policy, validating the jitter factor
    ///
    /// # Arguments
    ///
    /// * `max_retries` - Additional attempts after the first one fails
    /// * `delay` - Base back-off delay; `None` retries immediately
    /// * `jitter` - Random factor in `[0, 1]` applied to every computed delay
    pub fn new(max_retries: u32, delay: Option<Duration>, jitter: f64) -> Result<Self, ConfigError> {
        if !jitter.is_finite() || !(0.0..=1.0).contains(&jitter) {
            return Err(ConfigError::InvalidJitter(jitter.to_string()));
        }

        Ok(Self {
            max_retries,
            delay,
            jitter,
        })
    }

    /// A policy that never retries
    pub fn none() -> Self {
        Self {
            max_retries: 0,
            delay: None,
            jitter: 0.0,
        }
    }

    pub fn max_retries(&self) -> u32 {
        self.max_retries
    }

    pub fn delay(&self) -> Option<Duration> {
        self.delay
    }

    pub fn jitter(&self) -> f64 {
        self.jitter
    }

    /// Whether retry number `attempt` (1-based) is allowed
    pub fn should_retry(&self, attempt: u32) -> bool {
        attempt >= 1 && attempt <= self.max_retries
    }

    /// Delay before retry number `attempt`, or `None` to retry immediately
    pub fn backoff(&self, attempt: u32) -> Option<Duration> {
        self.backoff_with(attempt, &mut rand::thread_rng())
    }

    /// Same as [`RetryPolicy::backoff`] with a caller-provided random source
    pub fn backoff_with<R: Rng + ?Sized>(&self, attempt: u32, rng: &mut R) -> Option<Duration> {
        let nominal = self.nominal_delay(attempt)?;
        let factor = if self.jitter > 0.0 {
            rng.gen_range((1.0 - self.jitter)..=(1.0 + self.jitter))
        } else {
            1.0
        };
        Some(scale(nominal, factor))
    }

    /// Inclusive range every jittered delay for `attempt` falls into
    pub fn bounds(&self, attempt: u32) -> Option<(Duration, Duration)> {
        let nominal = self.nominal_delay(attempt)?;
        Some((
            scale(nominal, 1.0 - self.jitter),
            scale(nominal, 1.0 + self.jitter),
        ))
    }

    /// Exponential delay anchored at the base delay: `base * 2^(attempt - 1)`
    fn nominal_delay(&self, attempt: u32) -> Option<Duration> {
        let base = self.delay?;
        let exponent = attempt.saturating_sub(1).min(62) as i32;
        Some(scale(base, 2f64.powi(exponent)))
    }

    /// Run `operation` until it succeeds, fails with a non-retryable error,
    /// or the retries are exhausted.
    ///
    /// The closure receives the 0-based attempt number. The last error is
    /// returned when every attempt failed.
    pub async fn run<T, E, F, Fut>(&self, mut operation: F) -> Result<T, E>
    where
        E: Retryable + std::fmt::Display,
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let mut attempt = 0;
        loop {
            match operation(attempt).await {
                Ok(value) => return Ok(value),
                Err(e) => {
                    attempt += 1;
                    if !e.is_retryable() || !self.should_retry(attempt) {
                        return Err(e);
                    }

                    match self.backoff(attempt) {
                        Some(delay) => {
                            tracing::debug!("Attempt {} failed ({}), retrying in {:?}", attempt, e, delay);
                            tokio::time::sleep(delay).await;
                        }
                        None => {
                            tracing::debug!("Attempt {} failed ({}), retrying", attempt, e);
                        }
                    }
                }
            }
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::none()
    }
}

fn scale(duration: Duration, factor: f64) -> Duration {
    Duration::try_from_secs_f64(duration.as_secs_f64() * factor.max(0.0)).unwrap_or(Duration::MAX)
}
