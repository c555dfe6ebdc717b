//! Backoff for renegotiating after a failed round
//!
//! Only errors that [`TesseraError::is_retryable`] accepts are retried, and
//! every retry is a brand-new round: fresh session key, fresh nonces, fresh
//! signatures. Nothing from a failed round is carried forward.

use std::future::Future;
use std::time::Duration;
use tessera_core::{RetryConfig, TesseraError};

/// Backoff strategy for retry delays
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackoffStrategy {
    /// Fixed delay between retries
    Fixed,
    /// Exponential increase: delay * 2^attempt
    Exponential,
    /// Exponential with up to 10% jitter
    ExponentialWithJitter,
}

impl BackoffStrategy {
    /// Delay before retry number `attempt` (zero-based)
    pub fn calculate_delay(
        &self,
        attempt: u32,
        initial_delay: Duration,
        max_delay: Duration,
    ) -> Duration {
        use rand::Rng;

        let delay = match self {
            BackoffStrategy::Fixed => initial_delay,
            BackoffStrategy::Exponential => initial_delay.saturating_mul(2u32.saturating_pow(attempt)),
            BackoffStrategy::ExponentialWithJitter => {
                let base = initial_delay.saturating_mul(2u32.saturating_pow(attempt));
                let jitter =
                    (base.as_millis() as f64 * 0.1 * rand::thread_rng().gen::<f64>()) as u64;
                base.saturating_add(Duration::from_millis(jitter))
            }
        };

        delay.min(max_delay)
    }
}

/// Retry policy for whole negotiation rounds
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Maximum number of retries (0 = single attempt)
    pub max_attempts: u32,
    /// Delay before the first retry
    pub initial_delay: Duration,
    /// Cap on any single delay
    pub max_delay: Duration,
    /// Backoff strategy
    pub strategy: BackoffStrategy,
}

impl RetryPolicy {
    /// Exponential policy from client configuration
    pub fn from_config(config: &RetryConfig) -> Self {
        Self {
            max_attempts: config.max_attempts,
            initial_delay: Duration::from_millis(config.initial_delay_ms),
            max_delay: Duration::from_millis(config.max_delay_ms),
            strategy: BackoffStrategy::Exponential,
        }
    }

    /// Single attempt, no retries
    pub fn none() -> Self {
        Self {
            max_attempts: 0,
            initial_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
            strategy: BackoffStrategy::Fixed,
        }
    }

    /// Enable or disable jitter
    pub fn with_jitter(mut self, enable: bool) -> Self {
        self.strategy = if enable {
            BackoffStrategy::ExponentialWithJitter
        } else {
            BackoffStrategy::Exponential
        };
        self
    }

    /// Delay before retry number `attempt`
    pub fn calculate_delay(&self, attempt: u32) -> Duration {
        self.strategy
            .calculate_delay(attempt, self.initial_delay, self.max_delay)
    }

    /// Run `operation` until it succeeds, fails with a non-retryable error,
    /// or the attempt budget runs out.
    pub async fn execute<F, Fut, T>(&self, mut operation: F) -> Result<T, TesseraError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, TesseraError>>,
    {
        let mut attempt = 0;

        loop {
            match operation().await {
                Ok(result) => return Ok(result),
                Err(err) => {
                    if !err.is_retryable() || attempt >= self.max_attempts {
                        return Err(err);
                    }

                    let delay = self.calculate_delay(attempt);
                    tracing::info!(
                        attempt = attempt + 1,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "round failed; retrying with a new round"
                    );
                    tokio::time::sleep(delay).await;

                    attempt += 1;
                }
            }
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_config(&RetryConfig::default())
    }
}
