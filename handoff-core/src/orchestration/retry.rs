use std::future::Future;
use std::time::Duration;

use tracing::warn;

use super::config::RetryConfig;
use crate::error::{HandoffError, Result};

/// Capped exponential backoff around a collaborator call.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RetryPolicy {
    max_attempts: u16,
    base: Duration,
    max: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_config(&RetryConfig::default())
    }
}

impl RetryPolicy {
    pub fn new(max_attempts: u16, base: Duration, max: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            base,
            max: max.max(base),
        }
    }

    pub fn from_config(config: &RetryConfig) -> Self {
        Self::new(
            config.max_attempts,
            config.backoff_base(),
            config.backoff_max(),
        )
    }

    /// A policy that runs the operation exactly once.
    pub fn none() -> Self {
        Self::new(1, Duration::ZERO, Duration::ZERO)
    }

    pub fn max_attempts(&self) -> u16 {
        self.max_attempts
    }

    /// Delay before attempt `attempt + 1`, where `attempt` starts at 1.
    pub fn delay_after(&self, attempt: u16) -> Duration {
        let exponent = u32::from(attempt.saturating_sub(1)).min(16);
        self.base.saturating_mul(1u32 << exponent).min(self.max)
    }

    /// Only collaborator failures are worth another attempt; everything
    /// else is deterministic.
    pub fn is_retryable(err: &HandoffError) -> bool {
        matches!(err, HandoffError::Collaborator(_))
    }

    /// Runs `op` until it succeeds, returns a non-retryable error, or the
    /// attempt budget is spent. `op` receives the 1-based attempt number.
    pub async fn run<T, F, Fut>(&self, mut op: F) -> Result<T>
    where
        F: FnMut(u16) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut attempt = 1;
        loop {
            match op(attempt).await {
                Ok(value) => return Ok(value),
                Err(err) if attempt < self.max_attempts && Self::is_retryable(&err) => {
                    let delay = self.delay_after(attempt);
                    warn!(
                        target: "handoff::worker",
                        attempt,
                        max_attempts = self.max_attempts,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "collaborator call failed; retrying"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(err) => return Err(err),
            }
        }
    }
}
