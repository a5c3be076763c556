//! Retry policy with exponential backoff
//!
//! `delay(attempt) = min(cap, base * multiplier^attempt)`. A rate-limited
//! error carrying a server `retry_after` uses that wait instead. Exhaustion
//! returns the last error unchanged.

use std::future::Future;
use std::time::Duration;

use serde::Deserialize;
use tracing::{debug, warn};

use crate::error::{AuthError, Result};

fn default_max_retries() -> u32 {
    3
}

fn default_base_delay_ms() -> u64 {
    500
}

fn default_multiplier() -> f64 {
    2.0
}

fn default_max_delay_ms() -> u64 {
    10_000
}

/// Backoff parameters. Deserializes from the `[auth.retry]` config table.
#[derive(Debug, Clone, Deserialize)]
pub struct RetryPolicy {
    /// Retries after the first attempt (total attempts = max_retries + 1)
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
    #[serde(default = "default_multiplier")]
    pub multiplier: f64,
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            base_delay_ms: default_base_delay_ms(),
            multiplier: default_multiplier(),
            max_delay_ms: default_max_delay_ms(),
        }
    }
}

impl RetryPolicy {
    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn with_delays(mut self, base: Duration, cap: Duration) -> Self {
        self.base_delay_ms = base.as_millis() as u64;
        self.max_delay_ms = cap.as_millis() as u64;
        self
    }

    /// Computed backoff before retry number `attempt` (0-based).
    pub fn delay(&self, attempt: u32) -> Duration {
        let factor = self.multiplier.max(1.0).powi(attempt.min(64) as i32);
        let millis = (self.base_delay_ms as f64 * factor).min(self.max_delay_ms as f64);
        Duration::from_millis(millis as u64)
    }

    /// Wait before retrying after `err`, honouring a server hint.
    pub fn delay_for(&self, err: &AuthError, attempt: u32) -> Duration {
        err.retry_after().unwrap_or_else(|| self.delay(attempt))
    }

    /// Whether `err` on the given 0-based attempt should be retried.
    pub fn should_retry(&self, err: &AuthError, attempt: u32) -> bool {
        err.is_retryable() && attempt < self.max_retries
    }

    /// Run `op` until it succeeds, fails non-retryably, or retries run out.
    pub async fn run<T, F, Fut>(&self, label: &str, mut op: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut attempt = 0u32;
        loop {
            match op().await {
                Ok(value) => {
                    if attempt > 0 {
                        debug!(operation = label, attempts = attempt + 1, "succeeded after retry");
                    }
                    return Ok(value);
                }
                Err(e) if self.should_retry(&e, attempt) => {
                    let delay = self.delay_for(&e, attempt);
                    warn!(
                        operation = label,
                        attempt = attempt + 1,
                        max_retries = self.max_retries,
                        delay_ms = delay.as_millis() as u64,
                        code = %e.code(),
                        error = %e,
                        "retryable failure, backing off"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => {
                    if e.is_retryable() {
                        warn!(operation = label, attempts = attempt + 1, error = %e, "retries exhausted");
                    }
                    return Err(e);
                }
            }
        }
    }
}
