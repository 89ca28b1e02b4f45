//! Retry Policy
//!
//! Every network call runs through [`RetryPolicy::run`]: a fixed per-attempt
//! timeout, and for timeout / rate-limit failures a sequence of awaited
//! exponential backoff delays with jitter up to an attempt ceiling.

use std::future::Future;
use std::time::Duration;

use rand::Rng;
use tracing::{debug, warn};

use super::classify::{classify, ErrorKind};
use crate::config::Config;
use crate::error::{Result, SyncError};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts, including the first
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub jitter: Duration,
    /// Per-attempt timeout
    pub timeout: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_config(&Config::default())
    }
}

impl RetryPolicy {
    pub fn from_config(config: &Config) -> Self {
        Self {
            max_attempts: config.retry_max_attempts.max(1),
            base_delay: Duration::from_millis(config.retry_base_ms),
            max_delay: Duration::from_millis(config.retry_max_ms),
            jitter: Duration::from_millis(config.retry_jitter_ms),
            timeout: config.request_timeout(),
        }
    }

    /// Backoff before retry number `attempt + 1`, without jitter:
    /// `min(base * 2^attempt, max_delay)`.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt);
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }

    fn jittered(&self, attempt: u32) -> Duration {
        let jitter_ms = self.jitter.as_millis() as u64;
        let extra = if jitter_ms == 0 {
            0
        } else {
            rand::rng().random_range(0..=jitter_ms)
        };
        self.backoff(attempt) + Duration::from_millis(extra)
    }

    /// Whether a failure of this kind is retried in place.
    pub fn retries(kind: ErrorKind) -> bool {
        matches!(kind, ErrorKind::Timeout | ErrorKind::RateLimit)
    }

    /// Runs `op` with the per-attempt timeout, retrying timeout and
    /// rate-limit failures. Returns the last error once the ceiling is hit.
    pub async fn run<T, F, Fut>(&self, operation: &str, mut op: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut attempt = 0u32;
        loop {
            let outcome = match tokio::time::timeout(self.timeout, op()).await {
                Ok(result) => result,
                Err(_) => Err(SyncError::Timeout(self.timeout)),
            };
            let err = match outcome {
                Ok(value) => return Ok(value),
                Err(err) => err,
            };

            attempt += 1;
            let kind = kind_of(&err);
            if !Self::retries(kind) {
                return Err(err);
            }
            if attempt >= self.max_attempts {
                warn!(operation, attempts = attempt, %kind, "Retries exhausted");
                return Err(err);
            }
            let delay = self.jittered(attempt - 1);
            debug!(operation, attempt, ?delay, %kind, "Retrying after backoff");
            tokio::time::sleep(delay).await;
        }
    }
}

fn kind_of(err: &SyncError) -> ErrorKind {
    match err {
        SyncError::Classified(classified) => classified.kind(),
        other => classify(other.status(), &other.to_string()).kind,
    }
}
