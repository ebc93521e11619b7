use std::sync::Arc;
use std::time::Duration;

use crate::api::{ByteStream, ChatTransport};
use crate::config::EngineConfig;
use crate::error::{EngineError, EngineResult};
use crate::models::ChatRequest;
use crate::rate_limit::{endpoint_key, RateLimiter};

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    /// Attempts including the first.
    pub attempts: u32,
    pub base_delay: Duration,
    /// Hard deadline for each attempt.
    pub timeout: Duration,
}

impl RetryPolicy {
    pub fn from_config(config: &EngineConfig) -> Self {
        Self {
            attempts: config.retry_attempts.max(1),
            base_delay: config.retry_delay(),
            timeout: config.timeout(),
        }
    }

    /// Wait after the failed attempt numbered `attempt` (zero based).
    pub fn backoff(&self, attempt: u32) -> Duration {
        self.base_delay.saturating_mul(2u32.saturating_pow(attempt))
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_config(&EngineConfig::default())
    }
}

/// Rate-limited network call with a per-attempt deadline and exponential backoff.
pub struct RetryingTransport {
    inner: Arc<dyn ChatTransport>,
    limiter: Arc<RateLimiter>,
    policy: RetryPolicy,
    endpoint_key: String,
}

impl RetryingTransport {
    pub fn new(inner: Arc<dyn ChatTransport>, limiter: Arc<RateLimiter>, policy: RetryPolicy) -> Self {
        let endpoint_key = endpoint_key("POST", inner.endpoint());
        Self { inner, limiter, policy, endpoint_key }
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    pub fn remaining_admissions(&self) -> u32 {
        self.limiter.remaining(&self.endpoint_key)
    }

    /// Sends the request, retrying transient failures.
    ///
    /// A rate-limit rejection fails immediately and does not consume an
    /// attempt. 4xx answers and aborts propagate on the first occurrence.
    pub async fn send(&self, request: &ChatRequest) -> EngineResult<ByteStream> {
        let mut attempt = 0;
        loop {
            self.limiter.try_admit(&self.endpoint_key)?;

            let result = match tokio::time::timeout(self.policy.timeout, self.inner.open_stream(request)).await {
                Ok(result) => result,
                Err(_) => Err(EngineError::Timeout(self.policy.timeout)),
            };

            let err = match result {
                Ok(body) => {
                    if attempt > 0 {
                        log::info!("Request to {} succeeded on attempt {}", self.endpoint_key, attempt + 1);
                    }
                    return Ok(body);
                }
                Err(err) => err,
            };

            if !err.is_retryable() {
                log::warn!("Request to {} failed with non-retryable error: {}", self.endpoint_key, err);
                return Err(err);
            }
            if attempt + 1 >= self.policy.attempts {
                log::error!(
                    "Request to {} failed after {} attempts: {}",
                    self.endpoint_key,
                    attempt + 1,
                    err
                );
                return Err(err);
            }

            let delay = self.policy.backoff(attempt);
            log::warn!(
                "Attempt {}/{} to {} failed ({}), retrying in {:?}",
                attempt + 1,
                self.policy.attempts,
                self.endpoint_key,
                err,
                delay
            );
            tokio::time::sleep(delay).await;
            attempt += 1;
        }
    }
}
