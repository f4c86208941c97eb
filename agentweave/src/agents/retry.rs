//! Retrying model wrapper: exponential backoff with jitter on idempotent
//! provider failures. Non-retryable failures (refusals, misconfiguration)
//! surface immediately.

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tracing::warn;

use super::provider::{ChatModel, ChatRequest, ChatResponse, ProviderError};

/// Backoff schedule for provider retries.
#[derive(Clone, Copy, Debug)]
pub struct RetryPolicy {
    /// Total attempts including the first call.
    pub max_attempts: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_backoff: Duration::from_millis(250),
            max_backoff: Duration::from_secs(8),
        }
    }
}

impl RetryPolicy {
    /// Backoff before the given retry attempt (1-based), with 0.8x–1.2x
    /// jitter to avoid thundering herds.
    #[must_use]
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exp = self
            .initial_backoff
            .as_millis()
            .saturating_mul(1u128 << attempt.min(20))
            .min(self.max_backoff.as_millis()) as f64;
        let jitter = 0.8 + rand::random::<f64>() * 0.4;
        Duration::from_millis((exp * jitter) as u64)
    }
}

/// A `ChatModel` that retries its inner model per [`RetryPolicy`].
pub struct RetryingModel {
    inner: Arc<dyn ChatModel>,
    policy: RetryPolicy,
}

impl RetryingModel {
    #[must_use]
    pub fn new(inner: Arc<dyn ChatModel>, policy: RetryPolicy) -> Self {
        Self { inner, policy }
    }
}

#[async_trait]
impl ChatModel for RetryingModel {
    async fn complete(&self, request: ChatRequest) -> Result<ChatResponse, ProviderError> {
        let mut attempt = 0;
        loop {
            match self.inner.complete(request.clone()).await {
                Ok(response) => return Ok(response),
                Err(err) if err.is_retryable() && attempt + 1 < self.policy.max_attempts => {
                    let delay = self.policy.backoff(attempt);
                    warn!(
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "provider call failed; backing off"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(err) => return Err(err),
            }
        }
    }
}
