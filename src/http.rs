//! Retrying HTTP sends shared by the LLM client and the upsert sink.
//!
//! - HTTP 429 and 5xx → retry with exponential backoff
//! - other 4xx → fail immediately with status and body
//! - network errors (including timeouts) → retry
//! - backoff: base, 2×base, 4×base … capped at 32×base

use anyhow::Result;
use std::time::Duration;

use crate::error::PipelineError;

#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub base_delay: Duration,
}

impl RetryPolicy {
    pub fn new(max_retries: u32) -> Self {
        Self {
            max_retries,
            base_delay: Duration::from_secs(1),
        }
    }

    pub fn none() -> Self {
        Self::new(0)
    }

    pub fn delay_for(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }
        self.base_delay * (1u32 << (attempt - 1).min(5))
    }
}

/// Sends the request built by `make_request`, retrying per `policy`.
///
/// Returns the first successful response. The final error is a
/// [`PipelineError::Http`] for status failures, or the transport error.
pub async fn send_with_retry<F>(
    service: &'static str,
    policy: RetryPolicy,
    mut make_request: F,
) -> Result<reqwest::Response>
where
    F: FnMut() -> reqwest::RequestBuilder,
{
    let mut last_err: Option<anyhow::Error> = None;

    for attempt in 0..=policy.max_retries {
        if attempt > 0 {
            let delay = policy.delay_for(attempt);
            tracing::warn!(service, attempt, delay_ms = delay.as_millis() as u64, "retrying request");
            tokio::time::sleep(delay).await;
        }

        match make_request().send().await {
            Ok(response) => {
                let status = response.status();
                if status.is_success() {
                    return Ok(response);
                }
                let body = response.text().await.unwrap_or_default();
                let err = PipelineError::http(service, status.as_u16(), &body);
                if !err.is_retryable() {
                    return Err(err.into());
                }
                last_err = Some(err.into());
            }
            Err(e) => {
                last_err = Some(anyhow::anyhow!("{} request failed: {}", service, e));
            }
        }
    }

    Err(last_err.unwrap_or_else(|| anyhow::anyhow!("{} request failed", service)))
}
