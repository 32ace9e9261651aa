//! Retry configuration, delay calculation, and the retrying transport.
//!
//! Provides [`RetryConfig`] for controlling retry behaviour and
//! [`RetryingTransport`], a decorator that wraps any [`Transport`] with
//! automatic retry on transient errors. Retry logic lives in the shared
//! `with_retry()` helper.

use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::warn;

use super::{Endpoint, Transport};
use crate::error::DEFAULT_RETRY_STATUSES;
use crate::telemetry;
use crate::{HuginnError, Result};

/// Configuration for retry behaviour on transient errors.
///
/// Uses bounded exponential backoff: the n-th retry (0-indexed) waits
/// `backoff_factor * 2^n`, capped at `max_backoff`.
///
/// ```rust
/// # use huginn::RetryConfig;
/// # use std::time::Duration;
/// let config = RetryConfig::new()
///     .max_retries(5)
///     .backoff_factor(Duration::from_millis(200))
///     .retry_statuses(vec![429, 503]);
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Retries after the initial attempt. 0 = no retry. Default: 3.
    pub max_retries: u32,
    /// Base delay before the first retry. Default: 500ms.
    #[serde(rename = "backoff_factor_ms", with = "millis")]
    pub backoff_factor: Duration,
    /// Maximum delay between retries. Default: 30s.
    #[serde(rename = "max_backoff_ms", with = "millis")]
    pub max_backoff: Duration,
    /// HTTP statuses treated as transient. Default: 429, 500, 502, 503, 504.
    pub retry_statuses: Vec<u16>,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            backoff_factor: Duration::from_millis(500),
            max_backoff: Duration::from_secs(30),
            retry_statuses: DEFAULT_RETRY_STATUSES.to_vec(),
        }
    }
}

impl RetryConfig {
    /// Create a new config with sensible defaults.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a config that disables retries (single attempt).
    pub fn disabled() -> Self {
        Self {
            max_retries: 0,
            ..Self::default()
        }
    }

    /// Set the number of retries after the initial attempt.
    pub fn max_retries(mut self, n: u32) -> Self {
        self.max_retries = n;
        self
    }

    /// Set the base delay before the first retry.
    pub fn backoff_factor(mut self, delay: Duration) -> Self {
        self.backoff_factor = delay;
        self
    }

    /// Set the maximum delay between retries.
    pub fn max_backoff(mut self, delay: Duration) -> Self {
        self.max_backoff = delay;
        self
    }

    /// Replace the set of retryable HTTP statuses.
    pub fn retry_statuses(mut self, statuses: Vec<u16>) -> Self {
        self.retry_statuses = statuses;
        self
    }

    /// Whether `err` should be retried under this config.
    pub fn is_retryable(&self, err: &HuginnError) -> bool {
        err.is_transient_for(&self.retry_statuses)
    }

    /// Calculate the delay for a given retry number (0-indexed).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let delay = self
            .backoff_factor
            .saturating_mul(2u32.saturating_pow(attempt));
        delay.min(self.max_backoff)
    }

    /// Calculate the effective delay, respecting `Retry-After` hints.
    ///
    /// A hint takes precedence over the calculated backoff but is still
    /// capped at `max_backoff`.
    pub fn effective_delay(&self, attempt: u32, retry_after: Option<Duration>) -> Duration {
        retry_after
            .map(|d| d.min(self.max_backoff))
            .unwrap_or_else(|| self.delay_for_attempt(attempt))
    }
}

// ============================================================================
// Shared retry helper
// ============================================================================

/// Execute an async operation with retry logic.
///
/// Retries errors that `config` classifies as retryable up to
/// `config.max_retries` times, counting each retry in `retries`. When the
/// budget runs out the last error is wrapped in
/// [`HuginnError::RetriesExhausted`]. Other errors return immediately.
pub(crate) async fn with_retry<F, Fut, T>(
    config: &RetryConfig,
    operation: &'static str,
    retries: &AtomicU64,
    f: F,
) -> Result<T>
where
    F: Fn() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut attempt = 0u32;
    loop {
        match f().await {
            Ok(result) => return Ok(result),
            Err(e) if config.is_retryable(&e) => {
                if attempt >= config.max_retries {
                    if config.max_retries == 0 {
                        return Err(e);
                    }
                    return Err(HuginnError::RetriesExhausted {
                        attempts: attempt + 1,
                        last: Box::new(e),
                    });
                }
                let delay = config.effective_delay(attempt, e.retry_after());
                warn!(
                    operation,
                    attempt = attempt + 1,
                    max_retries = config.max_retries,
                    delay_ms = delay.as_millis() as u64,
                    error = %e,
                    "retrying after transient error"
                );
                retries.fetch_add(1, Ordering::Relaxed);
                metrics::counter!(telemetry::RETRIES_TOTAL, "operation" => operation).increment(1);
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            Err(e) => return Err(e), // permanent error, no retry
        }
    }
}

// ============================================================================
// RetryingTransport
// ============================================================================

/// Decorator that wraps a [`Transport`] with retry logic.
///
/// Transient errors (connection failures, timeouts, configured statuses)
/// are retried with exponential backoff. Everything else, including
/// [`HuginnError::ModelNotFound`], is returned immediately so the caller's
/// recovery path sees it unchanged.
pub struct RetryingTransport {
    inner: Arc<dyn Transport>,
    config: RetryConfig,
    retries: AtomicU64,
}

impl RetryingTransport {
    /// Wrap a transport with retry logic.
    pub fn new(inner: Arc<dyn Transport>, config: RetryConfig) -> Self {
        Self {
            inner,
            config,
            retries: AtomicU64::new(0),
        }
    }

    pub fn config(&self) -> &RetryConfig {
        &self.config
    }

    /// Retries performed since construction.
    pub fn retries(&self) -> u64 {
        self.retries.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl Transport for RetryingTransport {
    fn name(&self) -> &str {
        self.inner.name()
    }

    async fn post_json(&self, endpoint: Endpoint, body: &Value) -> Result<Value> {
        with_retry(&self.config, endpoint.operation(), &self.retries, || {
            self.inner.post_json(endpoint, body)
        })
        .await
    }
}

mod millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        u64::deserialize(d).map(Duration::from_millis)
    }
}
