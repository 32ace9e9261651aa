//! Huginn error types

use std::time::Duration;

/// Status codes retried by default (see [`RetryConfig`](crate::RetryConfig)).
pub const DEFAULT_RETRY_STATUSES: &[u16] = &[429, 500, 502, 503, 504];

/// Huginn error types
#[derive(Debug, thiserror::Error)]
pub enum HuginnError {
    // Transport errors
    #[error("HTTP error: {0}")]
    Http(String),

    #[error("request timed out")]
    Timeout,

    #[error("API error ({status}): {message}")]
    Api { status: u16, message: String },

    #[error("rate limited, retry after {retry_after:?}")]
    RateLimited { retry_after: Option<Duration> },

    /// A transient failure persisted through every retry.
    #[error("retries exhausted after {attempts} attempts: {last}")]
    RetriesExhausted {
        attempts: u32,
        #[source]
        last: Box<HuginnError>,
    },

    // Recovery errors
    #[error("model not found: {0}")]
    ModelNotFound(String),

    #[error("provisioning model '{model}' failed: {reason}")]
    ProvisionFailed { model: String, reason: String },

    // Data errors
    #[error("malformed response: {0}")]
    MalformedResponse(String),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("invalid input: {0}")]
    InvalidInput(String),

    // Persistence errors
    #[error("cache error: {0}")]
    Cache(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    // Configuration errors
    #[error("configuration error: {0}")]
    Configuration(String),
}

impl HuginnError {
    /// HTTP status associated with this error, if any.
    ///
    /// Looks through [`RetriesExhausted`](Self::RetriesExhausted) to the
    /// last underlying failure.
    pub fn status(&self) -> Option<u16> {
        match self {
            HuginnError::Api { status, .. } => Some(*status),
            HuginnError::RateLimited { .. } => Some(429),
            HuginnError::ModelNotFound(_) => Some(404),
            HuginnError::RetriesExhausted { last, .. } => last.status(),
            _ => None,
        }
    }

    /// Whether this error is worth retrying under the default status set.
    ///
    /// Connection failures and timeouts are always transient. API errors are
    /// transient when their status is in [`DEFAULT_RETRY_STATUSES`].
    /// Use [`RetryConfig::is_retryable`](crate::RetryConfig::is_retryable)
    /// for a configured status set.
    pub fn is_transient(&self) -> bool {
        self.is_transient_for(DEFAULT_RETRY_STATUSES)
    }

    /// Transient classification against an explicit status set.
    pub fn is_transient_for(&self, statuses: &[u16]) -> bool {
        match self {
            HuginnError::Http(_) | HuginnError::Timeout => true,
            HuginnError::Api { status, .. } => statuses.contains(status),
            HuginnError::RateLimited { .. } => statuses.contains(&429),
            _ => false,
        }
    }

    /// Whether the backend reported that the requested model is missing.
    pub fn is_model_not_found(&self) -> bool {
        matches!(self, HuginnError::ModelNotFound(_))
    }

    /// Whether this error came from exhausting the retry budget.
    pub fn is_retries_exhausted(&self) -> bool {
        matches!(self, HuginnError::RetriesExhausted { .. })
    }

    /// Server-suggested delay before the next attempt (`Retry-After`).
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            HuginnError::RateLimited { retry_after } => *retry_after,
            _ => None,
        }
    }
}

impl From<reqwest::Error> for HuginnError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            HuginnError::Timeout
        } else if err.is_decode() {
            HuginnError::MalformedResponse(err.to_string())
        } else if let Some(status) = err.status() {
            HuginnError::Api {
                status: status.as_u16(),
                message: err.to_string(),
            }
        } else {
            HuginnError::Http(err.to_string())
        }
    }
}

/// Result type alias for Huginn operations
pub type Result<T> = std::result::Result<T, HuginnError>;
