//! reqwest-backed transport for Ollama-compatible backends.
//!
//! See: <https://github.com/ollama/ollama/blob/main/docs/api.md>

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde_json::Value;
use tracing::debug;

use super::{Endpoint, Transport};
use crate::{HuginnError, Result};

/// Default base URL for a local Ollama server
pub const DEFAULT_BASE_URL: &str = "http://localhost:11434";

/// HTTP transport holding one reqwest connection pool.
///
/// Cloning is cheap and shares the pool.
#[derive(Clone)]
pub struct HttpTransport {
    http: Client,
    base_url: String,
}

impl HttpTransport {
    /// Create a transport for `base_url` with a per-request timeout.
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Result<Self> {
        let http = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| HuginnError::Configuration(format!("failed to build HTTP client: {e}")))?;

        Ok(Self {
            http,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Map a non-success response to an error.
    async fn error_from_response(response: reqwest::Response, body: &Value) -> HuginnError {
        let status = response.status().as_u16();
        let retry_after = response
            .headers()
            .get("retry-after")
            .and_then(|v| v.to_str().ok())
            .and_then(|s| s.parse::<u64>().ok())
            .map(Duration::from_secs);

        let text = response.text().await.unwrap_or_default();
        let message = serde_json::from_str::<Value>(&text)
            .ok()
            .and_then(|v| v.get("error").and_then(Value::as_str).map(String::from))
            .unwrap_or(text);

        let model = body
            .get("model")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();

        match status {
            404 => HuginnError::ModelNotFound(model),
            _ if is_missing_model_message(&message) => HuginnError::ModelNotFound(model),
            429 => HuginnError::RateLimited { retry_after },
            code => HuginnError::Api {
                status: code,
                message,
            },
        }
    }
}

/// Backends sometimes report a missing model with a 400/500 and an error
/// string instead of a 404.
fn is_missing_model_message(message: &str) -> bool {
    let lower = message.to_lowercase();
    lower.contains("model") && lower.contains("not found")
}

#[async_trait]
impl Transport for HttpTransport {
    fn name(&self) -> &str {
        "http"
    }

    async fn post_json(&self, endpoint: Endpoint, body: &Value) -> Result<Value> {
        let url = format!("{}{}", self.base_url, endpoint.path());
        debug!(%url, "posting request");

        let response = self.http.post(&url).json(body).send().await?;

        if !response.status().is_success() {
            return Err(Self::error_from_response(response, body).await);
        }

        let text = response.text().await?;
        serde_json::from_str(&text).map_err(|e| {
            HuginnError::MalformedResponse(format!("{} reply is not JSON: {e}", endpoint.operation()))
        })
    }
}
