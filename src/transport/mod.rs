//! Wire transport to the inference backend.
//!
//! [`Transport`] is the seam between the client and the network: it posts a
//! JSON body to one of the two backend endpoints and returns the decoded
//! JSON reply, mapping HTTP failures onto [`HuginnError`](crate::HuginnError)
//! variants. Implementations:
//!
//! - [`HttpTransport`]: reqwest, one pooled connection set per instance.
//! - [`RetryingTransport`]: decorator adding bounded exponential backoff on
//!   transient failures.
//!
//! Tests substitute their own `Transport` to script backend behaviour.

pub mod http;
pub mod retry;

pub use http::HttpTransport;
pub use retry::{RetryConfig, RetryingTransport};

use async_trait::async_trait;
use serde_json::Value;

use crate::Result;

/// Backend endpoint addressed by a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Endpoint {
    Chat,
    Embed,
}

impl Endpoint {
    /// URL path relative to the backend base URL.
    pub fn path(self) -> &'static str {
        match self {
            Endpoint::Chat => "/api/chat",
            Endpoint::Embed => "/api/embeddings",
        }
    }

    /// Label used in logs and metrics.
    pub fn operation(self) -> &'static str {
        match self {
            Endpoint::Chat => "chat",
            Endpoint::Embed => "embed",
        }
    }
}

/// Posts JSON requests to the backend.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Transport name for logging/debugging.
    fn name(&self) -> &str;

    /// Send `body` to `endpoint` and return the decoded success body.
    ///
    /// A missing model must surface as
    /// [`HuginnError::ModelNotFound`](crate::HuginnError::ModelNotFound) so
    /// the client can run its provisioning recovery.
    async fn post_json(&self, endpoint: Endpoint, body: &Value) -> Result<Value>;
}
