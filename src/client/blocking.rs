//! Blocking facade over [`InferenceClient`].

use std::sync::Arc;

use tokio::runtime::{Builder, Runtime};

use super::{ClientStats, InferenceClient, InferenceClientBuilder};
use crate::cache::EmbeddingCache;
use crate::governor::RateGovernor;
use crate::types::{ChatOptions, ChatResponse, Message, ToolDefinition};
use crate::{HuginnError, Result};

/// Synchronous client for callers without an async runtime.
///
/// Owns a small multi-thread tokio runtime and drives the same
/// [`InferenceClient`] futures with `block_on`, so retries, caching, rate
/// limiting and usage accounting are identical to the async client. Any
/// number of OS threads may call into one instance concurrently; each call
/// parks its own thread while the governor or network is pending.
///
/// Must not be called, or dropped, from inside an async context.
pub struct BlockingInferenceClient {
    inner: Arc<InferenceClient>,
    runtime: Runtime,
}

impl BlockingInferenceClient {
    /// Build the async client and a runtime to drive it.
    pub fn new(builder: InferenceClientBuilder) -> Result<Self> {
        Self::from_client(Arc::new(builder.build()?))
    }

    /// Wrap an existing client. Its cache and governor stay shared with
    /// any async callers holding the same `Arc`.
    pub fn from_client(inner: Arc<InferenceClient>) -> Result<Self> {
        let runtime = Builder::new_multi_thread()
            .worker_threads(1)
            .thread_name("huginn-blocking")
            .enable_all()
            .build()
            .map_err(|e| HuginnError::Configuration(format!("failed to start runtime: {e}")))?;
        Ok(Self { inner, runtime })
    }

    /// The async client this facade drives.
    pub fn inner(&self) -> &Arc<InferenceClient> {
        &self.inner
    }

    pub fn chat(
        &self,
        messages: &[Message],
        tools: Option<&[ToolDefinition]>,
        options: &ChatOptions,
    ) -> Result<ChatResponse> {
        self.runtime
            .block_on(self.inner.chat(messages, tools, options))
    }

    pub fn embed(&self, text: &str) -> Result<Vec<f32>> {
        self.runtime.block_on(self.inner.embed(text))
    }

    pub fn embed_batch(&self, texts: &[&str]) -> Result<Vec<Vec<f32>>> {
        self.runtime.block_on(self.inner.embed_batch(texts))
    }

    pub fn restore_cache(&self) -> usize {
        self.runtime.block_on(self.inner.restore_cache())
    }

    pub fn persist_cache(&self) -> Result<usize> {
        self.runtime.block_on(self.inner.persist_cache())
    }

    pub fn stats(&self) -> ClientStats {
        self.inner.stats()
    }

    pub fn governor(&self) -> &Arc<RateGovernor> {
        self.inner.governor()
    }

    pub fn cache(&self) -> &Arc<EmbeddingCache> {
        self.inner.cache()
    }
}
