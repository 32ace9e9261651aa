//! Resilient inference client.
//!
//! Every call follows the same path:
//!
//! ```text
//!  chat()/embed()
//!       │
//!       ├─ embed only: EmbeddingCache hit? ──► return cached vector
//!       ▼
//!  RateGovernor::acquire()           (suspends while the window is full)
//!       ▼
//!  RetryingTransport::post_json()    (backoff on transient failures)
//!       │
//!       ├─ ModelNotFound ──► Provisioner::provision() ──► one more attempt
//!       ▼
//!  record latency, parse, (embed: populate cache), estimate usage
//! ```
//!
//! [`InferenceClient`] is the single implementation of that path.
//! [`BlockingInferenceClient`] drives the same futures on an owned runtime,
//! so both surfaces share retry counts, cache behaviour and usage
//! accounting by construction.

mod blocking;
pub mod provision;

pub use blocking::BlockingInferenceClient;
pub use provision::{CommandProvisioner, Provisioner};

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tokio::time::Instant;
use tracing::{debug, info, instrument, warn};

use crate::cache::{CacheConfig, CacheStore, EmbeddingCache, merge_batch_results};
use crate::governor::{GovernorConfig, RateGovernor};
use crate::telemetry;
use crate::traits::Embedder;
use crate::transport::http::DEFAULT_BASE_URL;
use crate::transport::{Endpoint, HttpTransport, RetryConfig, RetryingTransport, Transport};
use crate::types::{ChatOptions, ChatResponse, Message, ToolDefinition, Usage};
use crate::{HuginnError, Result};

/// Client-level settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Backend base URL. Default: `http://localhost:11434`.
    pub base_url: String,
    /// Model used by `chat` unless overridden per call.
    pub chat_model: String,
    /// Model used by `embed`.
    pub embed_model: String,
    /// Per-request timeout. Default: 120s.
    #[serde(rename = "timeout_secs", with = "secs")]
    pub timeout: Duration,
    /// Provision missing models and retry once. Default: true.
    pub auto_provision: bool,
    /// Provisioning command; the model name is appended. Default: `ollama pull`.
    pub provision_command: Vec<String>,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_BASE_URL.to_string(),
            chat_model: "llama3.1".to_string(),
            embed_model: "nomic-embed-text".to_string(),
            timeout: Duration::from_secs(120),
            auto_provision: true,
            provision_command: vec!["ollama".to_string(), "pull".to_string()],
        }
    }
}

/// Outcome of one admitted attempt, before recovery.
#[derive(Debug)]
pub(crate) enum CallOutcome<T> {
    Ok(T),
    /// The backend does not have the model; provisioning may fix it.
    RetryableNotFound(HuginnError),
    Fatal(HuginnError),
}

impl<T> From<Result<T>> for CallOutcome<T> {
    fn from(result: Result<T>) -> Self {
        match result {
            Ok(value) => CallOutcome::Ok(value),
            Err(e) if e.is_model_not_found() => CallOutcome::RetryableNotFound(e),
            Err(e) => CallOutcome::Fatal(e),
        }
    }
}

/// Client counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ClientStats {
    /// Attempts that passed the governor and reached the transport.
    pub requests: u64,
    /// Transport-level retries.
    pub retries: u64,
    /// Successful provisioning runs.
    pub provisions: u64,
    pub cache_hits: u64,
    pub cache_misses: u64,
    /// Calls that returned an error to the caller.
    pub failures: u64,
}

#[derive(Default)]
struct Counters {
    requests: AtomicU64,
    provisions: AtomicU64,
    failures: AtomicU64,
}

#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: &'a [Message],
    #[serde(skip_serializing_if = "Option::is_none")]
    tools: Option<&'a [ToolDefinition]>,
    options: Map<String, Value>,
    stream: bool,
}

#[derive(Deserialize)]
struct ChatReply {
    #[serde(default)]
    model: Option<String>,
    #[serde(default)]
    message: Option<Message>,
    #[serde(default)]
    prompt_eval_count: Option<u32>,
    #[serde(default)]
    eval_count: Option<u32>,
}

#[derive(Serialize)]
struct EmbedRequest<'a> {
    model: &'a str,
    prompt: &'a str,
    options: Map<String, Value>,
}

#[derive(Deserialize)]
struct EmbedReply {
    #[serde(default)]
    embedding: Option<Vec<f32>>,
}

/// Rate-governed, caching, self-recovering client for the inference backend.
///
/// Cheap to share behind an `Arc`; every method takes `&self`.
pub struct InferenceClient {
    config: ClientConfig,
    transport: RetryingTransport,
    governor: Arc<RateGovernor>,
    cache: Arc<EmbeddingCache>,
    store: Option<Arc<dyn CacheStore>>,
    provisioner: Option<Arc<dyn Provisioner>>,
    counters: Counters,
}

impl InferenceClient {
    /// Create a builder with default settings.
    pub fn builder() -> InferenceClientBuilder {
        InferenceClientBuilder::new()
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    pub fn governor(&self) -> &Arc<RateGovernor> {
        &self.governor
    }

    pub fn cache(&self) -> &Arc<EmbeddingCache> {
        &self.cache
    }

    pub fn stats(&self) -> ClientStats {
        let cache = self.cache.stats();
        ClientStats {
            requests: self.counters.requests.load(Ordering::Relaxed),
            retries: self.transport.retries(),
            provisions: self.counters.provisions.load(Ordering::Relaxed),
            cache_hits: cache.hits,
            cache_misses: cache.misses,
            failures: self.counters.failures.load(Ordering::Relaxed),
        }
    }

    /// Chat completion.
    ///
    /// `options.model` overrides the configured chat model for this call.
    #[instrument(skip_all, fields(model = tracing::field::Empty))]
    pub async fn chat(
        &self,
        messages: &[Message],
        tools: Option<&[ToolDefinition]>,
        options: &ChatOptions,
    ) -> Result<ChatResponse> {
        let model = options
            .model
            .clone()
            .unwrap_or_else(|| self.config.chat_model.clone());
        tracing::Span::current().record("model", model.as_str());

        let body = serde_json::to_value(ChatRequest {
            model: &model,
            messages,
            tools,
            options: options.to_backend_options(),
            stream: false,
        })?;
        let request_bytes = body.to_string().len();

        let result = async {
            let value = self.dispatch(Endpoint::Chat, &model, &body).await?;
            parse_chat(value, model.clone(), request_bytes)
        }
        .await;
        self.finish(result)
    }

    /// Embed `text`, consulting the cache first.
    #[instrument(skip_all, fields(model = %self.config.embed_model, chars = text.len()))]
    pub async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        if let Some(vector) = self.cache.get(text) {
            debug!("embedding cache hit");
            return Ok(vector);
        }
        let result = self.embed_uncached(text).await;
        self.finish(result)
    }

    /// Embed several texts; only cache misses reach the backend.
    ///
    /// Misses are requested concurrently, each passing through the governor.
    /// Output order matches `texts`.
    #[instrument(skip_all, fields(model = %self.config.embed_model, count = texts.len()))]
    pub async fn embed_batch(&self, texts: &[&str]) -> Result<Vec<Vec<f32>>> {
        let cached = self.cache.get_batch(texts);
        let misses: Vec<&str> = texts
            .iter()
            .zip(&cached)
            .filter(|(_, hit)| hit.is_none())
            .map(|(text, _)| *text)
            .collect();

        // Repeated misses share one backend call.
        let mut unique: Vec<&str> = Vec::new();
        let mut index: HashMap<&str, usize> = HashMap::new();
        let slots: Vec<usize> = misses
            .iter()
            .map(|&text| {
                *index.entry(text).or_insert_with(|| {
                    unique.push(text);
                    unique.len() - 1
                })
            })
            .collect();
        debug!(
            hits = texts.len() - misses.len(),
            misses = misses.len(),
            unique = unique.len(),
            "batch cache lookup"
        );

        let result = async {
            let fetched = futures_util::future::try_join_all(
                unique.iter().map(|text| self.embed_uncached(text)),
            )
            .await?;
            let expanded = slots.iter().map(|&slot| fetched[slot].clone()).collect();
            merge_batch_results(cached, expanded)
        }
        .await;
        self.finish(result)
    }

    /// Load the configured cache store into the cache.
    ///
    /// Returns the number of entries restored; failures are logged and
    /// yield 0.
    pub async fn restore_cache(&self) -> usize {
        match &self.store {
            Some(store) => self.cache.load_from(store.as_ref()).await,
            None => 0,
        }
    }

    /// Write the cache to the configured store.
    ///
    /// Failures are logged and also returned; they never affect later calls.
    pub async fn persist_cache(&self) -> Result<usize> {
        let Some(store) = &self.store else {
            return Ok(0);
        };
        self.cache.save_to(store.as_ref()).await.inspect_err(|e| {
            warn!(store = store.name(), error = %e, "failed to persist embedding cache");
        })
    }

    async fn embed_uncached(&self, text: &str) -> Result<Vec<f32>> {
        let model = self.config.embed_model.as_str();
        let body = serde_json::to_value(EmbedRequest {
            model,
            prompt: text,
            options: Map::new(),
        })?;

        let value = self.dispatch(Endpoint::Embed, model, &body).await?;
        let reply: EmbedReply = serde_json::from_value(value)
            .map_err(|e| HuginnError::MalformedResponse(format!("embed reply: {e}")))?;
        let vector = reply
            .embedding
            .filter(|v| !v.is_empty())
            .ok_or_else(|| HuginnError::MalformedResponse("missing 'embedding' field".into()))?;

        // Only a complete, parsed vector is ever cached.
        self.cache.put(text, vector.clone());
        Ok(vector)
    }

    /// Run one call with missing-model recovery.
    async fn dispatch(&self, endpoint: Endpoint, model: &str, body: &Value) -> Result<Value> {
        let original = match self.attempt(endpoint, body).await {
            CallOutcome::Ok(value) => return Ok(value),
            CallOutcome::Fatal(e) => return Err(e),
            CallOutcome::RetryableNotFound(e) => e,
        };

        let Some(provisioner) = &self.provisioner else {
            return Err(original);
        };

        match provisioner.provision(model).await {
            Ok(()) => {
                self.counters.provisions.fetch_add(1, Ordering::Relaxed);
                metrics::counter!(telemetry::PROVISIONS_TOTAL, "status" => "ok").increment(1);
                info!(model, "model provisioned, retrying request once");
            }
            Err(e) => {
                metrics::counter!(telemetry::PROVISIONS_TOTAL, "status" => "error").increment(1);
                warn!(model, error = %e, "model provisioning failed");
                return Err(original);
            }
        }

        match self.attempt(endpoint, body).await {
            CallOutcome::Ok(value) => Ok(value),
            CallOutcome::RetryableNotFound(e) | CallOutcome::Fatal(e) => Err(e),
        }
    }

    /// One admitted attempt through the retrying transport.
    async fn attempt(&self, endpoint: Endpoint, body: &Value) -> CallOutcome<Value> {
        self.governor.acquire().await;
        self.counters.requests.fetch_add(1, Ordering::Relaxed);

        let operation = endpoint.operation();
        let started = Instant::now();
        let result = self.transport.post_json(endpoint, body).await;
        let elapsed = started.elapsed();

        let status = if result.is_ok() { "ok" } else { "error" };
        metrics::counter!(telemetry::REQUESTS_TOTAL, "operation" => operation, "status" => status)
            .increment(1);
        if result.is_ok() {
            self.governor.record_response_time(elapsed);
            metrics::histogram!(telemetry::REQUEST_DURATION_SECONDS, "operation" => operation)
                .record(elapsed.as_secs_f64());
        }
        CallOutcome::from(result)
    }

    fn finish<T>(&self, result: Result<T>) -> Result<T> {
        if let Err(e) = &result {
            self.counters.failures.fetch_add(1, Ordering::Relaxed);
            debug!(error = %e, "call failed");
        }
        result
    }
}

fn parse_chat(value: Value, requested_model: String, request_bytes: usize) -> Result<ChatResponse> {
    let reply: ChatReply = serde_json::from_value(value)
        .map_err(|e| HuginnError::MalformedResponse(format!("chat reply: {e}")))?;
    let message = reply
        .message
        .ok_or_else(|| HuginnError::MalformedResponse("missing 'message' field".into()))?;

    let usage = match (reply.prompt_eval_count, reply.eval_count) {
        (Some(prompt), Some(completion)) => Usage::reported(prompt, completion),
        _ => {
            let tool_call_bytes = if message.tool_calls.is_empty() {
                0
            } else {
                serde_json::to_vec(&message.tool_calls)?.len()
            };
            Usage::estimate(request_bytes, message.content.len() + tool_call_bytes)
        }
    };

    Ok(ChatResponse {
        message,
        usage,
        model: reply.model.unwrap_or(requested_model),
    })
}

#[async_trait]
impl Embedder for InferenceClient {
    async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        InferenceClient::embed(self, text).await
    }

    async fn embed_batch(&self, texts: &[&str]) -> Result<Vec<Vec<f32>>> {
        InferenceClient::embed_batch(self, texts).await
    }
}

/// Builder for [`InferenceClient`].
///
/// Cache and governor are created from their configs unless shared
/// instances are supplied, which lets several clients in one process share
/// one cache or one rate budget.
pub struct InferenceClientBuilder {
    config: ClientConfig,
    retry: RetryConfig,
    cache_config: CacheConfig,
    governor_config: GovernorConfig,
    cache: Option<Arc<EmbeddingCache>>,
    governor: Option<Arc<RateGovernor>>,
    transport: Option<Arc<dyn Transport>>,
    provisioner: Option<Arc<dyn Provisioner>>,
    store: Option<Arc<dyn CacheStore>>,
}

impl InferenceClientBuilder {
    pub fn new() -> Self {
        Self {
            config: ClientConfig::default(),
            retry: RetryConfig::default(),
            cache_config: CacheConfig::default(),
            governor_config: GovernorConfig::default(),
            cache: None,
            governor: None,
            transport: None,
            provisioner: None,
            store: None,
        }
    }

    /// Replace the client settings wholesale.
    pub fn client_config(mut self, config: ClientConfig) -> Self {
        self.config = config;
        self
    }

    pub fn base_url(mut self, url: impl Into<String>) -> Self {
        self.config.base_url = url.into();
        self
    }

    pub fn chat_model(mut self, model: impl Into<String>) -> Self {
        self.config.chat_model = model.into();
        self
    }

    pub fn embed_model(mut self, model: impl Into<String>) -> Self {
        self.config.embed_model = model.into();
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.config.timeout = timeout;
        self
    }

    pub fn auto_provision(mut self, enabled: bool) -> Self {
        self.config.auto_provision = enabled;
        self
    }

    pub fn retry(mut self, config: RetryConfig) -> Self {
        self.retry = config;
        self
    }

    pub fn cache_config(mut self, config: CacheConfig) -> Self {
        self.cache_config = config;
        self
    }

    pub fn governor_config(mut self, config: GovernorConfig) -> Self {
        self.governor_config = config;
        self
    }

    /// Use a shared cache instead of creating a private one.
    pub fn cache(mut self, cache: Arc<EmbeddingCache>) -> Self {
        self.cache = Some(cache);
        self
    }

    /// Use a shared governor instead of creating a private one.
    pub fn governor(mut self, governor: Arc<RateGovernor>) -> Self {
        self.governor = Some(governor);
        self
    }

    /// Replace the HTTP transport (retry wrapping still applies).
    pub fn transport(mut self, transport: Arc<dyn Transport>) -> Self {
        self.transport = Some(transport);
        self
    }

    /// Replace the command-based provisioner.
    pub fn provisioner(mut self, provisioner: Arc<dyn Provisioner>) -> Self {
        self.provisioner = Some(provisioner);
        self
    }

    /// Persist the cache through `store` (see [`InferenceClient::persist_cache`]).
    pub fn cache_store(mut self, store: Arc<dyn CacheStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Validate settings and assemble the client.
    pub fn build(self) -> Result<InferenceClient> {
        let transport = match self.transport {
            Some(t) => t,
            None => Arc::new(HttpTransport::new(&self.config.base_url, self.config.timeout)?),
        };
        let governor = match self.governor {
            Some(g) => g,
            None => Arc::new(RateGovernor::new(self.governor_config)?),
        };
        let cache = match self.cache {
            Some(c) => c,
            None => Arc::new(EmbeddingCache::new(self.cache_config)?),
        };
        let provisioner = if !self.config.auto_provision {
            None
        } else if let Some(p) = self.provisioner {
            Some(p)
        } else {
            let command = CommandProvisioner::from_command(&self.config.provision_command)?;
            Some(Arc::new(command) as Arc<dyn Provisioner>)
        };

        Ok(InferenceClient {
            transport: RetryingTransport::new(transport, self.retry),
            config: self.config,
            governor,
            cache,
            store: self.store,
            provisioner,
            counters: Counters::default(),
        })
    }
}

impl Default for InferenceClientBuilder {
    fn default() -> Self {
        Self::new()
    }
}

mod secs {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_secs())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        u64::deserialize(d).map(Duration::from_secs)
    }
}
