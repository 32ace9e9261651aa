//! Huginn - resilience layer for local LLM inference
//!
//! This crate wraps an Ollama-compatible inference backend with the pieces
//! an agent needs to call it all day without falling over:
//!
//! - [`EmbeddingCache`]: content-addressed LRU + TTL cache for embeddings,
//!   optionally persisted as a JSON snapshot or an SQLite table.
//! - [`RateGovernor`]: sliding-window rate limiter whose ceiling adapts to
//!   observed latency (AIMD over an EMA).
//! - [`InferenceClient`] / [`BlockingInferenceClient`]: chat and embedding
//!   calls with retry, backoff, rate governance, caching and missing-model
//!   provisioning, with identical semantics on both surfaces.
//! - [`LoopDetector`]: flags agents repeating themselves or making no
//!   progress.
//!
//! # Chat Example
//!
//! ```rust,no_run
//! use huginn::{ChatOptions, InferenceClient, Message};
//!
//! #[tokio::main]
//! async fn main() -> huginn::Result<()> {
//!     let client = InferenceClient::builder()
//!         .base_url("http://localhost:11434")
//!         .chat_model("llama3.1")
//!         .build()?;
//!
//!     let response = client
//!         .chat(
//!             &[
//!                 Message::system("You are a helpful assistant."),
//!                 Message::user("What is the capital of France?"),
//!             ],
//!             None,
//!             &ChatOptions::default().temperature(0.2),
//!         )
//!         .await?;
//!
//!     println!("{}", response.message.content);
//!     Ok(())
//! }
//! ```
//!
//! # Loop Detection Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use huginn::{InferenceClient, LoopDetector, LoopDetectorConfig};
//!
//! #[tokio::main]
//! async fn main() -> huginn::Result<()> {
//!     let client = Arc::new(InferenceClient::builder().build()?);
//!     let detector = LoopDetector::new(LoopDetectorConfig::default(), client)?;
//!
//!     let args = serde_json::json!({"path": "src/main.rs"});
//!     detector.record_action("read_file", &args, "fn main() {}").await;
//!     detector.update_progress("read_file", "fn main() {}");
//!
//!     if detector.detect_loop() {
//!         println!("agent is stuck");
//!     }
//!     Ok(())
//! }
//! ```

pub mod cache;
pub mod client;
pub mod config;
pub mod detector;
pub mod error;
pub mod governor;
pub mod telemetry;
pub mod traits;
pub mod transport;
pub mod types;

// Re-export main types at crate root
pub use error::{HuginnError, Result};
pub use traits::Embedder;

pub use cache::{CacheConfig, CacheEntry, CacheStats, CacheStore, EmbeddingCache, JsonSnapshotStore};
#[cfg(feature = "sqlite")]
pub use cache::SqliteStore;
pub use client::{
    BlockingInferenceClient, ClientConfig, ClientStats, CommandProvisioner, InferenceClient,
    InferenceClientBuilder, Provisioner,
};
pub use config::Config;
pub use detector::{
    ActionRecord, DetectorState, LoopDetector, LoopDetectorConfig, LoopTrigger, cosine_similarity,
};
pub use governor::{GovernorConfig, GovernorMode, GovernorState, GovernorStats, RateGovernor};
pub use transport::{Endpoint, HttpTransport, RetryConfig, RetryingTransport, Transport};

// Re-export all types
pub use types::{ChatOptions, ChatResponse, Message, Role, ToolCall, ToolDefinition, Usage};
