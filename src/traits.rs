//! Core Embedder trait

use async_trait::async_trait;

use crate::Result;

/// Produces embedding vectors for text.
///
/// [`InferenceClient`](crate::InferenceClient) is the production
/// implementation; the loop detector only depends on this trait.
#[async_trait]
pub trait Embedder: Send + Sync {
    /// Embed a single text.
    async fn embed(&self, text: &str) -> Result<Vec<f32>>;

    /// Embed several texts, preserving order.
    async fn embed_batch(&self, texts: &[&str]) -> Result<Vec<Vec<f32>>> {
        // Default: sequential fallback
        let mut results = Vec::with_capacity(texts.len());
        for text in texts {
            results.push(self.embed(text).await?);
        }
        Ok(results)
    }
}
