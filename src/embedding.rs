//! Embedding provider abstraction.
//!
//! The [`Embedder`] trait hides the backend behind a batch API. Two
//! implementations ship:
//! - [`DisabledEmbedder`]: always errors; used when embeddings are not
//!   configured so every other feature still works.
//! - [`OpenAiEmbedder`]: calls an OpenAI-compatible `/embeddings` endpoint.
//!
//! A failed batch fails the whole document: there is no retry here. Callers
//! own the decision to re-run, and partial embeddings would leave the index
//! and mappings disagreeing about slot counts.

use async_trait::async_trait;
use serde::Deserialize;
use std::time::Duration;

use crate::config::EmbeddingConfig;
use crate::error::{Error, Result};

#[async_trait]
pub trait Embedder: Send + Sync {
    /// Model identifier, for logs and the health endpoint.
    fn model_name(&self) -> &str;

    /// Vector dimensionality. Fixed at construction; new indexes are sized
    /// from this.
    fn dims(&self) -> usize;

    /// Embeds one batch of texts, returning vectors in input order.
    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>>;
}

/// Embeds an arbitrary number of texts by batching per config.
pub async fn embed_all(
    embedder: &dyn Embedder,
    batch_size: usize,
    texts: &[String],
) -> Result<Vec<Vec<f32>>> {
    let mut out = Vec::with_capacity(texts.len());
    for batch in texts.chunks(batch_size.max(1)) {
        let mut vectors = embedder.embed_batch(batch).await?;
        if vectors.len() != batch.len() {
            return Err(Error::EmbeddingFailed(format!(
                "provider returned {} vectors for {} texts",
                vectors.len(),
                batch.len()
            )));
        }
        out.append(&mut vectors);
    }
    Ok(out)
}

/// Embeds a single query text.
pub async fn embed_query(embedder: &dyn Embedder, text: &str) -> Result<Vec<f32>> {
    let vectors = embedder.embed_batch(&[text.to_string()]).await?;
    vectors
        .into_iter()
        .next()
        .ok_or_else(|| Error::EmbeddingFailed("empty embedding response".to_string()))
}

// ============ Disabled ============

pub struct DisabledEmbedder;

#[async_trait]
impl Embedder for DisabledEmbedder {
    fn model_name(&self) -> &str {
        "disabled"
    }
    fn dims(&self) -> usize {
        0
    }
    async fn embed_batch(&self, _texts: &[String]) -> Result<Vec<Vec<f32>>> {
        Err(Error::EmbeddingFailed(
            "embedding provider is disabled".to_string(),
        ))
    }
}

// ============ OpenAI-compatible ============

/// Calls `POST {base_url}/embeddings`. The base URL is configurable so the
/// same provider works against proxies and self-hosted compatible servers.
/// Requires `OPENAI_API_KEY` in the environment.
pub struct OpenAiEmbedder {
    model: String,
    dims: usize,
    base_url: String,
    api_key: String,
    client: reqwest::Client,
}

impl OpenAiEmbedder {
    pub fn new(config: &EmbeddingConfig) -> Result<Self> {
        let model = config
            .model
            .clone()
            .ok_or_else(|| Error::EmbeddingFailed("embedding.model is required".to_string()))?;
        let dims = config
            .dims
            .ok_or_else(|| Error::EmbeddingFailed("embedding.dims is required".to_string()))?;
        let api_key = std::env::var("OPENAI_API_KEY")
            .map_err(|_| Error::EmbeddingFailed("OPENAI_API_KEY not set".to_string()))?;

        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| Error::EmbeddingFailed(e.to_string()))?;

        Ok(Self {
            model,
            dims,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            api_key,
            client,
        })
    }
}

#[derive(Deserialize)]
struct EmbeddingsResponse {
    data: Vec<EmbeddingsItem>,
}

#[derive(Deserialize)]
struct EmbeddingsItem {
    index: usize,
    embedding: Vec<f32>,
}

#[async_trait]
impl Embedder for OpenAiEmbedder {
    fn model_name(&self) -> &str {
        &self.model
    }

    fn dims(&self) -> usize {
        self.dims
    }

    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        let body = serde_json::json!({
            "model": self.model,
            "input": texts,
        });

        let response = self
            .client
            .post(format!("{}/embeddings", self.base_url))
            .header("Authorization", format!("Bearer {}", self.api_key))
            .json(&body)
            .send()
            .await
            .map_err(|e| Error::EmbeddingFailed(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let detail = response.text().await.unwrap_or_default();
            return Err(Error::EmbeddingFailed(format!(
                "embeddings API returned {}: {}",
                status, detail
            )));
        }

        let parsed: EmbeddingsResponse = response
            .json()
            .await
            .map_err(|e| Error::EmbeddingFailed(format!("bad embeddings response: {}", e)))?;

        let mut items = parsed.data;
        items.sort_by_key(|item| item.index);
        Ok(items.into_iter().map(|item| item.embedding).collect())
    }
}

/// Instantiates the embedder named in config.
pub fn create_embedder(config: &EmbeddingConfig) -> Result<Box<dyn Embedder>> {
    match config.provider.as_str() {
        "disabled" => Ok(Box::new(DisabledEmbedder)),
        "openai" => Ok(Box::new(OpenAiEmbedder::new(config)?)),
        other => Err(Error::EmbeddingFailed(format!(
            "unknown embedding provider: {}",
            other
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn disabled_embedder_always_errors() {
        let embedder = DisabledEmbedder;
        let err = embedder
            .embed_batch(&["hello".to_string()])
            .await
            .unwrap_err();
        assert!(matches!(err, Error::EmbeddingFailed(_)));
    }

    #[tokio::test]
    async fn embed_all_rejects_short_responses() {
        struct ShortBatch;

        #[async_trait]
        impl Embedder for ShortBatch {
            fn model_name(&self) -> &str {
                "short"
            }
            fn dims(&self) -> usize {
                2
            }
            async fn embed_batch(&self, _texts: &[String]) -> Result<Vec<Vec<f32>>> {
                Ok(vec![vec![1.0, 0.0]])
            }
        }

        let texts = vec!["a".to_string(), "b".to_string()];
        let err = embed_all(&ShortBatch, 8, &texts).await.unwrap_err();
        assert!(matches!(err, Error::EmbeddingFailed(_)));
    }

    #[tokio::test]
    async fn embed_all_batches_in_order() {
        struct Echo;

        #[async_trait]
        impl Embedder for Echo {
            fn model_name(&self) -> &str {
                "echo"
            }
            fn dims(&self) -> usize {
                1
            }
            async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
                Ok(texts.iter().map(|t| vec![t.len() as f32]).collect())
            }
        }

        let texts: Vec<String> = (1..=5).map(|n| "x".repeat(n)).collect();
        let vectors = embed_all(&Echo, 2, &texts).await.unwrap();
        let lengths: Vec<f32> = vectors.iter().map(|v| v[0]).collect();
        assert_eq!(lengths, vec![1.0, 2.0, 3.0, 4.0, 5.0]);
    }

    #[test]
    fn response_items_sort_by_index() {
        let json = serde_json::json!({
            "data": [
                {"index": 1, "embedding": [2.0]},
                {"index": 0, "embedding": [1.0]}
            ]
        });
        let mut parsed: EmbeddingsResponse = serde_json::from_value(json).unwrap();
        parsed.data.sort_by_key(|item| item.index);
        assert_eq!(parsed.data[0].embedding, vec![1.0]);
        assert_eq!(parsed.data[1].embedding, vec![2.0]);
    }
}
