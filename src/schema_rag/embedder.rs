//! Embedding capability
//!
//! Schema elements and request terms are embedded through [`EmbeddingModel`]. Two
//! providers: the OpenAI embeddings endpoint, and a local hashed term-frequency model
//! that needs no network and is always available.

use crate::config::{EmbeddingConfig, EmbeddingProvider};
use crate::error::{CopilotError, Result};
use crate::schema_rag::vector_store::Embedding;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;

#[async_trait]
pub trait EmbeddingModel: Send + Sync {
    fn name(&self) -> &str;

    async fn embed(&self, text: &str) -> Result<Embedding>;

    /// Embed several texts; providers with a batch endpoint override this.
    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Embedding>> {
        let mut out = Vec::with_capacity(texts.len());
        for text in texts {
            out.push(self.embed(text).await?);
        }
        Ok(out)
    }
}

/// Embedding client using the OpenAI embeddings API
pub struct OpenAiEmbedder {
    api_key: String,
    base_url: String,
    model: String,
    http: reqwest::Client,
}

impl OpenAiEmbedder {
    pub fn new(api_key: String, base_url: String, model: String) -> Self {
        Self {
            api_key,
            base_url: base_url.trim_end_matches('/').to_string(),
            model,
            http: reqwest::Client::new(),
        }
    }

    async fn request(&self, input: serde_json::Value) -> Result<Vec<Embedding>> {
        let body = serde_json::json!({
            "model": self.model,
            "input": input,
        });

        let response = self
            .http
            .post(format!("{}/embeddings", self.base_url))
            .header("Authorization", format!("Bearer {}", self.api_key))
            .json(&body)
            .send()
            .await
            .map_err(|e| CopilotError::EmbeddingUnavailable(format!("Embedding API call failed: {}", e)))?;

        let status = response.status();
        if !status.is_success() {
            let error_text = response
                .text()
                .await
                .unwrap_or_else(|_| "Unknown error".to_string());
            return Err(CopilotError::EmbeddingUnavailable(format!(
                "Embedding API error ({}): {}",
                status, error_text
            )));
        }

        let response_json: serde_json::Value = response.json().await.map_err(|e| {
            CopilotError::EmbeddingUnavailable(format!("Failed to parse embedding response: {}", e))
        })?;

        let data = response_json
            .get("data")
            .and_then(|d| d.as_array())
            .ok_or_else(|| CopilotError::EmbeddingUnavailable("No embedding data in response".to_string()))?;

        // Entries carry an index; order by it rather than trusting array order.
        let mut indexed: Vec<(usize, Embedding)> = Vec::with_capacity(data.len());
        for (position, item) in data.iter().enumerate() {
            let index = item
                .get("index")
                .and_then(|i| i.as_u64())
                .map(|i| i as usize)
                .unwrap_or(position);
            let vector: Embedding = item
                .get("embedding")
                .and_then(|e| e.as_array())
                .ok_or_else(|| {
                    CopilotError::EmbeddingUnavailable("No embedding vector in response".to_string())
                })?
                .iter()
                .filter_map(|v| v.as_f64().map(|f| f as f32))
                .collect();
            indexed.push((index, vector));
        }
        indexed.sort_by_key(|(index, _)| *index);
        Ok(indexed.into_iter().map(|(_, v)| v).collect())
    }
}

#[async_trait]
impl EmbeddingModel for OpenAiEmbedder {
    fn name(&self) -> &str {
        &self.model
    }

    async fn embed(&self, text: &str) -> Result<Embedding> {
        self.request(serde_json::json!(text))
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| CopilotError::EmbeddingUnavailable("Empty embedding response".to_string()))
    }

    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Embedding>> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }
        let vectors = self.request(serde_json::json!(texts)).await?;
        if vectors.len() != texts.len() {
            return Err(CopilotError::EmbeddingUnavailable(format!(
                "Requested {} embeddings, received {}",
                texts.len(),
                vectors.len()
            )));
        }
        Ok(vectors)
    }
}

/// Deterministic hashed term-frequency embeddings.
///
/// Terms are FNV-1a hashed into fixed buckets and weighted by frequency, then the
/// vector is L2-normalised. Identifiers are split on underscores and a plural `s`
/// is dropped, so "customers" lands in the same bucket as `customer_id`'s first word.
pub struct HashedEmbedder {
    dimension: usize,
}

impl HashedEmbedder {
    pub fn new(dimension: usize) -> Self {
        Self {
            dimension: dimension.max(1),
        }
    }

    pub fn dimension(&self) -> usize {
        self.dimension
    }

    fn bucket(&self, term: &str) -> usize {
        let mut h: u64 = 0xcbf29ce484222325;
        for b in term.as_bytes() {
            h ^= *b as u64;
            h = h.wrapping_mul(0x100000001b3);
        }
        (h % self.dimension as u64) as usize
    }

    pub fn vectorize(&self, text: &str) -> Embedding {
        let tokens = tokenize(text);
        let mut vector = vec![0.0f32; self.dimension];
        if tokens.is_empty() {
            return vector;
        }

        let mut tf: HashMap<&str, f32> = HashMap::new();
        for token in &tokens {
            *tf.entry(token.as_str()).or_default() += 1.0;
        }
        let total = tokens.len() as f32;
        for (term, count) in tf {
            // Longer terms carry more signal than short ones like "id".
            let weight = 1.0 + (term.len() as f32).ln();
            vector[self.bucket(term)] += count / total * weight;
        }

        let norm: f32 = vector.iter().map(|x| x * x).sum::<f32>().sqrt();
        if norm > f32::EPSILON {
            for v in &mut vector {
                *v /= norm;
            }
        }
        vector
    }
}

#[async_trait]
impl EmbeddingModel for HashedEmbedder {
    fn name(&self) -> &str {
        "hashed-tf"
    }

    async fn embed(&self, text: &str) -> Result<Embedding> {
        Ok(self.vectorize(text))
    }
}

/// Lowercase word tokens, split on anything that is not a letter or digit.
pub fn tokenize(text: &str) -> Vec<String> {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|s| s.len() >= 2)
        .map(|s| stem(&s.to_lowercase()))
        .collect()
}

fn stem(word: &str) -> String {
    if word.len() > 3 && word.ends_with('s') && !word.ends_with("ss") {
        word[..word.len() - 1].to_string()
    } else {
        word.to_string()
    }
}

/// Build the embedding capability selected in configuration.
pub fn build_embedder(config: &EmbeddingConfig) -> Result<Arc<dyn EmbeddingModel>> {
    match config.provider {
        EmbeddingProvider::Hashed => {
            debug!("Using hashed embeddings ({} dimensions)", config.dimension);
            Ok(Arc::new(HashedEmbedder::new(config.dimension)))
        }
        EmbeddingProvider::OpenAi => {
            let api_key = config
                .api_key
                .clone()
                .filter(|k| !k.trim().is_empty())
                .ok_or_else(|| {
                    CopilotError::Config("openai embeddings need OPENAI_API_KEY".to_string())
                })?;
            Ok(Arc::new(OpenAiEmbedder::new(
                api_key,
                config.base_url.clone(),
                config.model.clone(),
            )))
        }
    }
}
