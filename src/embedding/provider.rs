// SPDX-License-Identifier: MIT OR Apache-2.0

//! Embedding provider interface and implementations.
//!
//! Three providers: a fastembed-based local model, an HTTP provider for
//! OpenAI-shaped embedding endpoints (with a bounded request timeout),
//! and a dummy provider for tests.

use std::borrow::Cow;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use fastembed::{EmbeddingModel, InitOptions, TextEmbedding};
use serde_json::Value;
use tracing::debug;

/// Default number of texts per inference batch.
pub const DEFAULT_BATCH_SIZE: usize = 256;

/// Characters beyond this are dropped before local inference.
pub const DEFAULT_MAX_CHARS: usize = 8000;

/// Default HTTP request timeout for remote providers.
pub const DEFAULT_TIMEOUT_MS: u64 = 30_000;

/// Trait for embedding providers.
///
/// `embed_texts` must be idempotent for identical text + model.
pub trait EmbeddingProvider: Send {
    /// Returns the model identifier.
    fn model_id(&self) -> &str;

    /// Generates embeddings for the given texts, in input order.
    fn embed_texts(&mut self, texts: &[String]) -> Result<Vec<Vec<f32>>>;

    /// Generates an embedding for a single text.
    fn embed_one(&mut self, text: &str) -> Result<Vec<f32>> {
        let mut result = self.embed_texts(&[text.to_string()])?;
        result
            .pop()
            .ok_or_else(|| anyhow::anyhow!("No embedding returned"))
    }
}

/// FastEmbed provider running a local sentence-transformer model.
pub struct FastEmbedder {
    embedder: TextEmbedding,
    model_id: String,
    batch_size: usize,
    max_chars: usize,
}

impl FastEmbedder {
    pub fn new(model: EmbeddingModel, batch_size: usize, max_chars: usize) -> Result<Self> {
        let model_id = model.to_string();
        let init = InitOptions::new(model);
        let embedder =
            TextEmbedding::try_new(init).context("Failed to initialize fastembed model")?;

        Ok(Self {
            embedder,
            model_id,
            batch_size,
            max_chars,
        })
    }

    /// Creates the default MiniLM embedder.
    pub fn with_defaults() -> Result<Self> {
        Self::new(
            EmbeddingModel::AllMiniLML6V2,
            DEFAULT_BATCH_SIZE,
            DEFAULT_MAX_CHARS,
        )
    }
}

impl EmbeddingProvider for FastEmbedder {
    fn model_id(&self) -> &str {
        &self.model_id
    }

    fn embed_texts(&mut self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }

        let prepared = truncate_texts(texts, self.max_chars);
        let embeddings = self.embedder.embed(&prepared, Some(self.batch_size))?;
        Ok(embeddings)
    }
}

/// Configuration for the HTTP embedding provider.
#[derive(Debug, Clone)]
pub struct HttpEmbedderConfig {
    /// Base URL, e.g. `https://api.openai.com`.
    pub api_base: String,
    /// Endpoint path, e.g. `/v1/embeddings`.
    pub path: String,
    /// Bearer token, when the endpoint requires one.
    pub api_key: Option<String>,
    /// Model identifier sent in the request body.
    pub model: String,
    /// Requested vector dimensionality, when the endpoint supports it.
    pub dimensions: Option<usize>,
    /// Bounded request timeout.
    pub timeout_ms: u64,
}

/// HTTP provider for OpenAI-shaped embedding endpoints.
///
/// The request carries `{model, input, dimensions?}`; the response is
/// expected to hold `data[].embedding` with optional `index` ordering.
/// The client applies a bounded timeout so a stalled endpoint cannot
/// block retrieval indefinitely.
pub struct HttpEmbedder {
    client: reqwest::blocking::Client,
    config: HttpEmbedderConfig,
}

impl HttpEmbedder {
    pub fn new(config: HttpEmbedderConfig) -> Result<Self> {
        let client = reqwest::blocking::Client::builder()
            .timeout(Duration::from_millis(config.timeout_ms))
            .build()
            .context("Failed to build HTTP client")?;
        Ok(Self { client, config })
    }

    /// The configured request timeout.
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.config.timeout_ms)
    }

    fn request(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        let url = format!("{}{}", self.config.api_base, self.config.path);
        let mut body = serde_json::json!({
            "model": self.config.model,
            "input": texts,
        });
        if let Some(dimensions) = self.config.dimensions {
            body["dimensions"] = serde_json::json!(dimensions);
        }

        let mut request = self.client.post(&url).json(&body);
        if let Some(key) = &self.config.api_key {
            request = request.bearer_auth(key);
        }

        let response = request
            .send()
            .with_context(|| format!("Embedding request to {} failed", url))?;
        let json: Value = response
            .error_for_status()
            .context("Embedding endpoint returned an error status")?
            .json()
            .context("Failed to parse embedding response as JSON")?;

        parse_embedding_response(&json, texts.len())
    }
}

impl EmbeddingProvider for HttpEmbedder {
    fn model_id(&self) -> &str {
        &self.config.model
    }

    fn embed_texts(&mut self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }
        self.request(texts)
    }
}

/// Parses `data[].embedding` rows, reordered by their `index` field when
/// present.
fn parse_embedding_response(json: &Value, expected: usize) -> Result<Vec<Vec<f32>>> {
    let data = json
        .get("data")
        .and_then(Value::as_array)
        .ok_or_else(|| anyhow::anyhow!("Embedding response missing 'data' array"))?;

    let mut indexed: Vec<(usize, Vec<f32>)> = Vec::with_capacity(data.len());
    for (fallback_index, item) in data.iter().enumerate() {
        let index = item
            .get("index")
            .and_then(Value::as_u64)
            .map(|v| v as usize)
            .unwrap_or(fallback_index);
        let embedding = item
            .get("embedding")
            .and_then(Value::as_array)
            .ok_or_else(|| anyhow::anyhow!("Embedding item missing 'embedding' array"))?;
        let mut vector = Vec::with_capacity(embedding.len());
        for value in embedding {
            let number = value
                .as_f64()
                .ok_or_else(|| anyhow::anyhow!("Embedding value must be a number"))?;
            vector.push(number as f32);
        }
        indexed.push((index, vector));
    }

    if indexed.len() != expected {
        bail!(
            "Embedding endpoint returned {} vectors for {} inputs",
            indexed.len(),
            expected
        );
    }

    indexed.sort_by_key(|(index, _)| *index);
    Ok(indexed.into_iter().map(|(_, vector)| vector).collect())
}

/// Dummy provider that returns zero vectors (tests, offline fallback).
pub struct DummyEmbedder {
    model: String,
    dimension: usize,
}

impl DummyEmbedder {
    pub fn new(dimension: usize) -> Self {
        Self {
            model: "dummy".to_string(),
            dimension,
        }
    }
}

impl EmbeddingProvider for DummyEmbedder {
    fn model_id(&self) -> &str {
        &self.model
    }

    fn embed_texts(&mut self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        debug!(count = texts.len(), "Dummy embedder returning zero vectors");
        Ok(texts.iter().map(|_| vec![0.0; self.dimension]).collect())
    }
}

fn truncate_texts<'a>(texts: &'a [String], max_chars: usize) -> Vec<Cow<'a, str>> {
    texts
        .iter()
        .map(|text| truncate_to_chars(text.as_str(), max_chars))
        .collect()
}

fn truncate_to_chars(input: &str, max_chars: usize) -> Cow<'_, str> {
    if max_chars == 0 {
        return Cow::Borrowed("");
    }

    let mut count = 0;
    for (idx, _) in input.char_indices() {
        if count == max_chars {
            return Cow::Owned(input[..idx].to_string());
        }
        count += 1;
    }

    Cow::Borrowed(input)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dummy_provider() {
        let mut provider = DummyEmbedder::new(384);
        assert_eq!(provider.model_id(), "dummy");

        let result = provider
            .embed_texts(&["hello".to_string(), "world".to_string()])
            .unwrap();
        assert_eq!(result.len(), 2);
        assert_eq!(result[0].len(), 384);
        assert!(result[0].iter().all(|&v| v == 0.0));
    }

    #[test]
    fn test_empty_embed() {
        let mut provider = DummyEmbedder::new(384);
        let result = provider.embed_texts(&[]).unwrap();
        assert!(result.is_empty());
    }

    #[test]
    fn test_embed_one() {
        let mut provider = DummyEmbedder::new(128);
        let vector = provider.embed_one("test").unwrap();
        assert_eq!(vector.len(), 128);
    }

    #[test]
    fn test_parse_response_reorders_by_index() {
        let json = serde_json::json!({
            "data": [
                {"index": 1, "embedding": [2.0, 3.0]},
                {"index": 0, "embedding": [0.5, 1.5]},
            ]
        });
        let parsed = parse_embedding_response(&json, 2).unwrap();
        assert_eq!(parsed[0], vec![0.5, 1.5]);
        assert_eq!(parsed[1], vec![2.0, 3.0]);
    }

    #[test]
    fn test_parse_response_count_mismatch() {
        let json = serde_json::json!({
            "data": [{"index": 0, "embedding": [1.0]}]
        });
        assert!(parse_embedding_response(&json, 2).is_err());
    }

    #[test]
    fn test_truncate_to_chars() {
        let input = "hello";
        assert_eq!(
            truncate_to_chars(input, 2),
            Cow::<str>::Owned("he".to_string())
        );
        assert_eq!(truncate_to_chars(input, 5), Cow::Borrowed(input));
    }
}
