// SPDX-License-Identifier: MIT OR Apache-2.0

//! Configuration file support for ragrank
//!
//! Loads configuration from ragrank.toml in the current directory or
//! ~/.config/ragrank/config.toml. The config layer only supplies
//! defaults: ranking and composition inputs are resolved into explicit
//! option structs before entering the pipeline, so no configuration is
//! read mid-call.

use std::path::PathBuf;

use serde::Deserialize;
use tracing::warn;

use crate::hybrid::RankingOptions;
use crate::pipeline::GenerationOptions;
use crate::prompt::ComposeOptions;

/// Embedding provider type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderKind {
    /// Local fastembed model.
    #[default]
    Builtin,
    /// OpenAI-shaped HTTP endpoint.
    Http,
    /// Zero-vector dummy (tests, offline).
    Dummy,
}

/// Embedding model configuration.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct EmbeddingModelConfig {
    /// Model identifier.
    pub name: Option<String>,
    /// Expected vector dimensionality.
    pub dimensions: Option<usize>,
    /// Token budget for embedding input text.
    pub max_tokens: Option<usize>,
    /// Model version string, part of the cache key.
    pub version: Option<String>,
}

impl EmbeddingModelConfig {
    pub fn name(&self) -> &str {
        self.name
            .as_deref()
            .unwrap_or("sentence-transformers/all-MiniLM-L6-v2")
    }

    pub fn dimensions(&self) -> usize {
        self.dimensions.unwrap_or(384)
    }

    pub fn max_tokens(&self) -> usize {
        self.max_tokens.unwrap_or(8191)
    }

    pub fn version(&self) -> &str {
        self.version.as_deref().unwrap_or("1.0")
    }
}

/// Generation model configuration.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct GenerationModelConfig {
    /// Model identifier.
    pub name: Option<String>,
    /// Full context window of the model.
    pub max_context_tokens: Option<usize>,
    /// Tokens reserved for the answer.
    pub max_answer_tokens: Option<usize>,
    /// Sampling temperature.
    pub temperature: Option<f32>,
}

impl GenerationModelConfig {
    pub fn name(&self) -> &str {
        self.name.as_deref().unwrap_or("gpt-4o-latest")
    }

    pub fn max_context_tokens(&self) -> usize {
        self.max_context_tokens.unwrap_or(4096)
    }

    pub fn max_answer_tokens(&self) -> usize {
        self.max_answer_tokens.unwrap_or(2048)
    }

    pub fn temperature(&self) -> f32 {
        self.temperature.unwrap_or(0.3)
    }
}

/// Search and ranking configuration.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct SearchConfig {
    /// Result budget.
    pub top_k: Option<usize>,
    /// Store sample size for candidate fetching.
    pub sample_size: Option<usize>,
    /// Similarity threshold for selection.
    pub similarity_threshold: Option<f32>,
    /// Weight for the vector signal.
    pub vector_weight: Option<f32>,
    /// Weight for the BM25 signal.
    pub bm25_weight: Option<f32>,
    /// Weight for the rerank signal.
    pub rerank_weight: Option<f32>,
    /// Whether lexical scoring runs.
    pub use_bm25: Option<bool>,
    /// Whether the cross-encoder refines the top slice.
    pub use_rerank: Option<bool>,
    /// Pairs per rerank scoring batch.
    pub rerank_batch_size: Option<usize>,
    /// Bounded retries for reranker initialization.
    pub rerank_max_retries: Option<u32>,
}

impl SearchConfig {
    pub fn top_k(&self) -> usize {
        self.top_k.unwrap_or(5)
    }

    pub fn sample_size(&self) -> usize {
        self.sample_size.unwrap_or(10)
    }

    pub fn similarity_threshold(&self) -> f32 {
        self.similarity_threshold.unwrap_or(0.3)
    }

    pub fn vector_weight(&self) -> f32 {
        self.vector_weight.unwrap_or(0.5)
    }

    pub fn bm25_weight(&self) -> f32 {
        self.bm25_weight.unwrap_or(0.5)
    }

    pub fn rerank_weight(&self) -> f32 {
        self.rerank_weight.unwrap_or(0.5)
    }

    pub fn use_bm25(&self) -> bool {
        self.use_bm25.unwrap_or(true)
    }

    pub fn use_rerank(&self) -> bool {
        self.use_rerank.unwrap_or(false)
    }

    pub fn rerank_batch_size(&self) -> usize {
        self.rerank_batch_size.unwrap_or(64)
    }

    pub fn rerank_max_retries(&self) -> u32 {
        self.rerank_max_retries.unwrap_or(3)
    }
}

/// Chunking configuration.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ChunkingConfig {
    /// Token budget per chunk (also the per-context prompt cap).
    pub chunk_tokens: Option<usize>,
    /// Overlap fraction between consecutive chunks.
    pub chunk_overlap: Option<f32>,
}

impl ChunkingConfig {
    pub fn chunk_tokens(&self) -> usize {
        self.chunk_tokens.unwrap_or(1000)
    }

    pub fn chunk_overlap(&self) -> f32 {
        self.chunk_overlap.unwrap_or(0.1)
    }
}

/// Embedding cache configuration.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Whether the cache is used at all.
    pub enabled: Option<bool>,
    /// Database file path.
    pub path: Option<String>,
    /// Texts longer than this many characters are not cached.
    pub max_text_len: Option<usize>,
}

impl CacheConfig {
    pub fn enabled(&self) -> bool {
        self.enabled.unwrap_or(true)
    }

    pub fn path(&self) -> &str {
        self.path.as_deref().unwrap_or(".ragrank/embeddings.sqlite")
    }

    pub fn max_text_len(&self) -> usize {
        self.max_text_len.unwrap_or(1500)
    }
}

/// Embedding provider configuration.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ProviderConfig {
    /// Provider type (builtin, http, dummy).
    pub kind: Option<ProviderKind>,
    /// Base URL for the HTTP provider.
    pub api_base: Option<String>,
    /// Endpoint path for the HTTP provider.
    pub path: Option<String>,
    /// Environment variable holding the API key.
    pub api_key_env: Option<String>,
    /// Bounded request timeout in milliseconds.
    pub timeout_ms: Option<u64>,
}

impl ProviderConfig {
    pub fn kind(&self) -> ProviderKind {
        self.kind.unwrap_or_default()
    }

    pub fn api_base(&self) -> &str {
        self.api_base.as_deref().unwrap_or("https://api.openai.com")
    }

    pub fn path(&self) -> &str {
        self.path.as_deref().unwrap_or("/v1/embeddings")
    }

    pub fn timeout_ms(&self) -> u64 {
        self.timeout_ms.unwrap_or(30_000)
    }

    /// Resolves the API key from the configured environment variable.
    pub fn api_key(&self) -> Option<String> {
        let var = self.api_key_env.as_deref()?;
        std::env::var(var).ok()
    }
}

/// Configuration loaded from ragrank.toml or ~/.config/ragrank/config.toml
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    #[serde(default)]
    pub embedding: EmbeddingModelConfig,

    #[serde(default)]
    pub generation: GenerationModelConfig,

    #[serde(default)]
    pub search: SearchConfig,

    #[serde(default)]
    pub chunking: ChunkingConfig,

    #[serde(default)]
    pub cache: CacheConfig,

    #[serde(default)]
    pub provider: ProviderConfig,
}

impl Config {
    /// Load configuration from files
    ///
    /// Precedence (highest to lowest):
    /// 1. ragrank.toml in current directory
    /// 2. ~/.config/ragrank/config.toml
    pub fn load() -> Self {
        if let Some(config) = Self::load_from_path(&PathBuf::from("ragrank.toml")) {
            return config;
        }

        if let Some(home) = dirs::home_dir() {
            let config_path = home.join(".config").join("ragrank").join("config.toml");
            if let Some(config) = Self::load_from_path(&config_path) {
                return config;
            }
        }

        Self::default()
    }

    fn load_from_path(path: &PathBuf) -> Option<Self> {
        let content = std::fs::read_to_string(path).ok()?;
        match toml::from_str(&content) {
            Ok(config) => Some(config),
            Err(err) => {
                warn!(path = %path.display(), error = %err, "Failed to parse config file");
                None
            }
        }
    }

    /// Resolves the ranking inputs for one `select` call.
    pub fn ranking_options(&self) -> RankingOptions {
        RankingOptions {
            top_k: self.search.top_k(),
            vector_weight: self.search.vector_weight(),
            bm25_weight: self.search.bm25_weight(),
            rerank_weight: self.search.rerank_weight(),
            use_bm25: self.search.use_bm25(),
            use_rerank: self.search.use_rerank(),
            similarity_threshold: self.search.similarity_threshold(),
            embedding_text_tokens: self.embedding.max_tokens(),
        }
    }

    /// Resolves the prompt composition budgets.
    pub fn compose_options(&self) -> ComposeOptions {
        let total = self
            .generation
            .max_context_tokens()
            .saturating_sub(self.generation.max_answer_tokens())
            .max(1);
        ComposeOptions {
            per_item_tokens: self.chunking.chunk_tokens(),
            total_tokens: total,
        }
    }

    /// Resolves the generation parameters.
    pub fn generation_options(&self) -> GenerationOptions {
        GenerationOptions {
            model: self.generation.name().to_string(),
            temperature: self.generation.temperature(),
            max_tokens: self.generation.max_answer_tokens(),
        }
    }
}
