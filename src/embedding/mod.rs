// SPDX-License-Identifier: MIT OR Apache-2.0

//! Embedding module - providers, content-addressed cache and chunking.
//!
//! [`EmbeddingService`] ties the pieces together: a cache-aware `embed`
//! that consults the SQLite cache first, falls through to the provider,
//! and writes back best-effort. Cache failures never propagate; the
//! provider must stay reachable even when the cache is not.

pub mod cache;
pub mod chunker;
pub mod provider;

pub use cache::{EmbeddingCache, FrequentEntry, DEFAULT_MAX_TEXT_LEN};
pub use chunker::{ChunkKind, ChunkMeta, ChunkerConfig, SemanticChunker};
pub use provider::{
    DummyEmbedder, EmbeddingProvider, FastEmbedder, HttpEmbedder, HttpEmbedderConfig,
    DEFAULT_TIMEOUT_MS,
};

use std::sync::Mutex;
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::errors::{RetrievalError, RetrievalResult};

/// Cache-aware embedding front end.
///
/// Stateless apart from the cache and the provider handle; safe to share
/// across request threads (provider and cache are mutex-guarded, cache
/// writes resolve last-write-wins).
pub struct EmbeddingService {
    provider: Mutex<Box<dyn EmbeddingProvider>>,
    cache: Option<Mutex<EmbeddingCache>>,
    model_id: String,
    model_version: String,
    dimensions: usize,
    timeout: Duration,
}

impl EmbeddingService {
    /// Wraps a provider with the given model version and expected
    /// dimensionality. No cache until [`with_cache`](Self::with_cache).
    pub fn new(provider: Box<dyn EmbeddingProvider>, model_version: &str, dimensions: usize) -> Self {
        let model_id = provider.model_id().to_string();
        Self {
            provider: Mutex::new(provider),
            cache: None,
            model_id,
            model_version: model_version.to_string(),
            dimensions,
            timeout: Duration::from_millis(DEFAULT_TIMEOUT_MS),
        }
    }

    /// Attaches an embedding cache.
    pub fn with_cache(mut self, cache: EmbeddingCache) -> Self {
        self.cache = Some(Mutex::new(cache));
        self
    }

    /// Records the provider's bounded timeout, reported in
    /// [`RetrievalError::Timeout`] when the provider stalls.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// The embedding model identifier.
    pub fn model_id(&self) -> &str {
        &self.model_id
    }

    /// The configured vector dimensionality.
    pub fn dimensions(&self) -> usize {
        self.dimensions
    }

    /// Returns the embedding for `text`, consulting the cache first.
    ///
    /// Cache read and write failures are logged and treated as misses;
    /// provider failures surface as [`RetrievalError::EmbeddingFailure`]
    /// (or [`RetrievalError::Timeout`] when the provider timed out).
    pub fn embed(&self, text: &str) -> RetrievalResult<Vec<f32>> {
        if let Some(cache) = &self.cache {
            let cache = cache.lock().expect("cache lock poisoned");
            match cache.get(text, &self.model_id, &self.model_version, self.dimensions) {
                Ok(Some(vector)) => {
                    debug!(model = %self.model_id, "Embedding cache hit");
                    return Ok(vector);
                }
                Ok(None) => {}
                Err(err) => {
                    warn!(error = %err, "Embedding cache read failed; treating as miss");
                }
            }
        }

        let vector = {
            let mut provider = self.provider.lock().expect("provider lock poisoned");
            provider.embed_one(text).map_err(|err| self.classify(err))?
        };

        if vector.len() != self.dimensions {
            warn!(
                model = %self.model_id,
                got = vector.len(),
                expected = self.dimensions,
                "Provider returned unexpected dimensionality"
            );
        }

        if let Some(cache) = &self.cache {
            let cache = cache.lock().expect("cache lock poisoned");
            if let Err(err) = cache.put(text, &vector, &self.model_id, &self.model_version) {
                warn!(error = %err, "Embedding cache write failed; continuing without");
            }
        }

        Ok(vector)
    }

    /// Walks the most frequently used cached texts and embeds each one,
    /// re-computing entries that were purged as stale. Returns how many
    /// texts were verified or refreshed.
    pub fn warm_up(&self, limit: usize) -> usize {
        let Some(cache) = &self.cache else {
            return 0;
        };
        let entries = {
            let cache = cache.lock().expect("cache lock poisoned");
            match cache.frequent(&self.model_id, &self.model_version, limit) {
                Ok(entries) => entries,
                Err(err) => {
                    warn!(error = %err, "Cache warm-up listing failed");
                    return 0;
                }
            }
        };

        let mut warmed = 0;
        for entry in entries {
            match self.embed(&entry.text) {
                Ok(_) => warmed += 1,
                Err(err) => {
                    warn!(error = %err, "Warm-up embedding failed");
                    break;
                }
            }
        }
        if warmed > 0 {
            info!(warmed, "Embedding cache warm-up complete");
        }
        warmed
    }

    fn classify(&self, err: anyhow::Error) -> RetrievalError {
        let timed_out = err.chain().any(|cause| {
            cause
                .downcast_ref::<reqwest::Error>()
                .is_some_and(reqwest::Error::is_timeout)
        });
        if timed_out {
            RetrievalError::Timeout(self.timeout)
        } else {
            RetrievalError::EmbeddingFailure(err)
        }
    }
}
