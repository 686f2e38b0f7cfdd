// SPDX-License-Identifier: MIT OR Apache-2.0

//! Cross-encoder reranking.
//!
//! A cross-encoder jointly scores (query, text) pairs and is far more
//! accurate than comparing independently computed embeddings, but the
//! model is expensive to load. [`Reranker`] is an injectable service
//! that initializes the model at most once per process with bounded
//! retries, and serializes scoring calls behind the same lock.

use std::sync::Mutex;

use anyhow::{anyhow, Result};
use fastembed::{RerankInitOptions, RerankerModel, TextRerank};
use once_cell::sync::OnceCell;
use tracing::{debug, info, warn};

use crate::candidate::Candidate;
use crate::errors::{RetrievalError, RetrievalResult};

/// Default number of pairs per scoring batch.
pub const DEFAULT_RERANK_BATCH_SIZE: usize = 64;

/// Default bounded retry count for model initialization.
pub const DEFAULT_MAX_RETRIES: u32 = 3;

/// Trait for cross-encoder models scoring (query, text) pairs.
pub trait CrossEncoder: Send {
    /// Returns the model identifier.
    fn model_id(&self) -> &str;

    /// Scores each text against the query, in input order, on the
    /// model's native scale.
    fn score_pairs(&mut self, query: &str, texts: &[String], batch_size: usize)
        -> Result<Vec<f32>>;
}

/// FastEmbed-backed cross-encoder (BGE reranker family).
pub struct FastEmbedCrossEncoder {
    model: TextRerank,
    model_id: String,
}

impl FastEmbedCrossEncoder {
    pub fn new(model: RerankerModel) -> Result<Self> {
        let model_id = model.to_string();
        let reranker = TextRerank::try_new(RerankInitOptions::new(model))?;
        Ok(Self {
            model: reranker,
            model_id,
        })
    }

    /// Creates the default BGE base reranker.
    pub fn with_defaults() -> Result<Self> {
        Self::new(RerankerModel::BGERerankerBase)
    }
}

impl CrossEncoder for FastEmbedCrossEncoder {
    fn model_id(&self) -> &str {
        &self.model_id
    }

    fn score_pairs(
        &mut self,
        query: &str,
        texts: &[String],
        batch_size: usize,
    ) -> Result<Vec<f32>> {
        let documents: Vec<&str> = texts.iter().map(String::as_str).collect();
        let results = self
            .model
            .rerank(query, documents, false, Some(batch_size))?;

        // Results come back sorted by relevance; realign by index.
        let mut scores = vec![0.0f32; texts.len()];
        for result in results {
            if let Some(slot) = scores.get_mut(result.index) {
                *slot = result.score;
            }
        }
        Ok(scores)
    }
}

/// A candidate annotated with its cross-encoder score.
#[derive(Debug, Clone)]
pub struct RerankedCandidate {
    pub candidate: Candidate,
    pub rerank_score: f32,
}

type EncoderFactory = Box<dyn Fn() -> Result<Box<dyn CrossEncoder>> + Send + Sync>;

/// Lazily initialized reranking service.
///
/// Construct once at process start and pass by reference into the
/// fusion component; the underlying model loads on first use.
pub struct Reranker {
    factory: EncoderFactory,
    encoder: OnceCell<Mutex<Box<dyn CrossEncoder>>>,
    max_retries: u32,
    batch_size: usize,
}

impl Reranker {
    /// Creates a service around an encoder factory. The factory runs at
    /// most `max_retries` times, on first use.
    pub fn new<F>(factory: F) -> Self
    where
        F: Fn() -> Result<Box<dyn CrossEncoder>> + Send + Sync + 'static,
    {
        Self {
            factory: Box::new(factory),
            encoder: OnceCell::new(),
            max_retries: DEFAULT_MAX_RETRIES,
            batch_size: DEFAULT_RERANK_BATCH_SIZE,
        }
    }

    /// Service backed by the default local BGE reranker.
    pub fn fastembed() -> Self {
        Self::new(|| {
            FastEmbedCrossEncoder::with_defaults().map(|e| Box::new(e) as Box<dyn CrossEncoder>)
        })
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries.max(1);
        self
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }

    /// The configured scoring batch size.
    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    fn encoder(&self) -> Result<&Mutex<Box<dyn CrossEncoder>>, RetrievalError> {
        self.encoder.get_or_try_init(|| {
            let mut last_error = None;
            for attempt in 1..=self.max_retries {
                match (self.factory)() {
                    Ok(encoder) => {
                        info!(attempt, model = encoder.model_id(), "Reranker model initialized");
                        return Ok(Mutex::new(encoder));
                    }
                    Err(err) => {
                        warn!(attempt, error = %err, "Reranker initialization failed");
                        last_error = Some(err);
                    }
                }
            }
            Err(RetrievalError::ModelUnavailable {
                attempts: self.max_retries,
                source: last_error.unwrap_or_else(|| anyhow!("no initialization attempts made")),
            })
        })
    }

    /// Scores `candidates` against `query` and returns the `top_k` best,
    /// descending by `rerank_score`.
    ///
    /// Candidates with empty or whitespace text are silently excluded
    /// (logged at warning level) — size-reducing, not an error. Returned
    /// candidates are copies; the caller's slice is never mutated.
    ///
    /// Initialization failure after bounded retries surfaces as
    /// [`RetrievalError::ModelUnavailable`]; a scoring failure after
    /// successful initialization surfaces as
    /// [`RetrievalError::ScoringFailure`].
    pub fn rerank(
        &self,
        query: &str,
        candidates: &[Candidate],
        top_k: usize,
    ) -> RetrievalResult<Vec<RerankedCandidate>> {
        if query.trim().is_empty() {
            return Err(RetrievalError::InvalidArgument(
                "query must be a non-empty string".to_string(),
            ));
        }
        if top_k == 0 {
            return Err(RetrievalError::InvalidArgument(
                "top_k must be a positive integer".to_string(),
            ));
        }
        if candidates.is_empty() {
            warn!("Received empty candidate list for reranking");
            return Ok(Vec::new());
        }

        let mut texts = Vec::with_capacity(candidates.len());
        let mut kept: Vec<&Candidate> = Vec::with_capacity(candidates.len());
        let mut skipped = 0usize;
        for (idx, candidate) in candidates.iter().enumerate() {
            if candidate.text.trim().is_empty() {
                warn!(index = idx, id = ?candidate.id, "Skipping candidate with empty text");
                skipped += 1;
                continue;
            }
            texts.push(candidate.text.clone());
            kept.push(candidate);
        }
        debug!(
            pairs = texts.len(),
            skipped, "Prepared candidate pairs for reranking"
        );

        if texts.is_empty() {
            warn!("No valid pairs for reranking; returning empty list");
            return Ok(Vec::new());
        }

        let encoder = self.encoder()?;
        let scores = {
            let mut encoder = encoder.lock().expect("encoder lock poisoned");
            encoder
                .score_pairs(query, &texts, self.batch_size)
                .map_err(RetrievalError::ScoringFailure)?
        };

        let mut reranked: Vec<RerankedCandidate> = kept
            .into_iter()
            .zip(scores)
            .map(|(candidate, rerank_score)| RerankedCandidate {
                candidate: candidate.clone(),
                rerank_score,
            })
            .collect();

        reranked.sort_by(|a, b| {
            b.rerank_score
                .partial_cmp(&a.rerank_score)
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        reranked.truncate(top_k);
        Ok(reranked)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    /// Deterministic encoder: scores by shared-word overlap with the query.
    struct OverlapEncoder;

    impl CrossEncoder for OverlapEncoder {
        fn model_id(&self) -> &str {
            "overlap-test"
        }

        fn score_pairs(
            &mut self,
            query: &str,
            texts: &[String],
            _batch_size: usize,
        ) -> Result<Vec<f32>> {
            let query_words: Vec<String> =
                query.split_whitespace().map(|w| w.to_lowercase()).collect();
            Ok(texts
                .iter()
                .map(|text| {
                    let text = text.to_lowercase();
                    query_words.iter().filter(|w| text.contains(*w)).count() as f32
                })
                .collect())
        }
    }

    fn overlap_reranker() -> Reranker {
        Reranker::new(|| Ok(Box::new(OverlapEncoder) as Box<dyn CrossEncoder>))
    }

    fn candidate(id: &str, text: &str) -> Candidate {
        Candidate::new(id, text)
    }

    #[test]
    fn test_rerank_orders_descending() {
        let reranker = overlap_reranker();
        let candidates = vec![
            candidate("a", "nothing in common"),
            candidate("b", "machine learning systems"),
            candidate("c", "machine shop"),
        ];
        let result = reranker.rerank("machine learning", &candidates, 3).unwrap();
        assert_eq!(result.len(), 3);
        assert_eq!(result[0].candidate.id.as_deref(), Some("b"));
        assert_eq!(result[1].candidate.id.as_deref(), Some("c"));
        assert!(result[0].rerank_score >= result[1].rerank_score);
    }

    #[test]
    fn test_rerank_truncates_to_top_k() {
        let reranker = overlap_reranker();
        let candidates = vec![
            candidate("a", "machine one"),
            candidate("b", "machine two"),
            candidate("c", "machine three"),
        ];
        let result = reranker.rerank("machine", &candidates, 2).unwrap();
        assert_eq!(result.len(), 2);
    }

    #[test]
    fn test_empty_texts_silently_excluded() {
        let reranker = overlap_reranker();
        let candidates = vec![
            candidate("a", "machine"),
            candidate("b", "   "),
            candidate("c", ""),
        ];
        let result = reranker.rerank("machine", &candidates, 10).unwrap();
        assert_eq!(result.len(), 1);
        assert_eq!(result[0].candidate.id.as_deref(), Some("a"));
    }

    #[test]
    fn test_input_not_mutated() {
        let reranker = overlap_reranker();
        let candidates = vec![candidate("a", "machine")];
        let before = candidates.clone();
        let _ = reranker.rerank("machine", &candidates, 1).unwrap();
        assert_eq!(candidates, before);
    }

    #[test]
    fn test_invalid_arguments() {
        let reranker = overlap_reranker();
        let candidates = vec![candidate("a", "text")];
        assert!(matches!(
            reranker.rerank("  ", &candidates, 1),
            Err(RetrievalError::InvalidArgument(_))
        ));
        assert!(matches!(
            reranker.rerank("q", &candidates, 0),
            Err(RetrievalError::InvalidArgument(_))
        ));
    }

    #[test]
    fn test_empty_candidates_is_valid() {
        let reranker = overlap_reranker();
        assert!(reranker.rerank("q", &[], 5).unwrap().is_empty());
    }

    #[test]
    fn test_initialization_retries_then_fails() {
        let attempts = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&attempts);
        let reranker = Reranker::new(move || {
            counter.fetch_add(1, Ordering::SeqCst);
            Err(anyhow!("model download failed"))
        })
        .with_max_retries(3);

        let candidates = vec![candidate("a", "text")];
        let err = reranker.rerank("q", &candidates, 1).unwrap_err();
        assert!(matches!(
            err,
            RetrievalError::ModelUnavailable { attempts: 3, .. }
        ));
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn test_model_loads_once() {
        let loads = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&loads);
        let reranker = Reranker::new(move || {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(Box::new(OverlapEncoder) as Box<dyn CrossEncoder>)
        });

        let candidates = vec![candidate("a", "machine")];
        reranker.rerank("machine", &candidates, 1).unwrap();
        reranker.rerank("machine", &candidates, 1).unwrap();
        assert_eq!(loads.load(Ordering::SeqCst), 1);
    }
}
