// SPDX-License-Identifier: MIT OR Apache-2.0

//! Hybrid fusion and selection.
//!
//! This module combines vector similarity, BM25 and optional
//! cross-encoder scores into one ranked, thresholded, size-bounded
//! result list. Signals are normalized, weighted and summed; a
//! candidate missing a signal contributes zero for that term rather
//! than having the weight redistributed, so partial signal coverage is
//! penalized instead of hidden.

use tracing::{debug, warn};

use crate::bm25;
use crate::candidate::Candidate;
use crate::embedding::{ChunkerConfig, EmbeddingService, SemanticChunker};
use crate::errors::{RetrievalError, RetrievalResult};
use crate::rerank::Reranker;
use crate::similarity;
use crate::tokens::TokenCounter;

/// Default result budget.
pub const DEFAULT_TOP_K: usize = 5;

/// Default similarity threshold below which candidates are filtered.
pub const DEFAULT_SIMILARITY_THRESHOLD: f32 = 0.3;

/// Default token budget for per-candidate embedding text.
pub const DEFAULT_EMBEDDING_TEXT_TOKENS: usize = 8191;

/// Caller-resolved ranking inputs.
///
/// The caller resolves any dynamically configured values (for instance
/// the current similarity threshold) before invoking [`HybridSearcher::select`];
/// no configuration is read mid-call.
#[derive(Debug, Clone)]
pub struct RankingOptions {
    /// Result budget; must be positive.
    pub top_k: usize,
    /// Weight of the cosine similarity signal.
    pub vector_weight: f32,
    /// Weight of the BM25 signal.
    pub bm25_weight: f32,
    /// Weight of the rerank signal, used when `use_rerank` is set.
    pub rerank_weight: f32,
    /// Whether to run lexical scoring.
    pub use_bm25: bool,
    /// Whether to refine the top slice with the cross-encoder.
    pub use_rerank: bool,
    /// Candidates below this similarity are filtered during selection.
    pub similarity_threshold: f32,
    /// Token budget for the hierarchical embedding text of a candidate.
    pub embedding_text_tokens: usize,
}

impl Default for RankingOptions {
    fn default() -> Self {
        Self {
            top_k: DEFAULT_TOP_K,
            vector_weight: 0.5,
            bm25_weight: 0.5,
            rerank_weight: 0.5,
            use_bm25: true,
            use_rerank: false,
            similarity_threshold: DEFAULT_SIMILARITY_THRESHOLD,
            embedding_text_tokens: DEFAULT_EMBEDDING_TEXT_TOKENS,
        }
    }
}

/// A candidate annotated with the signals computed for it.
///
/// Exactly one ranking key is authoritative per call — `combined_score`
/// for hybrid ranking — but every computed signal is carried so callers
/// can explain a result.
#[derive(Debug, Clone)]
pub struct ScoredCandidate {
    pub candidate: Candidate,
    /// Cosine similarity in `[-1, 1]`, clamped to 0.0 on computation
    /// failure.
    pub similarity: Option<f32>,
    /// Raw BM25 score (unbounded, corpus-relative). Absent for
    /// candidates without an id or when lexical scoring is disabled.
    pub bm25_score: Option<f32>,
    /// Cross-encoder score on the model's native scale.
    pub rerank_score: Option<f32>,
    /// Weighted sum of the normalized signals.
    pub combined_score: f32,
    /// Stable result identifier.
    pub result_id: String,
}

/// Hybrid search engine over an embedding service and an optional
/// reranker.
///
/// Stateless across calls except for the embedding cache and the
/// reranker singleton; there is no persistent search session.
pub struct HybridSearcher<'a> {
    embeddings: &'a EmbeddingService,
    reranker: Option<&'a Reranker>,
    tokens: Option<&'a TokenCounter>,
}

impl<'a> HybridSearcher<'a> {
    pub fn new(embeddings: &'a EmbeddingService) -> Self {
        Self {
            embeddings,
            reranker: None,
            tokens: None,
        }
    }

    /// Attaches the reranking service used when
    /// [`RankingOptions::use_rerank`] is set.
    pub fn with_reranker(mut self, reranker: &'a Reranker) -> Self {
        self.reranker = Some(reranker);
        self
    }

    /// Attaches a token counter for bounding per-candidate embedding
    /// text. Without one the provider's own character limit applies.
    pub fn with_token_counter(mut self, tokens: &'a TokenCounter) -> Self {
        self.tokens = Some(tokens);
        self
    }

    /// Ranks `candidates` against `query` and returns at most
    /// `options.top_k` results, descending by the authoritative score.
    ///
    /// An empty candidate slice is a valid input and yields an empty
    /// result. A single bad candidate never aborts the batch: embedding
    /// failures drop that candidate with a warning.
    pub fn select(
        &self,
        query: &str,
        candidates: &[Candidate],
        options: &RankingOptions,
    ) -> RetrievalResult<Vec<ScoredCandidate>> {
        let query = query.trim();
        if query.is_empty() {
            return Err(RetrievalError::InvalidArgument(
                "query must be a non-empty string".to_string(),
            ));
        }
        if options.top_k == 0 {
            return Err(RetrievalError::InvalidArgument(
                "top_k must be a positive integer".to_string(),
            ));
        }
        if options.use_rerank && self.reranker.is_none() {
            return Err(RetrievalError::InvalidArgument(
                "reranking requested but no reranker is configured".to_string(),
            ));
        }
        let weights = normalize_weights(options)?;
        if candidates.is_empty() {
            warn!("Empty candidate set; nothing to rank");
            return Ok(Vec::new());
        }

        // One query embedding per call, cache-aware.
        let query_vector = self.embeddings.embed(query)?;

        // Per-candidate similarity with partial failure isolation.
        let mut scored: Vec<ScoredCandidate> = Vec::with_capacity(candidates.len());
        for (idx, candidate) in candidates.iter().enumerate() {
            let similarity = match self.candidate_similarity(&query_vector, candidate, options) {
                Ok(similarity) => similarity,
                Err(err) => {
                    warn!(
                        index = idx,
                        id = ?candidate.id,
                        error = %err,
                        "Dropping candidate: embedding failed"
                    );
                    continue;
                }
            };
            scored.push(ScoredCandidate {
                result_id: result_id(candidate),
                candidate: candidate.clone(),
                similarity: Some(similarity),
                bm25_score: None,
                rerank_score: None,
                combined_score: 0.0,
            });
        }

        if scored.is_empty() {
            warn!("All candidates were dropped during scoring");
            return Ok(Vec::new());
        }

        // One BM25 pass over the surviving set; merged by candidate id.
        if options.use_bm25 {
            let texts: Vec<String> = scored.iter().map(|s| s.candidate.text.clone()).collect();
            let lexical = bm25::score(query, &texts);
            for (entry, score) in scored.iter_mut().zip(lexical) {
                if entry.candidate.id.is_some() {
                    entry.bm25_score = Some(score);
                }
            }
        }

        // Normalize and combine.
        let bm25_max = scored
            .iter()
            .filter_map(|s| s.bm25_score)
            .fold(f32::NEG_INFINITY, f32::max);
        for entry in &mut scored {
            let mut combined = 0.0;
            if let Some(similarity) = entry.similarity {
                combined += weights.vector * normalize_similarity(similarity);
            }
            if let Some(score) = entry.bm25_score {
                combined += weights.bm25 * normalize_bm25(score, bm25_max);
            }
            entry.combined_score = combined;
        }
        sort_by_score(&mut scored);

        // Refine the top slice with the cross-encoder and fold the
        // normalized rerank signal back in.
        if options.use_rerank {
            let reranker = self.reranker.expect("validated above");
            let pool_size = scored.len().min(options.top_k.saturating_mul(2));
            let pool: Vec<Candidate> = scored[..pool_size]
                .iter()
                .map(|s| s.candidate.clone())
                .collect();
            let reranked = reranker.rerank(query, &pool, pool_size)?;

            let pool_min = reranked
                .iter()
                .map(|r| r.rerank_score)
                .fold(f32::INFINITY, f32::min);
            let pool_max = reranked
                .iter()
                .map(|r| r.rerank_score)
                .fold(f32::NEG_INFINITY, f32::max);

            for reranked_entry in &reranked {
                let key = result_id(&reranked_entry.candidate);
                if let Some(entry) = scored.iter_mut().find(|s| s.result_id == key) {
                    entry.rerank_score = Some(reranked_entry.rerank_score);
                    entry.combined_score += weights.rerank
                        * normalize_minmax(reranked_entry.rerank_score, pool_min, pool_max);
                }
            }
            sort_by_score(&mut scored);
        }

        Ok(apply_selection(scored, options))
    }

    /// Similarity for one candidate: a store-supplied vector is used as
    /// is; otherwise the hierarchical embedding text is embedded, with
    /// over-budget texts chunked and scored by their best chunk.
    fn candidate_similarity(
        &self,
        query_vector: &[f32],
        candidate: &Candidate,
        options: &RankingOptions,
    ) -> RetrievalResult<f32> {
        if let Some(vector) = &candidate.embedding {
            return Ok(similarity::cosine(query_vector, vector));
        }

        let text = candidate.embedding_text();
        if let Some(tokens) = self.tokens {
            if tokens.count(&text) > options.embedding_text_tokens {
                if let Ok(config) =
                    ChunkerConfig::new(options.embedding_text_tokens, crate::embedding::chunker::DEFAULT_OVERLAP)
                {
                    let chunker = SemanticChunker::new(config, tokens);
                    let mut best: f32 = 0.0;
                    let mut any = false;
                    for (chunk_text, _meta) in chunker.chunk(&text) {
                        let vector = self.embeddings.embed(&chunk_text)?;
                        let chunk_similarity = similarity::cosine(query_vector, &vector);
                        best = if any { best.max(chunk_similarity) } else { chunk_similarity };
                        any = true;
                    }
                    if any {
                        return Ok(best);
                    }
                }
            }
        }

        let vector = self.embeddings.embed(&text)?;
        Ok(similarity::cosine(query_vector, &vector))
    }
}

struct NormalizedWeights {
    vector: f32,
    bm25: f32,
    rerank: f32,
}

/// Rescales the enabled weights proportionally so they sum to 1.
/// Out-of-sum weights are never silently ignored, and never an error.
fn normalize_weights(options: &RankingOptions) -> RetrievalResult<NormalizedWeights> {
    let bm25 = if options.use_bm25 { options.bm25_weight } else { 0.0 };
    let rerank = if options.use_rerank {
        options.rerank_weight
    } else {
        0.0
    };
    let vector = options.vector_weight;

    if vector < 0.0 || bm25 < 0.0 || rerank < 0.0 {
        return Err(RetrievalError::InvalidArgument(
            "weights must be non-negative".to_string(),
        ));
    }
    let sum = vector + bm25 + rerank;
    if sum <= 0.0 {
        return Err(RetrievalError::InvalidArgument(
            "at least one enabled weight must be positive".to_string(),
        ));
    }
    if (sum - 1.0).abs() > f32::EPSILON {
        debug!(sum, "Rescaling ranking weights to sum to 1");
    }
    Ok(NormalizedWeights {
        vector: vector / sum,
        bm25: bm25 / sum,
        rerank: rerank / sum,
    })
}

/// Maps cosine similarity from `[-1, 1]` to `[0, 1]`.
fn normalize_similarity(cosine: f32) -> f32 {
    (cosine + 1.0) / 2.0
}

/// Normalizes a BM25 score against the call's maximum.
fn normalize_bm25(score: f32, max: f32) -> f32 {
    if max <= 0.0 {
        return 0.0;
    }
    score / max
}

/// Min-max normalization over the rerank pool. Rerank scores are
/// unbounded logits, so max-only normalization misbehaves for
/// all-negative pools.
fn normalize_minmax(score: f32, min: f32, max: f32) -> f32 {
    if !min.is_finite() || !max.is_finite() {
        return 0.0;
    }
    if (max - min).abs() <= f32::EPSILON {
        return 1.0;
    }
    (score - min) / (max - min)
}

fn sort_by_score(scored: &mut [ScoredCandidate]) {
    scored.sort_by(|a, b| {
        b.combined_score
            .partial_cmp(&a.combined_score)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| {
                b.similarity
                    .unwrap_or(0.0)
                    .partial_cmp(&a.similarity.unwrap_or(0.0))
                    .unwrap_or(std::cmp::Ordering::Equal)
            })
            .then_with(|| a.candidate.id.cmp(&b.candidate.id))
    });
}

/// Selection policy over the sorted list.
///
/// Above `top_k`: filter by threshold first, then cap; if filtering
/// empties the list, fall back to the single best candidate. At or
/// below `top_k`: filter, and fall back to the whole unfiltered list
/// when the filter removes everything. The asymmetry is deliberate and
/// documented; do not unify without product review.
fn apply_selection(scored: Vec<ScoredCandidate>, options: &RankingOptions) -> Vec<ScoredCandidate> {
    let threshold = options.similarity_threshold;
    let passes =
        |entry: &ScoredCandidate| entry.similarity.unwrap_or(0.0) >= threshold;

    if scored.len() > options.top_k {
        let mut filtered: Vec<ScoredCandidate> =
            scored.iter().filter(|s| passes(s)).cloned().collect();
        if filtered.is_empty() {
            warn!(
                threshold,
                "Similarity threshold filtered out every candidate; returning the best match"
            );
            return scored.into_iter().take(1).collect();
        }
        filtered.truncate(options.top_k);
        filtered
    } else {
        let filtered: Vec<ScoredCandidate> =
            scored.iter().filter(|s| passes(s)).cloned().collect();
        if filtered.is_empty() && !scored.is_empty() {
            warn!(
                threshold,
                "Similarity threshold filtered out every candidate; returning all unfiltered"
            );
            return scored;
        }
        filtered
    }
}

/// Stable result identifier derived from the candidate's id and text.
fn result_id(candidate: &Candidate) -> String {
    let input = format!(
        "{}:{}",
        candidate.id.as_deref().unwrap_or_default(),
        candidate.text
    );
    let hash = blake3::hash(input.as_bytes());
    hash.to_hex()[..16].to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn options() -> RankingOptions {
        RankingOptions::default()
    }

    #[test]
    fn test_normalize_similarity() {
        assert!((normalize_similarity(1.0) - 1.0).abs() < 0.001);
        assert!((normalize_similarity(0.0) - 0.5).abs() < 0.001);
        assert!((normalize_similarity(-1.0) - 0.0).abs() < 0.001);
    }

    #[test]
    fn test_normalize_bm25() {
        assert!((normalize_bm25(5.0, 10.0) - 0.5).abs() < 0.001);
        assert_eq!(normalize_bm25(1.0, 0.0), 0.0);
    }

    #[test]
    fn test_normalize_minmax() {
        assert!((normalize_minmax(-2.0, -4.0, 0.0) - 0.5).abs() < 0.001);
        // Degenerate pool: everything maps to 1.
        assert_eq!(normalize_minmax(3.0, 3.0, 3.0), 1.0);
        assert_eq!(normalize_minmax(1.0, f32::INFINITY, f32::NEG_INFINITY), 0.0);
    }

    #[test]
    fn test_weight_rescaling_is_proportional() {
        let mut opts = options();
        opts.vector_weight = 2.0;
        opts.bm25_weight = 2.0;
        let weights = normalize_weights(&opts).unwrap();
        assert!((weights.vector - 0.5).abs() < 0.0001);
        assert!((weights.bm25 - 0.5).abs() < 0.0001);
        assert_eq!(weights.rerank, 0.0);
    }

    #[test]
    fn test_weight_validation() {
        let mut opts = options();
        opts.vector_weight = -1.0;
        assert!(matches!(
            normalize_weights(&opts),
            Err(RetrievalError::InvalidArgument(_))
        ));

        let mut opts = options();
        opts.vector_weight = 0.0;
        opts.bm25_weight = 0.0;
        assert!(matches!(
            normalize_weights(&opts),
            Err(RetrievalError::InvalidArgument(_))
        ));
    }

    #[test]
    fn test_disabled_bm25_weight_is_ignored() {
        let mut opts = options();
        opts.use_bm25 = false;
        opts.vector_weight = 0.5;
        opts.bm25_weight = 100.0;
        let weights = normalize_weights(&opts).unwrap();
        assert!((weights.vector - 1.0).abs() < 0.0001);
        assert_eq!(weights.bm25, 0.0);
    }

    fn scored_entry(id: &str, similarity: f32, combined: f32) -> ScoredCandidate {
        let candidate = Candidate::new(id, format!("text {}", id));
        ScoredCandidate {
            result_id: result_id(&candidate),
            candidate,
            similarity: Some(similarity),
            bm25_score: None,
            rerank_score: None,
            combined_score: combined,
        }
    }

    #[test]
    fn test_selection_filters_then_caps() {
        let mut opts = options();
        opts.top_k = 2;
        opts.similarity_threshold = 0.5;
        let scored = vec![
            scored_entry("a", 0.9, 0.9),
            scored_entry("b", 0.8, 0.8),
            scored_entry("c", 0.7, 0.7),
            scored_entry("d", 0.1, 0.1),
        ];
        let selected = apply_selection(scored, &opts);
        assert_eq!(selected.len(), 2);
        assert_eq!(selected[0].candidate.id.as_deref(), Some("a"));
    }

    #[test]
    fn test_selection_single_best_fallback_above_top_k() {
        let mut opts = options();
        opts.top_k = 2;
        opts.similarity_threshold = 0.95;
        let scored = vec![
            scored_entry("a", 0.4, 0.4),
            scored_entry("b", 0.3, 0.3),
            scored_entry("c", 0.2, 0.2),
        ];
        let selected = apply_selection(scored, &opts);
        assert_eq!(selected.len(), 1);
        assert_eq!(selected[0].candidate.id.as_deref(), Some("a"));
    }

    #[test]
    fn test_selection_returns_all_unfiltered_at_or_below_top_k() {
        let mut opts = options();
        opts.top_k = 5;
        opts.similarity_threshold = 0.95;
        let scored = vec![scored_entry("a", 0.4, 0.4), scored_entry("b", 0.3, 0.3)];
        let selected = apply_selection(scored, &opts);
        assert_eq!(selected.len(), 2);
    }

    #[test]
    fn test_result_id_stability() {
        let a = Candidate::new("x", "same text");
        let b = Candidate::new("x", "same text");
        let c = Candidate::new("y", "same text");
        assert_eq!(result_id(&a), result_id(&b));
        assert_ne!(result_id(&a), result_id(&c));
    }
}
