// SPDX-License-Identifier: MIT OR Apache-2.0

//! ragrank - Hybrid retrieval and ranking core for RAG pipelines
//!
//! Combines vector similarity, lexical BM25 scoring and optional
//! cross-encoder reranking into a single ranked, budget-constrained
//! result set, then composes a token-budgeted prompt for answer
//! generation. The document store, the embedding API and the generation
//! API are external collaborators behind traits.

pub mod bm25;
pub mod candidate;
pub mod config;
pub mod embedding;
pub mod errors;
pub mod hybrid;
pub mod pipeline;
pub mod prompt;
pub mod rerank;
pub mod similarity;
pub mod tokens;

pub use candidate::{Candidate, RelatedItem};
pub use embedding::{EmbeddingCache, EmbeddingService};
pub use errors::{RetrievalError, RetrievalResult};
pub use hybrid::{HybridSearcher, RankingOptions, ScoredCandidate};
pub use prompt::{ComposeOptions, INSUFFICIENT_INFORMATION};
pub use rerank::Reranker;
pub use tokens::TokenCounter;
