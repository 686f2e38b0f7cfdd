// SPDX-License-Identifier: MIT OR Apache-2.0

//! Error types for the retrieval core.
//!
//! The propagation policy is two-tier: anything that can be substituted
//! with a safe default (a failed similarity computation, a cache I/O
//! error, a single malformed candidate) is logged and handled locally;
//! anything that means the requested capability cannot be delivered at
//! all surfaces as a [`RetrievalError`].

use std::time::Duration;

use thiserror::Error;

/// Fatal, caller-visible failures of the retrieval pipeline.
#[derive(Debug, Error)]
pub enum RetrievalError {
    /// Bad caller input: empty query, zero `top_k`, negative weights.
    /// Never retried.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// The reranker model could not be initialized after bounded retries.
    /// Reranking was explicitly requested, so this is fatal for the call.
    #[error("reranker model unavailable after {attempts} attempts")]
    ModelUnavailable {
        attempts: u32,
        #[source]
        source: anyhow::Error,
    },

    /// The reranker batch scoring call failed after successful
    /// initialization. Indicates a systemic issue (bad model state, OOM)
    /// that higher-level retries must handle.
    #[error("rerank scoring failed")]
    ScoringFailure(#[source] anyhow::Error),

    /// The query embedding could not be computed. Per-candidate embedding
    /// failures are isolated and dropped, but without a query vector the
    /// ranking capability cannot be delivered at all.
    #[error("query embedding failed")]
    EmbeddingFailure(#[source] anyhow::Error),

    /// A provider-backed call exceeded its bounded wall-clock limit.
    #[error("operation timed out after {0:?}")]
    Timeout(Duration),
}

/// Per-candidate ingestion failure: no usable text could be derived from
/// the external representation. These are dropped and logged by batch
/// conversion, never surfaced to the caller.
#[derive(Debug, Error)]
pub enum ExtractionError {
    #[error("candidate is not a JSON object")]
    NotAnObject,
    #[error("no text field could be extracted")]
    MissingText,
    #[error("extracted text is empty or whitespace")]
    EmptyText,
}

/// Convenience alias used by the pipeline entry points.
pub type RetrievalResult<T> = std::result::Result<T, RetrievalError>;
