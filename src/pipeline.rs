// SPDX-License-Identifier: MIT OR Apache-2.0

//! Orchestration over the external collaborators.
//!
//! The store, the embedding API and the generation API live outside
//! this crate; they appear here as traits so the pipeline can be
//! exercised end-to-end with test doubles. The cost-control guarantee
//! lives here too: when composition short-circuits on an empty context,
//! the generation collaborator is never invoked.

use anyhow::{Context, Result};
use serde_json::Value;
use tracing::info;

use crate::candidate::Candidate;
use crate::hybrid::ScoredCandidate;
use crate::prompt::{self, ComposeOptions, INSUFFICIENT_INFORMATION};
use crate::tokens::TokenCounter;

/// System prompt handed to the generation collaborator.
pub const SYSTEM_PROMPT: &str =
    "You are an assistant that answers questions using the provided context.";

/// Store lookup collaborator: keyword/text search or sampling within a
/// subtree, returning items in any of the accepted external shapes.
pub trait CandidateSource {
    fn fetch(&self, hint: &str, sample_size: usize) -> Result<Vec<Value>>;
}

/// Generation parameters passed through to the collaborator.
#[derive(Debug, Clone)]
pub struct GenerationOptions {
    pub model: String,
    pub temperature: f32,
    pub max_tokens: usize,
}

impl Default for GenerationOptions {
    fn default() -> Self {
        Self {
            model: "gpt-4o-latest".to_string(),
            temperature: 0.3,
            max_tokens: 2048,
        }
    }
}

/// Fetches candidates from the store and converts them into canonical
/// form, dropping values no text can be extracted from.
pub fn fetch_candidates<S: CandidateSource>(
    source: &S,
    hint: &str,
    sample_size: usize,
) -> Result<Vec<Candidate>> {
    let values = source
        .fetch(hint, sample_size)
        .context("Candidate fetch failed")?;
    Ok(Candidate::from_values(&values))
}

/// Answer-generation collaborator.
pub trait AnswerGenerator {
    fn generate(
        &self,
        system_prompt: &str,
        user_prompt: &str,
        options: &GenerationOptions,
    ) -> Result<String>;
}

/// Composes the prompt for `ranked` and asks the generator for an
/// answer.
///
/// When no candidate carries real retrieved content the fixed
/// [`INSUFFICIENT_INFORMATION`] marker is returned directly and the
/// generator is not called.
pub fn answer_query<G: AnswerGenerator>(
    query: &str,
    ranked: &[ScoredCandidate],
    generator: &G,
    tokens: &TokenCounter,
    compose_options: &ComposeOptions,
    generation_options: &GenerationOptions,
) -> Result<String> {
    let user_prompt = prompt::compose(query, ranked, tokens, compose_options);
    if user_prompt == INSUFFICIENT_INFORMATION {
        info!("Skipping generation: no usable retrieved context");
        return Ok(user_prompt);
    }

    generator
        .generate(SYSTEM_PROMPT, &user_prompt, generation_options)
        .context("Answer generation failed")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::candidate::Candidate;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingGenerator {
        calls: AtomicUsize,
    }

    impl CountingGenerator {
        fn new() -> Self {
            Self {
                calls: AtomicUsize::new(0),
            }
        }
    }

    impl AnswerGenerator for CountingGenerator {
        fn generate(
            &self,
            _system_prompt: &str,
            user_prompt: &str,
            _options: &GenerationOptions,
        ) -> Result<String> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(format!("answer to: {}", user_prompt.len()))
        }
    }

    fn scored(text: &str) -> ScoredCandidate {
        ScoredCandidate {
            candidate: Candidate::new("id", text),
            similarity: Some(0.8),
            bm25_score: None,
            rerank_score: None,
            combined_score: 0.8,
            result_id: "id".to_string(),
        }
    }

    #[test]
    fn test_generator_never_invoked_on_empty_context() {
        let generator = CountingGenerator::new();
        let tokens = TokenCounter::fallback("test");
        let answer = answer_query(
            "question?",
            &[],
            &generator,
            &tokens,
            &ComposeOptions::default(),
            &GenerationOptions::default(),
        )
        .unwrap();

        assert_eq!(answer, INSUFFICIENT_INFORMATION);
        assert_eq!(generator.calls.load(Ordering::SeqCst), 0);
    }

    struct StaticSource {
        values: Vec<serde_json::Value>,
    }

    impl CandidateSource for StaticSource {
        fn fetch(&self, _hint: &str, sample_size: usize) -> Result<Vec<serde_json::Value>> {
            Ok(self.values.iter().take(sample_size).cloned().collect())
        }
    }

    #[test]
    fn test_fetch_candidates_converts_and_filters() {
        let source = StaticSource {
            values: vec![
                serde_json::json!({"id": "a", "text": "usable"}),
                serde_json::json!({"id": "b"}),
            ],
        };
        let candidates = fetch_candidates(&source, "hint", 10).unwrap();
        assert_eq!(candidates.len(), 1);
        assert_eq!(candidates[0].id.as_deref(), Some("a"));
    }

    #[test]
    fn test_generator_invoked_with_real_context() {
        let generator = CountingGenerator::new();
        let tokens = TokenCounter::fallback("test");
        let ranked = vec![scored("relevant passage")];
        let answer = answer_query(
            "question?",
            &ranked,
            &generator,
            &tokens,
            &ComposeOptions::default(),
            &GenerationOptions::default(),
        )
        .unwrap();

        assert!(answer.starts_with("answer to:"));
        assert_eq!(generator.calls.load(Ordering::SeqCst), 1);
    }
}
