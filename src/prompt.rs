// SPDX-License-Identifier: MIT OR Apache-2.0

//! Prompt composition under a token budget.
//!
//! Selected candidates are truncated independently, assembled under
//! numbered context headers and framed with the question; the whole
//! prompt is then end-truncated to the generation model's context
//! budget. When no candidate carries real retrieved content the
//! composer short-circuits with a fixed marker so the generation model
//! is never asked to answer over an empty context.

use tracing::{debug, warn};

use crate::hybrid::ScoredCandidate;
use crate::tokens::TokenCounter;

/// Placeholder text a store may return for items with no content.
pub const NO_CONTEXT_MARKER: &str = "no information found";

/// Deterministic response returned instead of calling the generation
/// model when there is nothing to ground an answer on. A successful
/// outcome, not an error.
pub const INSUFFICIENT_INFORMATION: &str =
    "Insufficient information in the retrieved context to answer the query.";

/// Token budgets for prompt composition.
#[derive(Debug, Clone)]
pub struct ComposeOptions {
    /// Per-candidate token cap; each context block is truncated
    /// independently.
    pub per_item_tokens: usize,
    /// Cap for the assembled prompt (generation context minus the
    /// reserved answer budget).
    pub total_tokens: usize,
}

impl Default for ComposeOptions {
    fn default() -> Self {
        Self {
            per_item_tokens: 1000,
            total_tokens: 2048,
        }
    }
}

/// Assembles a generation-ready prompt from ranked candidates.
///
/// Returns [`INSUFFICIENT_INFORMATION`] when `ranked` is empty or every
/// candidate is an empty/placeholder text.
pub fn compose(
    query: &str,
    ranked: &[ScoredCandidate],
    tokens: &TokenCounter,
    options: &ComposeOptions,
) -> String {
    let real: Vec<&ScoredCandidate> = ranked
        .iter()
        .filter(|entry| has_real_content(&entry.candidate.text))
        .collect();

    if real.is_empty() {
        warn!("No retrieved content to compose a prompt from");
        return INSUFFICIENT_INFORMATION.to_string();
    }

    let mut context_blocks = Vec::with_capacity(real.len());
    for (idx, entry) in real.iter().enumerate() {
        let truncated = tokens.truncate(&entry.candidate.text, options.per_item_tokens);
        context_blocks.push(format!("Context {}:\n{}", idx + 1, truncated));
    }
    let context = context_blocks.join("\n\n");

    let prompt = format!(
        "Use the following context to answer the question.\n\
         If the information is insufficient, say so.\n\n\
         {context}\n\n\
         Question: {query}\n\n\
         Answer:"
    );

    let total = tokens.count(&prompt);
    if total > options.total_tokens {
        debug!(
            total,
            budget = options.total_tokens,
            "Prompt over budget; truncating from the end"
        );
        return tokens.truncate(&prompt, options.total_tokens);
    }
    prompt
}

fn has_real_content(text: &str) -> bool {
    let trimmed = text.trim();
    !trimmed.is_empty() && !trimmed.eq_ignore_ascii_case(NO_CONTEXT_MARKER)
}
