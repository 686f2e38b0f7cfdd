// SPDX-License-Identifier: MIT OR Apache-2.0

//! Token counting and truncation.
//!
//! Chunk budgets and prompt budgets are expressed in tokens of the
//! target model. When the model's tokenizer can be loaded it is used
//! directly; otherwise counting falls back to a whitespace-word
//! encoding so the pipeline keeps functioning offline.

use tokenizers::Tokenizer;
use tracing::warn;

enum Encoding {
    /// Model tokenizer loaded from the HuggingFace hub or a local cache.
    Model(Box<Tokenizer>),
    /// Whitespace-word fallback when no tokenizer is available.
    Words,
}

/// Counts and truncates text in tokens of a configured model.
pub struct TokenCounter {
    encoding: Encoding,
    model: String,
}

impl TokenCounter {
    /// Creates a counter for the given model identifier, falling back to
    /// the word encoding if the tokenizer cannot be loaded.
    pub fn for_model(model: &str) -> Self {
        match Tokenizer::from_pretrained(model, None) {
            Ok(tokenizer) => Self {
                encoding: Encoding::Model(Box::new(tokenizer)),
                model: model.to_string(),
            },
            Err(err) => {
                warn!(model, error = %err, "Tokenizer unavailable; using word fallback");
                Self::fallback(model)
            }
        }
    }

    /// Creates a counter that always uses the whitespace-word encoding.
    pub fn fallback(model: &str) -> Self {
        Self {
            encoding: Encoding::Words,
            model: model.to_string(),
        }
    }

    /// Wraps an already loaded tokenizer.
    pub fn from_tokenizer(model: &str, tokenizer: Tokenizer) -> Self {
        Self {
            encoding: Encoding::Model(Box::new(tokenizer)),
            model: model.to_string(),
        }
    }

    /// The model identifier this counter was configured for.
    pub fn model(&self) -> &str {
        &self.model
    }

    /// Returns the number of tokens in `text`.
    pub fn count(&self, text: &str) -> usize {
        match &self.encoding {
            Encoding::Model(tokenizer) => match tokenizer.encode(text, false) {
                Ok(encoding) => encoding.len(),
                Err(err) => {
                    warn!(error = %err, "Tokenizer encode failed; using word fallback");
                    text.split_whitespace().count()
                }
            },
            Encoding::Words => text.split_whitespace().count(),
        }
    }

    /// Truncates `text` to at most `max_tokens` tokens.
    ///
    /// With a model tokenizer this encodes, truncates the id sequence and
    /// decodes, so a multi-byte token is never cut in half. The fallback
    /// encoding truncates on word boundaries.
    pub fn truncate(&self, text: &str, max_tokens: usize) -> String {
        if max_tokens == 0 {
            return String::new();
        }
        match &self.encoding {
            Encoding::Model(tokenizer) => {
                let encoding = match tokenizer.encode(text, false) {
                    Ok(encoding) => encoding,
                    Err(err) => {
                        warn!(error = %err, "Tokenizer encode failed; truncating on words");
                        return truncate_words(text, max_tokens);
                    }
                };
                if encoding.len() <= max_tokens {
                    return text.to_string();
                }
                let ids = &encoding.get_ids()[..max_tokens];
                match tokenizer.decode(ids, true) {
                    Ok(decoded) => decoded,
                    Err(err) => {
                        warn!(error = %err, "Tokenizer decode failed; truncating on words");
                        truncate_words(text, max_tokens)
                    }
                }
            }
            Encoding::Words => truncate_words(text, max_tokens),
        }
    }
}

fn truncate_words(text: &str, max_tokens: usize) -> String {
    let words: Vec<&str> = text.split_whitespace().collect();
    if words.len() <= max_tokens {
        return text.to_string();
    }
    words[..max_tokens].join(" ")
}
