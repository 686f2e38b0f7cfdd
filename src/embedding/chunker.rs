// SPDX-License-Identifier: MIT OR Apache-2.0

//! Token-bounded semantic chunker for embedding generation.
//!
//! Long documents are split on blank-line paragraph boundaries first;
//! any paragraph over the token budget is re-split on sentence
//! boundaries. Units accumulate into chunks, and consecutive chunks
//! overlap by a configurable fraction of the budget so context survives
//! the cut. The chunker never fails on malformed input; the worst case
//! is the whole text as a single chunk.

use anyhow::{bail, Result};
use once_cell::sync::Lazy;
use regex::Regex;

use crate::tokens::TokenCounter;

/// Default token budget per chunk.
pub const DEFAULT_MAX_TOKENS: usize = 1000;

/// Default overlap between consecutive chunks, as a fraction of the
/// token budget.
pub const DEFAULT_OVERLAP: f32 = 0.1;

static PARAGRAPH_BREAK: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\n[ \t]*\n").expect("valid paragraph regex"));

static SENTENCE_END: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#"[.!?]+[)"'»]*\s+"#).expect("valid sentence regex"));

/// Abbreviations that should not terminate a sentence.
const ABBREVIATIONS: &[&str] = &[
    "e.g", "i.e", "mr", "mrs", "ms", "dr", "prof", "st", "vs", "etc", "no", "fig",
];

/// Configuration for the semantic chunker.
#[derive(Debug, Clone)]
pub struct ChunkerConfig {
    /// Maximum tokens per chunk.
    pub max_tokens: usize,
    /// Overlap between consecutive chunks as a fraction of `max_tokens`
    /// (0.0 to < 1.0).
    pub overlap: f32,
}

impl Default for ChunkerConfig {
    fn default() -> Self {
        Self {
            max_tokens: DEFAULT_MAX_TOKENS,
            overlap: DEFAULT_OVERLAP,
        }
    }
}

impl ChunkerConfig {
    /// Creates a new config with the specified budget and overlap.
    pub fn new(max_tokens: usize, overlap: f32) -> Result<Self> {
        if max_tokens == 0 {
            bail!("max_tokens must be greater than 0");
        }
        if !(0.0..1.0).contains(&overlap) {
            bail!("overlap ({}) must be in [0.0, 1.0)", overlap);
        }
        Ok(Self { max_tokens, overlap })
    }
}

/// How a chunk's boundaries were derived.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChunkKind {
    /// The whole input fit in one chunk.
    Document,
    /// Built from whole paragraphs.
    Paragraph,
    /// At least one paragraph had to be re-split on sentences.
    Sentence,
}

/// Metadata attached to each produced chunk.
#[derive(Debug, Clone, PartialEq)]
pub struct ChunkMeta {
    pub kind: ChunkKind,
    pub token_count: usize,
    /// True when the chunk carries the complete input text.
    pub is_complete: bool,
}

#[derive(Debug)]
struct Unit {
    text: String,
    tokens: usize,
    kind: ChunkKind,
}

/// Splits text into token-bounded overlapping chunks.
pub struct SemanticChunker<'a> {
    config: ChunkerConfig,
    tokens: &'a TokenCounter,
}

impl<'a> SemanticChunker<'a> {
    pub fn new(config: ChunkerConfig, tokens: &'a TokenCounter) -> Self {
        Self { config, tokens }
    }

    pub fn config(&self) -> &ChunkerConfig {
        &self.config
    }

    /// Splits `text` into chunks of at most `max_tokens` tokens each,
    /// with consecutive chunks sharing a trailing-overlap seed.
    ///
    /// A text at or under budget yields exactly one complete chunk.
    pub fn chunk(&self, text: &str) -> Vec<(String, ChunkMeta)> {
        if text.trim().is_empty() {
            return Vec::new();
        }

        let total_tokens = self.tokens.count(text);
        if total_tokens <= self.config.max_tokens {
            return vec![(
                text.to_string(),
                ChunkMeta {
                    kind: ChunkKind::Document,
                    token_count: total_tokens,
                    is_complete: true,
                },
            )];
        }

        let units = self.collect_units(text);
        if units.is_empty() {
            // Nothing splittable; fall back to the whole text.
            return vec![(
                text.to_string(),
                ChunkMeta {
                    kind: ChunkKind::Document,
                    token_count: total_tokens,
                    is_complete: true,
                },
            )];
        }

        let overlap_budget =
            (self.config.overlap * self.config.max_tokens as f32).floor() as usize;
        let mut chunks: Vec<(String, ChunkMeta)> = Vec::new();
        let mut buffer: Vec<Unit> = Vec::new();
        let mut buffer_tokens = 0usize;

        for unit in units {
            if buffer_tokens + unit.tokens > self.config.max_tokens && !buffer.is_empty() {
                chunks.push(self.close_chunk(&buffer));

                // Seed the next chunk with trailing units up to the
                // overlap budget. Never seed with the entire buffer, so
                // iteration always advances.
                let mut seed: Vec<Unit> = Vec::new();
                let mut seed_tokens = 0usize;
                while let Some(last) = buffer.last() {
                    if seed.len() + 1 >= buffer.len()
                        || seed_tokens + last.tokens > overlap_budget
                    {
                        break;
                    }
                    let last = buffer.pop().expect("buffer non-empty");
                    seed_tokens += last.tokens;
                    seed.insert(0, last);
                }
                buffer = seed;
                buffer_tokens = seed_tokens;

                // Drop seed units oldest-first if the incoming unit still
                // does not fit beside them.
                while buffer_tokens + unit.tokens > self.config.max_tokens
                    && !buffer.is_empty()
                {
                    let dropped = buffer.remove(0);
                    buffer_tokens -= dropped.tokens;
                }
            }
            buffer_tokens += unit.tokens;
            buffer.push(unit);
        }

        if !buffer.is_empty() {
            chunks.push(self.close_chunk(&buffer));
        }

        chunks
    }

    fn close_chunk(&self, units: &[Unit]) -> (String, ChunkMeta) {
        let mut text = String::new();
        let mut kind = ChunkKind::Paragraph;
        for (idx, unit) in units.iter().enumerate() {
            if idx > 0 {
                if unit.kind == ChunkKind::Paragraph
                    && units[idx - 1].kind == ChunkKind::Paragraph
                {
                    text.push_str("\n\n");
                } else {
                    text.push(' ');
                }
            }
            text.push_str(&unit.text);
            if unit.kind == ChunkKind::Sentence {
                kind = ChunkKind::Sentence;
            }
        }
        let token_count = self.tokens.count(&text);
        (
            text,
            ChunkMeta {
                kind,
                token_count,
                is_complete: false,
            },
        )
    }

    fn collect_units(&self, text: &str) -> Vec<Unit> {
        let mut units = Vec::new();
        for paragraph in PARAGRAPH_BREAK.split(text) {
            let paragraph = paragraph.trim();
            if paragraph.is_empty() {
                continue;
            }
            let tokens = self.tokens.count(paragraph);
            if tokens <= self.config.max_tokens {
                units.push(Unit {
                    text: paragraph.to_string(),
                    tokens,
                    kind: ChunkKind::Paragraph,
                });
                continue;
            }
            for sentence in split_sentences(paragraph) {
                let tokens = self.tokens.count(sentence);
                if tokens <= self.config.max_tokens {
                    units.push(Unit {
                        text: sentence.to_string(),
                        tokens,
                        kind: ChunkKind::Sentence,
                    });
                } else {
                    // A single runaway sentence: hard-split on word
                    // windows so no unit exceeds the budget.
                    for piece in self.split_window(sentence) {
                        let tokens = self.tokens.count(&piece);
                        units.push(Unit {
                            text: piece,
                            tokens,
                            kind: ChunkKind::Sentence,
                        });
                    }
                }
            }
        }
        units
    }

    fn split_window(&self, text: &str) -> Vec<String> {
        let mut pieces = Vec::new();
        let mut current: Vec<&str> = Vec::new();
        let mut current_tokens = 0usize;
        for word in text.split_whitespace() {
            let word_tokens = self.tokens.count(word).max(1);
            if current_tokens + word_tokens > self.config.max_tokens && !current.is_empty() {
                pieces.push(current.join(" "));
                current.clear();
                current_tokens = 0;
            }
            current.push(word);
            current_tokens += word_tokens;
        }
        if !current.is_empty() {
            pieces.push(current.join(" "));
        }
        pieces
    }
}

/// Regex-based sentence splitter tolerant of common abbreviations.
fn split_sentences(text: &str) -> Vec<&str> {
    let mut sentences = Vec::new();
    let mut start = 0usize;
    for boundary in SENTENCE_END.find_iter(text) {
        let segment = &text[start..boundary.end()];
        if ends_with_abbreviation(segment) {
            continue;
        }
        let trimmed = segment.trim();
        if !trimmed.is_empty() {
            sentences.push(trimmed);
        }
        start = boundary.end();
    }
    let tail = text[start..].trim();
    if !tail.is_empty() {
        sentences.push(tail);
    }
    sentences
}

fn ends_with_abbreviation(segment: &str) -> bool {
    let trimmed = segment
        .trim_end()
        .trim_end_matches(|c| matches!(c, '.' | '!' | '?' | ')' | '"' | '\'' | '»'));
    let Some(last_word) = trimmed.split_whitespace().last() else {
        return false;
    };
    let last_word = last_word.to_lowercase();
    ABBREVIATIONS.contains(&last_word.as_str())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn counter() -> TokenCounter {
        TokenCounter::fallback("test-model")
    }

    #[test]
    fn test_config_validation() {
        assert!(ChunkerConfig::new(100, 0.1).is_ok());
        assert!(ChunkerConfig::new(0, 0.1).is_err());
        assert!(ChunkerConfig::new(100, 1.0).is_err());
        assert!(ChunkerConfig::new(100, -0.1).is_err());
    }

    #[test]
    fn test_short_text_single_complete_chunk() {
        let tokens = counter();
        let chunker = SemanticChunker::new(ChunkerConfig::new(50, 0.1).unwrap(), &tokens);
        let chunks = chunker.chunk("a short text");
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].0, "a short text");
        assert!(chunks[0].1.is_complete);
        assert_eq!(chunks[0].1.kind, ChunkKind::Document);
        assert_eq!(chunks[0].1.token_count, 3);
    }

    #[test]
    fn test_empty_text_yields_nothing() {
        let tokens = counter();
        let chunker = SemanticChunker::new(ChunkerConfig::default(), &tokens);
        assert!(chunker.chunk("").is_empty());
        assert!(chunker.chunk("   \n\n  ").is_empty());
    }

    #[test]
    fn test_paragraph_split() {
        let tokens = counter();
        let chunker = SemanticChunker::new(ChunkerConfig::new(6, 0.0).unwrap(), &tokens);
        let text = "one two three four\n\nfive six seven eight\n\nnine ten eleven twelve";
        let chunks = chunker.chunk(text);
        assert!(chunks.len() > 1);
        for (_, meta) in &chunks {
            assert!(!meta.is_complete);
            assert!(meta.token_count <= 6);
        }
    }

    #[test]
    fn test_monotonic_truncation_with_slack() {
        let tokens = counter();
        let max_tokens = 20;
        let chunker = SemanticChunker::new(ChunkerConfig::new(max_tokens, 0.2).unwrap(), &tokens);
        let text = (0..30)
            .map(|i| format!("Sentence number {} has a few words in it.", i))
            .collect::<Vec<_>>()
            .join(" ");
        let chunks = chunker.chunk(&text);
        assert!(chunks.len() > 1);
        let ceiling = (max_tokens as f32 * 1.1) as usize;
        for (_, meta) in &chunks {
            assert!(
                meta.token_count <= ceiling,
                "chunk of {} tokens exceeds ceiling {}",
                meta.token_count,
                ceiling
            );
        }
    }

    #[test]
    fn test_overlap_seeds_next_chunk() {
        let tokens = counter();
        let chunker = SemanticChunker::new(ChunkerConfig::new(8, 0.5).unwrap(), &tokens);
        let text = "Alpha beta gamma delta. Epsilon zeta eta theta. Iota kappa lambda mu.";
        let chunks = chunker.chunk(text);
        assert!(chunks.len() > 1);
        // The second chunk starts with trailing content of the first.
        let first = &chunks[0].0;
        let second = &chunks[1].0;
        let shared = first.split_whitespace().rev().take(2).collect::<Vec<_>>();
        assert!(shared.iter().any(|word| second.contains(word)));
    }

    #[test]
    fn test_abbreviations_do_not_split() {
        let sentences = split_sentences("Ask Dr. Smith about it. Then leave.");
        assert_eq!(sentences.len(), 2);
        assert!(sentences[0].contains("Dr. Smith"));
    }

    #[test]
    fn test_runaway_sentence_is_window_split() {
        let tokens = counter();
        let chunker = SemanticChunker::new(ChunkerConfig::new(5, 0.0).unwrap(), &tokens);
        let text = (0..40).map(|i| format!("w{}", i)).collect::<Vec<_>>().join(" ");
        let chunks = chunker.chunk(&text);
        assert!(chunks.len() > 1);
        for (_, meta) in &chunks {
            assert!(meta.token_count <= 5);
        }
    }
}
