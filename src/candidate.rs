// SPDX-License-Identifier: MIT OR Apache-2.0

//! Canonical candidate representation and the ingestion boundary.
//!
//! The external store hands back items in several historical shapes: a
//! plain object with a `text` field, an object wrapping an `item` object,
//! or positional `[id, embedding, text, ...]` rows. Everything is
//! converted into one canonical [`Candidate`] at the boundary, so the
//! ranking components only ever see one shape.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::warn;

use crate::errors::ExtractionError;

/// A related item in the document hierarchy (an ancestor or descendant
/// of a candidate), carried along for context aggregation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RelatedItem {
    pub id: Option<String>,
    pub text: String,
}

/// A document item (or chunk) under evaluation for relevance to a query.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Candidate {
    /// Store identifier. Candidates without an id keep their vector score
    /// but are excluded from the lexical merge.
    pub id: Option<String>,
    /// Body text; always non-empty after ingestion.
    pub text: String,
    /// Ordered ancestor items, nearest first.
    #[serde(default)]
    pub ancestors: Vec<RelatedItem>,
    /// Ordered descendant items.
    #[serde(default)]
    pub descendants: Vec<RelatedItem>,
    /// Precomputed embedding, when the store already carries one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub embedding: Option<Vec<f32>>,
}

impl Candidate {
    /// Creates a bare candidate from id and text.
    pub fn new(id: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            id: Some(id.into()),
            text: text.into(),
            ancestors: Vec::new(),
            descendants: Vec::new(),
            embedding: None,
        }
    }

    /// The text used for embedding: ancestor texts, the item's own text
    /// and descendant texts joined with single spaces. Hierarchical
    /// context sharpens the embedding for short items.
    pub fn embedding_text(&self) -> String {
        let mut parts: Vec<&str> = Vec::with_capacity(1 + self.ancestors.len() + self.descendants.len());
        for ancestor in &self.ancestors {
            if !ancestor.text.trim().is_empty() {
                parts.push(ancestor.text.as_str());
            }
        }
        parts.push(self.text.as_str());
        for descendant in &self.descendants {
            if !descendant.text.trim().is_empty() {
                parts.push(descendant.text.as_str());
            }
        }
        parts.join(" ")
    }

    /// Converts one external representation into a canonical candidate.
    ///
    /// Text extraction precedence:
    /// 1. a non-empty string `text` field on the value itself;
    /// 2. a nested `item` object with a non-empty `text` field;
    /// 3. the third positional element of an `item` array
    ///    (`[id, embedding, text, ...]` rows).
    pub fn from_value(value: &Value) -> Result<Self, ExtractionError> {
        let object = value.as_object().ok_or(ExtractionError::NotAnObject)?;

        let text = extract_text(value).ok_or(ExtractionError::MissingText)?;
        if text.trim().is_empty() {
            return Err(ExtractionError::EmptyText);
        }

        let id = object
            .get("id")
            .and_then(value_as_id)
            .or_else(|| {
                object
                    .get("item")
                    .and_then(Value::as_array)
                    .and_then(|row| row.first())
                    .and_then(value_as_id)
            })
            .or_else(|| {
                object
                    .get("item")
                    .and_then(Value::as_object)
                    .and_then(|item| item.get("id"))
                    .and_then(value_as_id)
            });

        let embedding = object
            .get("embedding")
            .and_then(parse_vector)
            .or_else(|| {
                object
                    .get("item")
                    .and_then(Value::as_array)
                    .and_then(|row| row.get(1))
                    .and_then(parse_vector)
            });

        Ok(Self {
            id,
            text: text.to_string(),
            ancestors: related_items(object.get("parents")),
            descendants: related_items(object.get("children")),
            embedding,
        })
    }

    /// Converts a batch of external values, dropping the ones no text can
    /// be extracted from. Partial failure is logged, never fatal.
    pub fn from_values(values: &[Value]) -> Vec<Self> {
        let mut out = Vec::with_capacity(values.len());
        for (idx, value) in values.iter().enumerate() {
            match Self::from_value(value) {
                Ok(candidate) => out.push(candidate),
                Err(err) => {
                    warn!(index = idx, error = %err, "Dropping candidate: no usable text");
                }
            }
        }
        out
    }
}

fn extract_text(value: &Value) -> Option<&str> {
    if let Some(text) = value.get("text").and_then(Value::as_str) {
        if !text.is_empty() {
            return Some(text);
        }
    }
    if let Some(inner) = value.get("item") {
        if let Some(text) = inner.get("text").and_then(Value::as_str) {
            if !text.is_empty() {
                return Some(text);
            }
        }
        if let Some(row) = inner.as_array() {
            if let Some(text) = row.get(2).and_then(Value::as_str) {
                if !text.is_empty() {
                    return Some(text);
                }
            }
        }
    }
    None
}

fn value_as_id(value: &Value) -> Option<String> {
    match value {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn parse_vector(value: &Value) -> Option<Vec<f32>> {
    let array = value.as_array()?;
    if array.is_empty() {
        return None;
    }
    let mut out = Vec::with_capacity(array.len());
    for element in array {
        out.push(element.as_f64()? as f32);
    }
    Some(out)
}

fn related_items(value: Option<&Value>) -> Vec<RelatedItem> {
    let Some(array) = value.and_then(Value::as_array) else {
        return Vec::new();
    };
    array
        .iter()
        .filter_map(|entry| {
            let text = extract_text(entry).or_else(|| {
                // Positional rows appear directly in parents/children
                // lists: [id, embedding, text, ...].
                entry.as_array().and_then(|row| row.get(2)).and_then(Value::as_str)
            })?;
            if text.trim().is_empty() {
                return None;
            }
            let id = entry
                .get("id")
                .and_then(value_as_id)
                .or_else(|| entry.as_array().and_then(|row| row.first()).and_then(value_as_id));
            Some(RelatedItem {
                id,
                text: text.to_string(),
            })
        })
        .collect()
}
