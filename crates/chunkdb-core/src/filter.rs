//! Reference semantics for keyword and attribute criteria.
//!
//! Backends translate criteria into native queries where they can and fall
//! back to [`Criteria::matches`] on reconstructed chunks where they cannot,
//! so both paths agree on what a match is.

use serde_json::Value;

use crate::error::{Error, Result};
use crate::flatten::{flatten, FlatRecord};
use crate::types::{Attributes, Chunk, LogicalType, CHUNK_FIELDS, METADATA_FIELDS};

/// Resolve a filter key to a dotted chunk path.
///
/// Dotted keys are taken as-is. Known metadata keys map to `metadata.<key>`,
/// top-level chunk fields to themselves, anything else to `data.<key>`.
pub fn attribute_path(key: &str) -> String {
    if key.contains('.') || CHUNK_FIELDS.contains(&key) {
        key.to_string()
    } else if METADATA_FIELDS.contains(&key) {
        format!("metadata.{key}")
    } else {
        format!("data.{key}")
    }
}

/// Lowercased alphanumeric terms of a query.
pub fn query_terms(text: &str) -> Vec<String> {
    let mut terms: Vec<String> = text
        .split(|c: char| !c.is_alphanumeric())
        .filter(|t| !t.is_empty())
        .map(str::to_lowercase)
        .collect();
    terms.sort();
    terms.dedup();
    terms
}

/// Fraction of query terms present in `text`, in `[0, 1]`.
#[allow(clippy::cast_precision_loss)]
pub fn lexical_score(text: &str, terms: &[String]) -> f32 {
    if terms.is_empty() {
        return 0.0;
    }
    let tokens = query_terms(text);
    let hits = terms.iter().filter(|t| tokens.contains(t)).count();
    hits as f32 / terms.len() as f32
}

/// Deleting by criteria must never degrade into wiping the whole index.
pub fn require_criteria(query_text: Option<&str>, attrs: &Attributes) -> Result<()> {
    let has_text = query_text.is_some_and(|t| !t.trim().is_empty());
    if has_text || !attrs.is_empty() {
        Ok(())
    } else {
        Err(Error::InvalidRequest(
            "delete by match needs query text or at least one attribute".to_string(),
        ))
    }
}

#[derive(Debug, Clone)]
pub struct Criteria<'a> {
    pub terms: Vec<String>,
    pub attrs: &'a Attributes,
    pub logical: LogicalType,
}

impl<'a> Criteria<'a> {
    pub fn new(query_text: Option<&str>, attrs: &'a Attributes, logical: LogicalType) -> Self {
        Self { terms: query_text.map(query_terms).unwrap_or_default(), attrs, logical }
    }

    pub fn is_empty(&self) -> bool { self.terms.is_empty() && self.attrs.is_empty() }

    /// Text condition plus one equality condition per attribute, combined
    /// with AND or OR. No conditions matches everything.
    pub fn matches(&self, chunk: &Chunk) -> bool {
        if self.is_empty() {
            return true;
        }
        let Ok(value) = serde_json::to_value(chunk) else { return false };
        let Ok(flat) = flatten(&value, ".") else { return false };

        let text_condition =
            (!self.terms.is_empty()).then(|| lexical_score(&chunk.text, &self.terms) > 0.0);
        let mut conditions = text_condition
            .into_iter()
            .chain(self.attrs.iter().map(|(key, expected)| attr_matches(&flat, key, expected)));
        match self.logical {
            LogicalType::And => conditions.all(|c| c),
            LogicalType::Or => conditions.any(|c| c),
        }
    }

    pub fn apply(&self, chunks: Vec<Chunk>) -> Vec<Chunk> {
        chunks.into_iter().filter(|c| self.matches(c)).collect()
    }
}

fn attr_matches(flat: &FlatRecord, key: &str, expected: &crate::types::Scalar) -> bool {
    flat.get(&attribute_path(key)).is_some_and(|value: &Value| expected.matches_json(value))
}
