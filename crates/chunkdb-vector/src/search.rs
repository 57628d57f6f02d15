//! Query-side helpers: SQL pushdown and batch decoding.
//!
//! Predicates pushed to LanceDB are deliberately loose (substring `LIKE`,
//! equality on projected columns only). Every candidate is refined with
//! [`Criteria::matches`] afterwards, so pushdown only ever narrows the scan.

use arrow_array::{Array, FixedSizeListArray, Float32Array, RecordBatch};
use std::collections::HashMap;

use chunkdb_core::filter::{attribute_path, Criteria};
use chunkdb_core::schema::FieldKind;
use chunkdb_core::types::{Chunk, LogicalType, Scalar};
use chunkdb_core::{Error, Result};

use crate::schema::{DISTANCE_COLUMN, SEPARATOR, SOURCE_COLUMN, VECTOR_COLUMN};
use crate::table::{quote, string_column, BACKEND};

/// List-valued fields are stored as rendered JSON and cannot be matched by equality.
const LIST_COLUMNS: &[&str] = &["metadata__parentIds"];

fn column(name: &str) -> String { format!("`{name}`") }

fn attr_condition(columns: &HashMap<&str, FieldKind>, key: &str, value: &Scalar) -> Option<String> {
	let name = attribute_path(key).replace('.', SEPARATOR);
	if LIST_COLUMNS.contains(&name.as_str()) {
		return None;
	}
	match (columns.get(name.as_str())?, value) {
		(FieldKind::Numeric, Scalar::Number(n)) => Some(format!("{} = {n}", column(&name))),
		(FieldKind::Numeric, _) => None,
		(_, scalar) => Some(format!("{} = {}", column(&name), quote(&scalar.render()))),
	}
}

fn text_condition(columns: &HashMap<&str, FieldKind>, terms: &[String]) -> Option<String> {
	if !columns.contains_key("text") {
		return None;
	}
	let likes: Vec<String> = terms
		.iter()
		.map(|t| format!("lower(`text`) LIKE {}", quote(&format!("%{t}%"))))
		.collect();
	Some(format!("({})", likes.join(" OR ")))
}

/// A predicate selecting a superset of the rows `criteria` matches, or
/// `None` when the whole table has to be scanned.
pub fn pushdown_predicate(
	criteria: &Criteria<'_>,
	filter_columns: &[(String, FieldKind)],
) -> Option<String> {
	if criteria.is_empty() {
		return None;
	}
	let columns: HashMap<&str, FieldKind> =
		filter_columns.iter().map(|(n, k)| (n.as_str(), *k)).collect();
	let mut conditions: Vec<Option<String>> = Vec::new();
	if !criteria.terms.is_empty() {
		conditions.push(text_condition(&columns, &criteria.terms));
	}
	conditions.extend(criteria.attrs.iter().map(|(k, v)| attr_condition(&columns, k, v)));

	let parts: Vec<String> = match criteria.logical {
		// Dropping a conjunct only widens the result.
		LogicalType::And => conditions.into_iter().flatten().collect(),
		// A single unknown disjunct could match anything.
		LogicalType::Or => conditions.into_iter().collect::<Option<Vec<_>>>()?,
	};
	if parts.is_empty() {
		return None;
	}
	let joiner = match criteria.logical {
		LogicalType::And => " AND ",
		LogicalType::Or => " OR ",
	};
	Some(parts.join(joiner))
}

pub fn id_predicate(ids: &[String]) -> String {
	let quoted: Vec<String> = ids.iter().map(|id| quote(id)).collect();
	format!("id IN ({})", quoted.join(", "))
}

/// A decoded row, with the `_distance` column when the query produced one.
pub struct Hit {
	pub chunk: Chunk,
	pub distance: Option<f32>,
}

fn vector_at(vectors: &FixedSizeListArray, i: usize) -> Option<Vec<f32>> {
	if vectors.is_null(i) {
		return None;
	}
	let values = vectors.value(i);
	values.as_any().downcast_ref::<Float32Array>().map(|v| v.values().to_vec())
}

pub fn decode_batches(batches: &[RecordBatch]) -> Result<Vec<Hit>> {
	let mut hits = Vec::new();
	for batch in batches {
		let sources = string_column(batch, SOURCE_COLUMN)?;
		let vectors = batch
			.column_by_name(VECTOR_COLUMN)
			.and_then(|c| c.as_any().downcast_ref::<FixedSizeListArray>());
		let distances = batch
			.column_by_name(DISTANCE_COLUMN)
			.and_then(|c| c.as_any().downcast_ref::<Float32Array>());
		for i in 0..batch.num_rows() {
			let mut chunk: Chunk = serde_json::from_str(sources.value(i))
				.map_err(|e| Error::backend(BACKEND, format!("corrupt stored chunk: {e}")))?;
			chunk.embedding = vectors.and_then(|v| vector_at(v, i));
			hits.push(Hit { chunk, distance: distances.map(|d| d.value(i)) });
		}
	}
	Ok(hits)
}

#[cfg(test)]
mod tests {
	use super::*;
	use chunkdb_core::types::Attributes;

	fn columns() -> Vec<(String, FieldKind)> {
		vec![
			("text".to_string(), FieldKind::FullText),
			("data__category".to_string(), FieldKind::FullText),
			("data__rank".to_string(), FieldKind::Numeric),
			("metadata__author".to_string(), FieldKind::FullText),
		]
	}

	#[test]
	fn and_keeps_only_known_columns() {
		let mut attrs = Attributes::new();
		attrs.insert("category".into(), Scalar::from("faq"));
		attrs.insert("unknown".into(), Scalar::from("x"));
		let criteria = Criteria::new(Some("Pump"), &attrs, LogicalType::And);
		let predicate = pushdown_predicate(&criteria, &columns()).expect("predicate");
		assert_eq!(predicate, "(lower(`text`) LIKE '%pump%') AND `data__category` = 'faq'");
	}

	#[test]
	fn or_with_unknown_column_scans() {
		let mut attrs = Attributes::new();
		attrs.insert("rank".into(), Scalar::from(2i64));
		attrs.insert("unknown".into(), Scalar::from("x"));
		assert!(pushdown_predicate(&Criteria::new(None, &attrs, LogicalType::Or), &columns()).is_none());
		attrs.remove("unknown");
		attrs.insert("author".into(), Scalar::from("O'Neil"));
		let predicate = pushdown_predicate(&Criteria::new(None, &attrs, LogicalType::Or), &columns())
			.expect("predicate");
		assert_eq!(predicate, "`metadata__author` = 'O''Neil' OR `data__rank` = 2");
	}

	#[test]
	fn ids_are_quoted() {
		assert_eq!(id_predicate(&["a".into(), "b'c".into()]), "id IN ('a', 'b''c')");
	}
}
