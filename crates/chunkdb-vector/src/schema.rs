use arrow_schema::{DataType, Field, Schema};
use std::sync::Arc;

use chunkdb_core::schema::{project_schema, FieldKind, ProjectedSchema, ProjectionOptions};
use chunkdb_core::types::IndexSpec;
use chunkdb_core::{Error, Result};

pub const ID_COLUMN: &str = "id";
pub const SOURCE_COLUMN: &str = "_source";
pub const VECTOR_COLUMN: &str = "vector";
pub const DISTANCE_COLUMN: &str = "_distance";
/// Arrow column names may not contain dots.
pub const SEPARATOR: &str = "__";

const FIXED_COLUMNS: &[&str] = &[ID_COLUMN, SOURCE_COLUMN, VECTOR_COLUMN];

pub fn project(spec: &IndexSpec) -> Result<ProjectedSchema> {
	let options = ProjectionOptions {
		node_label: spec.node_label.clone(),
		vector_field: spec.embedding_property.clone(),
		separator: SEPARATOR.to_string(),
	};
	project_schema(&spec.schema, &options)
}

/// Projected scalar fields that get their own filterable column.
pub fn filter_columns(projected: &ProjectedSchema) -> Vec<(String, FieldKind)> {
	projected
		.scalar_fields()
		.filter(|(name, _)| !FIXED_COLUMNS.contains(name))
		.map(|(name, kind)| (name.to_string(), kind))
		.collect()
}

pub fn column_type(kind: FieldKind) -> DataType {
	match kind {
		FieldKind::Numeric => DataType::Float64,
		_ => DataType::Utf8,
	}
}

pub fn build_chunk_schema(dim: usize, columns: &[(String, FieldKind)]) -> Result<Arc<Schema>> {
	let dim = i32::try_from(dim)
		.map_err(|_| Error::InvalidRequest(format!("embedding dimension {dim} is too large")))?;
	let item = Arc::new(Field::new("item", DataType::Float32, true));
	let mut fields = vec![
		Field::new(ID_COLUMN, DataType::Utf8, false),
		Field::new(SOURCE_COLUMN, DataType::Utf8, false),
		Field::new(VECTOR_COLUMN, DataType::FixedSizeList(item, dim), true),
	];
	fields.extend(
		columns.iter().map(|(name, kind)| Field::new(name.as_str(), column_type(*kind), true)),
	);
	Ok(Arc::new(Schema::new(fields)))
}

#[cfg(test)]
mod tests {
	use super::*;
	use serde_json::json;

	#[test]
	fn chunk_columns_use_double_underscore() {
		let schema = json!({"properties": {"data": {
			"type": "object",
			"properties": {"rank": {"type": "number"}}
		}}});
		let spec = IndexSpec::new("docs", 4).with_schema(schema);
		let columns = filter_columns(&project(&spec).expect("project"));
		assert!(columns.contains(&("data__rank".to_string(), FieldKind::Numeric)));
		assert!(columns.contains(&("metadata__author".to_string(), FieldKind::FullText)));
		assert!(!columns.iter().any(|(n, _)| n == "id" || n == "embedding"));
		let schema = build_chunk_schema(4, &columns).expect("schema");
		assert_eq!(schema.field_with_name("data__rank").expect("rank").data_type(), &DataType::Float64);
	}
}
