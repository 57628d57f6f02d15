use arrow_array::types::Float32Type;
use arrow_array::{
	ArrayRef, FixedSizeListArray, Float64Array, RecordBatch, RecordBatchIterator, StringArray,
};
use arrow_schema::Schema;
use lancedb::Table;
use serde_json::Value;
use std::sync::Arc;

use chunkdb_core::flatten::chunk_to_flat;
use chunkdb_core::schema::FieldKind;
use chunkdb_core::types::{Chunk, Scalar};
use chunkdb_core::Result;

use crate::schema::SEPARATOR;
use crate::table::{arrow_error, lance_error};

/// One row: the chunk as stored (label already applied) and its vector.
pub struct Row<'a> {
	pub chunk: Chunk,
	pub vector: Option<&'a [f32]>,
}

fn column_text(value: &Value) -> Option<String> {
	match value {
		Value::Null => None,
		other => Some(Scalar::from_json(other).map_or_else(|| other.to_string(), |s| s.render())),
	}
}

pub fn rows_to_record_batch(
	schema: Arc<Schema>,
	columns: &[(String, FieldKind)],
	dim: i32,
	rows: &[Row<'_>],
) -> Result<RecordBatch> {
	let mut ids = Vec::with_capacity(rows.len());
	let mut sources = Vec::with_capacity(rows.len());
	let mut vectors: Vec<Option<Vec<Option<f32>>>> = Vec::with_capacity(rows.len());
	let mut flats = Vec::with_capacity(rows.len());
	for row in rows {
		ids.push(row.chunk.id.clone());
		sources.push(serde_json::to_string(&row.chunk.without_embedding())?);
		vectors.push(row.vector.map(|v| v.iter().map(|&x| Some(x)).collect()));
		flats.push(chunk_to_flat(&row.chunk, SEPARATOR)?);
	}

	let mut arrays: Vec<ArrayRef> = vec![
		Arc::new(StringArray::from(ids)),
		Arc::new(StringArray::from(sources)),
		Arc::new(FixedSizeListArray::from_iter_primitive::<Float32Type, _, _>(
			vectors.into_iter(),
			dim,
		)),
	];
	for (name, kind) in columns {
		let values = flats.iter().map(|flat| flat.get(name));
		let array: ArrayRef = match kind {
			FieldKind::Numeric => {
				let numbers: Vec<Option<f64>> = values.map(|v| v.and_then(Value::as_f64)).collect();
				Arc::new(Float64Array::from(numbers))
			}
			_ => {
				let texts: Vec<Option<String>> = values.map(|v| v.and_then(column_text)).collect();
				Arc::new(StringArray::from(texts))
			}
		};
		arrays.push(array);
	}
	RecordBatch::try_new(schema, arrays).map_err(arrow_error)
}

/// Upsert keyed on `id`.
pub async fn upsert(table: &Table, batch: RecordBatch) -> Result<()> {
	let schema = batch.schema();
	let reader = Box::new(RecordBatchIterator::new(vec![Ok(batch)].into_iter(), schema));
	let mut mi = table.merge_insert(&["id"]);
	mi.when_matched_update_all(None).when_not_matched_insert_all();
	mi.execute(reader).await.map_err(lance_error)?;
	Ok(())
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::schema::{build_chunk_schema, filter_columns, project};
	use arrow_array::Array;
	use chunkdb_core::types::IndexSpec;

	#[test]
	fn filter_columns_are_populated_from_the_chunk() {
		let spec = IndexSpec::new("docs", 2);
		let columns = filter_columns(&project(&spec).expect("project"));
		let schema = build_chunk_schema(2, &columns).expect("schema");
		let mut chunk = Chunk::new("a", "hello").with_document("d1");
		chunk.metadata.page = Some(4);
		let vector = [0.5f32, 0.5];
		let rows = [
			Row { chunk, vector: Some(&vector) },
			Row { chunk: Chunk::new("b", "bare"), vector: None },
		];
		let batch = rows_to_record_batch(schema, &columns, 2, &rows).expect("batch");
		assert_eq!(batch.num_rows(), 2);
		let docs = batch
			.column_by_name("documentId")
			.expect("col")
			.as_any()
			.downcast_ref::<StringArray>()
			.expect("utf8");
		assert_eq!(docs.value(0), "d1");
		assert!(docs.is_null(1));
		let pages = batch
			.column_by_name("metadata__page")
			.expect("col")
			.as_any()
			.downcast_ref::<Float64Array>()
			.expect("f64");
		assert!((pages.value(0) - 4.0).abs() < f64::EPSILON);
		let vectors = batch.column_by_name("vector").expect("col");
		assert!(vectors.is_null(1));
	}
}
