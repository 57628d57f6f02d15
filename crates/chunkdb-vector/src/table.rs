//! LanceDB connection and housekeeping helpers.
//!
//! Provides the database open function, `ensure_table`, and the key/value
//! metadata table that records each index's spec (dimension, metric, label,
//! schema descriptor) next to its chunk table.

use arrow_array::{RecordBatch, RecordBatchIterator, StringArray, TimestampMillisecondArray};
use arrow_schema::{ArrowError, DataType, Field, Schema, TimeUnit};
use chrono::Utc;
use futures::TryStreamExt;
use lancedb::query::{ExecutableQuery, QueryBase};
use lancedb::{connect, Connection};
use std::sync::Arc;

use chunkdb_core::{Error, Result};

pub(crate) const BACKEND: &str = "lancedb";

/// Key/value table holding one serialized `IndexSpec` per index.
pub const META_TABLE: &str = "_chunkdb_indexes";

pub fn lance_error(err: lancedb::Error) -> Error {
	match err {
		lancedb::Error::TableNotFound { name, .. } => Error::NotFound(format!("table '{name}'")),
		lancedb::Error::TableAlreadyExists { name, .. } => Error::AlreadyExists(name),
		other => Error::backend(BACKEND, other.to_string()),
	}
}

pub fn arrow_error(err: ArrowError) -> Error { Error::backend(BACKEND, err.to_string()) }

pub async fn open_db(uri: &str) -> Result<Connection> {
	connect(uri).execute().await.map_err(lance_error)
}

pub async fn table_exists(conn: &Connection, name: &str) -> Result<bool> {
	let names = conn.table_names().execute().await.map_err(lance_error)?;
	Ok(names.iter().any(|n| n == name))
}

pub async fn ensure_table(conn: &Connection, name: &str, schema: Arc<Schema>) -> Result<()> {
	if table_exists(conn, name).await? {
		return Ok(());
	}
	// create empty table with 0 rows
	let iter = RecordBatchIterator::new(vec![].into_iter(), schema.clone());
	conn.create_table(name, Box::new(iter)).execute().await.map_err(lance_error)?;
	Ok(())
}

fn build_meta_schema() -> Arc<Schema> {
	Arc::new(Schema::new(vec![
		Field::new("key", DataType::Utf8, false),
		Field::new("value", DataType::Utf8, false),
		Field::new("updated_at", DataType::Timestamp(TimeUnit::Millisecond, None), false),
	]))
}

pub(crate) fn quote(value: &str) -> String { format!("'{}'", value.replace('\'', "''")) }

pub async fn set_meta(conn: &Connection, key: &str, value: &str) -> Result<()> {
	ensure_table(conn, META_TABLE, build_meta_schema()).await?;
	let t = conn.open_table(META_TABLE).execute().await.map_err(lance_error)?;
	let rb = RecordBatch::try_new(
		build_meta_schema(),
		vec![
			Arc::new(StringArray::from(vec![key.to_string()])),
			Arc::new(StringArray::from(vec![value.to_string()])),
			Arc::new(TimestampMillisecondArray::from(vec![Utc::now().timestamp_millis()])),
		],
	)
	.map_err(arrow_error)?;
	let reader = Box::new(RecordBatchIterator::new(vec![Ok(rb)].into_iter(), build_meta_schema()));
	// Upsert behavior via merge_insert: key is unique
	let mut mi = t.merge_insert(&["key"]);
	mi.when_matched_update_all(None).when_not_matched_insert_all();
	mi.execute(reader).await.map_err(lance_error)?;
	Ok(())
}

async fn read_meta(conn: &Connection, filter: Option<String>) -> Result<Vec<(String, String)>> {
	if !table_exists(conn, META_TABLE).await? {
		return Ok(Vec::new());
	}
	let t = conn.open_table(META_TABLE).execute().await.map_err(lance_error)?;
	let mut query = t.query();
	if let Some(filter) = filter {
		query = query.only_if(filter);
	}
	let batches: Vec<RecordBatch> = query
		.execute()
		.await
		.map_err(lance_error)?
		.try_collect()
		.await
		.map_err(lance_error)?;
	let mut out = Vec::new();
	for batch in batches {
		let keys = string_column(&batch, "key")?;
		let values = string_column(&batch, "value")?;
		for i in 0..batch.num_rows() {
			out.push((keys.value(i).to_string(), values.value(i).to_string()));
		}
	}
	Ok(out)
}

pub async fn get_meta(conn: &Connection, key: &str) -> Result<Option<String>> {
	let rows = read_meta(conn, Some(format!("key = {}", quote(key)))).await?;
	Ok(rows.into_iter().next().map(|(_, v)| v))
}

pub async fn list_meta(conn: &Connection) -> Result<Vec<(String, String)>> {
	read_meta(conn, None).await
}

pub async fn delete_meta(conn: &Connection, key: &str) -> Result<()> {
	if !table_exists(conn, META_TABLE).await? {
		return Ok(());
	}
	let t = conn.open_table(META_TABLE).execute().await.map_err(lance_error)?;
	t.delete(&format!("key = {}", quote(key))).await.map_err(lance_error)?;
	Ok(())
}

pub(crate) fn string_column<'a>(batch: &'a RecordBatch, name: &str) -> Result<&'a StringArray> {
	batch
		.column_by_name(name)
		.and_then(|c| c.as_any().downcast_ref::<StringArray>())
		.ok_or_else(|| Error::backend(BACKEND, format!("column '{name}' missing or not utf8")))
}
