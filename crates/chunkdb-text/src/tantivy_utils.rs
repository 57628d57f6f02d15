use std::collections::BTreeMap;
use tantivy::schema::{
	Field, IndexRecordOption, Schema, TextFieldIndexing, TextOptions, INDEXED, STORED, STRING,
};
use tantivy::tokenizer::{LowerCaser, SimpleTokenizer, TextAnalyzer};
use tantivy::{Index, TantivyError};

use chunkdb_core::schema::{FieldKind, ProjectedSchema};
use chunkdb_core::{Error, Result};

pub const TOKENIZER: &str = "chunk_text";
pub const ID_FIELD: &str = "id";
pub const TEXT_FIELD: &str = "text";
/// Stored chunk JSON, embedding included.
pub const SOURCE_FIELD: &str = "_source";
/// Field names may not contain dots in filters, so nested paths use this.
pub const SEPARATOR: &str = "__";

const FIXED_FIELDS: &[&str] = &[ID_FIELD, TEXT_FIELD, SOURCE_FIELD];

pub(crate) fn tantivy_error(err: TantivyError) -> Error {
	Error::backend("tantivy", err.to_string())
}

#[derive(Debug, Clone)]
pub struct ChunkFields {
	pub id: Field,
	pub text: Field,
	pub source: Field,
	/// Raw (untokenized) or numeric fields addressable by equality filters.
	pub filters: BTreeMap<String, (Field, FieldKind)>,
}

fn filter_fields(projected: &ProjectedSchema) -> impl Iterator<Item = (&str, FieldKind)> {
	projected.scalar_fields().filter(|(name, _)| !FIXED_FIELDS.contains(name))
}

pub fn build_schema(projected: &ProjectedSchema) -> Schema {
	let mut schema_builder = Schema::builder();
	schema_builder.add_text_field(ID_FIELD, STRING | STORED);
	let text_field_indexing = TextFieldIndexing::default()
		.set_tokenizer(TOKENIZER)
		.set_index_option(IndexRecordOption::WithFreqsAndPositions);
	schema_builder
		.add_text_field(TEXT_FIELD, TextOptions::default().set_indexing_options(text_field_indexing));
	schema_builder.add_text_field(SOURCE_FIELD, TextOptions::default().set_stored());
	for (name, kind) in filter_fields(projected) {
		match kind {
			FieldKind::Numeric => {
				schema_builder.add_f64_field(name, INDEXED);
			}
			_ => {
				schema_builder.add_text_field(name, STRING);
			}
		}
	}
	schema_builder.build()
}

pub fn resolve_fields(schema: &Schema, projected: &ProjectedSchema) -> Result<ChunkFields> {
	let field = |name: &str| schema.get_field(name).map_err(tantivy_error);
	let mut filters = BTreeMap::new();
	for (name, kind) in filter_fields(projected) {
		filters.insert(name.to_string(), (field(name)?, kind));
	}
	Ok(ChunkFields {
		id: field(ID_FIELD)?,
		text: field(TEXT_FIELD)?,
		source: field(SOURCE_FIELD)?,
		filters,
	})
}

/// Lowercased alphanumeric runs, the same terms `Criteria` matches on.
pub fn register_tokenizer(index: &Index) {
	let tokenizer = TextAnalyzer::builder(SimpleTokenizer::default()).filter(LowerCaser).build();
	index.tokenizers().register(TOKENIZER, tokenizer);
}
