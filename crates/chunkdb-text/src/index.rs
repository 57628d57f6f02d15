//! One open Tantivy index: spec, reader and the single writer.
//!
//! Layout under the store root: `<name>/spec.json` plus the Tantivy files in
//! `<name>/index/`. All methods block; the store calls them from
//! `spawn_blocking`.

use serde_json::Value as Json;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tantivy::collector::TopDocs;
use tantivy::schema::Value as _;
use tantivy::{
	DocAddress, Index, IndexReader, IndexWriter, ReloadPolicy, Searcher, TantivyDocument, Term,
};
use tracing::debug;

use chunkdb_core::filter::Criteria;
use chunkdb_core::flatten::chunk_to_flat;
use chunkdb_core::schema::{project_schema, FieldKind, ProjectedSchema, ProjectionOptions};
use chunkdb_core::types::{Chunk, ChunkId, IndexSpec, Scalar};
use chunkdb_core::{Error, Result};

use crate::search::build_query;
use crate::tantivy_utils::{
	build_schema, register_tokenizer, resolve_fields, tantivy_error, ChunkFields, SEPARATOR,
};

const SPEC_FILE: &str = "spec.json";
const INDEX_DIR: &str = "index";

pub fn spec_path(dir: &Path) -> PathBuf { dir.join(SPEC_FILE) }

fn io_error(err: std::io::Error) -> Error { Error::backend("tantivy", err.to_string()) }

fn project(spec: &IndexSpec) -> Result<ProjectedSchema> {
	let options = ProjectionOptions {
		node_label: spec.node_label.clone(),
		vector_field: spec.embedding_property.clone(),
		separator: SEPARATOR.to_string(),
	};
	project_schema(&spec.schema, &options)
}

pub struct OpenIndex {
	pub spec: IndexSpec,
	reader: IndexReader,
	writer: Mutex<IndexWriter>,
	fields: ChunkFields,
}

impl OpenIndex {
	pub fn create(dir: &Path, spec: IndexSpec, heap_bytes: usize) -> Result<Self> {
		let projected = project(&spec)?;
		let index_dir = dir.join(INDEX_DIR);
		fs::create_dir_all(&index_dir).map_err(io_error)?;
		let index = Index::create_in_dir(&index_dir, build_schema(&projected)).map_err(tantivy_error)?;
		fs::write(spec_path(dir), serde_json::to_vec_pretty(&spec)?).map_err(io_error)?;
		Self::from_index(index, spec, &projected, heap_bytes)
	}

	pub fn open(dir: &Path, heap_bytes: usize) -> Result<Self> {
		let raw = fs::read(spec_path(dir)).map_err(io_error)?;
		let spec: IndexSpec = serde_json::from_slice(&raw)?;
		let projected = project(&spec)?;
		let index = Index::open_in_dir(dir.join(INDEX_DIR)).map_err(tantivy_error)?;
		Self::from_index(index, spec, &projected, heap_bytes)
	}

	fn from_index(
		index: Index,
		spec: IndexSpec,
		projected: &ProjectedSchema,
		heap_bytes: usize,
	) -> Result<Self> {
		register_tokenizer(&index);
		let fields = resolve_fields(&index.schema(), projected)?;
		let reader: IndexReader = index
			.reader_builder()
			.reload_policy(ReloadPolicy::Manual)
			.try_into()
			.map_err(tantivy_error)?;
		let writer = index.writer(heap_bytes).map_err(tantivy_error)?;
		Ok(Self { spec, reader, writer: Mutex::new(writer), fields })
	}

	fn with_writer<T>(&self, f: impl FnOnce(&mut IndexWriter) -> tantivy::Result<T>) -> Result<T> {
		let mut writer = self.writer.lock().map_err(|_| {
			Error::Operation(format!("writer lock poisoned for '{}'", self.spec.name))
		})?;
		let out = f(&mut writer).map_err(tantivy_error)?;
		self.reader.reload().map_err(tantivy_error)?;
		Ok(out)
	}

	fn to_document(&self, chunk: &Chunk) -> Result<TantivyDocument> {
		let mut doc = TantivyDocument::default();
		doc.add_text(self.fields.id, &chunk.id);
		doc.add_text(self.fields.text, &chunk.text);
		doc.add_text(self.fields.source, serde_json::to_string(chunk)?);
		let flat = chunk_to_flat(chunk, SEPARATOR)?;
		for (name, (field, kind)) in &self.fields.filters {
			let values: Vec<&Json> = match flat.get(name) {
				None => continue,
				Some(Json::Array(items)) => items.iter().collect(),
				Some(value) => vec![value],
			};
			for value in values {
				match kind {
					FieldKind::Numeric => {
						if let Some(n) = value.as_f64() {
							doc.add_f64(*field, n);
						}
					}
					_ => {
						if let Some(scalar) = Scalar::from_json(value) {
							doc.add_text(*field, scalar.render());
						}
					}
				}
			}
		}
		Ok(doc)
	}

	/// Replace-by-id for every chunk, one commit for the whole slice.
	pub fn upsert(&self, chunks: &[Chunk]) -> Result<()> {
		let docs = chunks.iter().map(|c| self.to_document(c)).collect::<Result<Vec<_>>>()?;
		self.with_writer(|writer| {
			for (chunk, doc) in chunks.iter().zip(docs) {
				writer.delete_term(Term::from_field_text(self.fields.id, &chunk.id));
				writer.add_document(doc)?;
			}
			writer.commit()?;
			Ok(())
		})?;
		debug!(index = %self.spec.name, count = chunks.len(), "tantivy commit");
		Ok(())
	}

	pub fn delete_ids(&self, ids: &[ChunkId]) -> Result<()> {
		self.with_writer(|writer| {
			for id in ids {
				writer.delete_term(Term::from_field_text(self.fields.id, id));
			}
			writer.commit()?;
			Ok(())
		})
	}

	pub fn count(&self) -> u64 { self.reader.searcher().num_docs() }

	fn chunk_at(&self, searcher: &Searcher, addr: DocAddress) -> Result<Chunk> {
		let doc: TantivyDocument = searcher.doc(addr).map_err(tantivy_error)?;
		let raw = doc
			.get_first(self.fields.source)
			.and_then(|v| v.as_str())
			.ok_or_else(|| {
				let message = format!("document in '{}' has no stored source", self.spec.name);
				Error::backend("tantivy", message)
			})?;
		Ok(serde_json::from_str(raw)?)
	}

	/// Every chunk matching `criteria` with its native relevance score.
	pub fn matching(&self, criteria: &Criteria<'_>) -> Result<Vec<(f32, Chunk)>> {
		let searcher = self.reader.searcher();
		let limit = usize::try_from(searcher.num_docs()).unwrap_or(usize::MAX).max(1);
		let query = build_query(&self.fields, criteria);
		let top_docs = searcher.search(&*query, &TopDocs::with_limit(limit)).map_err(tantivy_error)?;
		let mut out = Vec::with_capacity(top_docs.len());
		for (score, addr) in top_docs {
			let chunk = self.chunk_at(&searcher, addr)?;
			if criteria.matches(&chunk) {
				out.push((score, chunk));
			}
		}
		Ok(out)
	}

	/// Chunks by id, in request order; unknown ids are skipped.
	pub fn get(&self, ids: &[ChunkId]) -> Result<Vec<Chunk>> {
		let searcher = self.reader.searcher();
		let mut out = Vec::with_capacity(ids.len());
		for id in ids {
			let query = tantivy::query::TermQuery::new(
				Term::from_field_text(self.fields.id, id),
				tantivy::schema::IndexRecordOption::Basic,
			);
			let top = searcher.search(&query, &TopDocs::with_limit(1)).map_err(tantivy_error)?;
			if let Some((_, addr)) = top.into_iter().next() {
				out.push(self.chunk_at(&searcher, addr)?);
			}
		}
		Ok(out)
	}
}
