use tantivy::query::{AllQuery, BooleanQuery, Occur, Query, TermQuery};
use tantivy::schema::IndexRecordOption;
use tantivy::Term;

use chunkdb_core::filter::{attribute_path, Criteria};
use chunkdb_core::schema::FieldKind;
use chunkdb_core::types::{LogicalType, Scalar};

use crate::tantivy_utils::{ChunkFields, SEPARATOR};

fn attr_query(fields: &ChunkFields, key: &str, value: &Scalar) -> Option<Box<dyn Query>> {
	let name = attribute_path(key).replace('.', SEPARATOR);
	let (field, kind) = fields.filters.get(&name)?;
	let term = match (kind, value) {
		(FieldKind::Numeric, Scalar::Number(n)) => Term::from_field_f64(*field, *n),
		(FieldKind::Numeric, _) => return None,
		(_, scalar) => Term::from_field_text(*field, &scalar.render()),
	};
	Some(Box::new(TermQuery::new(term, IndexRecordOption::Basic)))
}

fn text_query(fields: &ChunkFields, terms: &[String]) -> Box<dyn Query> {
	let should: Vec<(Occur, Box<dyn Query>)> = terms
		.iter()
		.map(|t| {
			let term = Term::from_field_text(fields.text, t);
			let query: Box<dyn Query> = Box::new(TermQuery::new(term, IndexRecordOption::WithFreqs));
			(Occur::Should, query)
		})
		.collect();
	Box::new(BooleanQuery::new(should))
}

/// Native query selecting a superset of what `criteria` matches; callers
/// refine hits with [`Criteria::matches`].
pub fn build_query(fields: &ChunkFields, criteria: &Criteria<'_>) -> Box<dyn Query> {
	let mut conditions: Vec<Option<Box<dyn Query>>> = Vec::new();
	if !criteria.terms.is_empty() {
		conditions.push(Some(text_query(fields, &criteria.terms)));
	}
	conditions.extend(criteria.attrs.iter().map(|(k, v)| attr_query(fields, k, v)));

	let (occur, parts): (Occur, Vec<Box<dyn Query>>) = match criteria.logical {
		LogicalType::And => (Occur::Must, conditions.into_iter().flatten().collect()),
		LogicalType::Or => match conditions.into_iter().collect::<Option<Vec<_>>>() {
			Some(parts) => (Occur::Should, parts),
			None => (Occur::Should, Vec::new()),
		},
	};
	if parts.is_empty() {
		return Box::new(AllQuery);
	}
	Box::new(BooleanQuery::new(parts.into_iter().map(|q| (occur, q)).collect()))
}
