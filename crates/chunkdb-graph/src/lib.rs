#![deny(warnings)]
#![deny(dead_code)]
#![deny(unused_variables)]
#![deny(unused_imports)]

//! Neo4j backend: chunks as labelled nodes under a native vector index plus a
//! fulltext index, and a projector for extracted entity graphs.

pub mod cypher;
pub mod executor;
pub mod http;
pub mod projector;
pub mod store;

pub use executor::{CypherExecutor, Row, Statement};
pub use http::Neo4jHttp;
pub use projector::{GraphDocument, GraphNode, GraphProjector, GraphRelationship};
pub use store::{GraphStore, Registration};
