#![deny(warnings)]
#![deny(dead_code)]
#![deny(unused_variables)]
#![deny(unused_imports)]

pub mod config;
pub mod embed;
pub mod error;
pub mod filter;
pub mod flatten;
pub mod fusion;
pub mod outcome;
pub mod retry;
pub mod schema;
pub mod similarity;
pub mod traits;
pub mod types;

pub use error::{Error, Result};
pub use outcome::ReadOutcome;
pub use traits::{ChunkStore, ChunkWriter, Embedder, IndexLifecycle, QueryEngine};
