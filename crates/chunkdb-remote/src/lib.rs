#![deny(warnings)]
#![deny(dead_code)]
#![deny(unused_variables)]
#![deny(unused_imports)]

//! Remote REST search-service backend with batched writes.

pub mod client;
pub mod documents;
pub mod queue;
pub mod store;

pub use client::{FieldDefinition, IndexDefinition, RemoteClient, SearchBody};
pub use queue::{BatchQueue, BatchSettings, QueueKey};
pub use store::RemoteStore;
