use std::time::Duration;

use thiserror::Error;

use crate::flatten::FlattenError;

#[derive(Debug, Error)]
pub enum Error {
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Index '{0}' already exists")]
    AlreadyExists(String),

    #[error("Index name '{name}' is already claimed by the {provider} backend")]
    NameConflict { name: String, provider: String },

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Embedding dimension mismatch on '{index}': expected {expected}, got {actual}")]
    DimensionMismatch {
        index: String,
        expected: usize,
        actual: usize,
    },

    #[error("Unsupported: {0}")]
    Unsupported(String),

    #[error("{operation} timed out after {after:?}")]
    Timeout { operation: String, after: Duration },

    #[error("{backend} backend error: {message}")]
    Backend {
        backend: &'static str,
        message: String,
        transient: bool,
    },

    #[error("Serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error(transparent)]
    Flatten(#[from] FlattenError),

    #[error("Operation failed: {0}")]
    Operation(String),
}

impl Error {
    pub fn backend(backend: &'static str, message: impl Into<String>) -> Self {
        Self::Backend { backend, message: message.into(), transient: false }
    }

    pub fn transient(backend: &'static str, message: impl Into<String>) -> Self {
        Self::Backend { backend, message: message.into(), transient: true }
    }

    /// Failures worth retrying for idempotent operations.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Timeout { .. } | Self::Backend { transient: true, .. })
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }
}

pub type Result<T> = std::result::Result<T, Error>;
