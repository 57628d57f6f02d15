//! Result type for lenient read paths.
//!
//! Reads never raise: querying before an index exists is a normal state.
//! [`ReadOutcome`] still lets callers tell "not found" apart from "backend
//! unavailable" instead of collapsing both into an empty list.

use tracing::{debug, warn};

use crate::error::{Error, Result};

#[derive(Debug)]
pub enum ReadOutcome<T> {
    Found(T),
    NotFound,
    Unavailable(Error),
}

impl<T> ReadOutcome<T> {
    /// Classify a backend result, logging anything that is not a hit.
    pub fn capture(operation: &str, subject: &str, result: Result<T>) -> Self {
        match result {
            Ok(value) => ReadOutcome::Found(value),
            Err(Error::NotFound(what)) => {
                debug!(operation, subject, %what, "read found nothing");
                ReadOutcome::NotFound
            }
            Err(err) => {
                warn!(operation, subject, error = %err, "read degraded to empty result");
                ReadOutcome::Unavailable(err)
            }
        }
    }

    pub fn is_found(&self) -> bool { matches!(self, ReadOutcome::Found(_)) }

    pub fn is_not_found(&self) -> bool { matches!(self, ReadOutcome::NotFound) }

    pub fn is_unavailable(&self) -> bool { matches!(self, ReadOutcome::Unavailable(_)) }

    pub fn into_option(self) -> Option<T> {
        match self {
            ReadOutcome::Found(value) => Some(value),
            _ => None,
        }
    }

    /// Back to a strict result, e.g. for write paths that must read first.
    pub fn into_result(self, subject: &str) -> Result<T> {
        match self {
            ReadOutcome::Found(value) => Ok(value),
            ReadOutcome::NotFound => Err(Error::NotFound(subject.to_string())),
            ReadOutcome::Unavailable(err) => Err(err),
        }
    }

    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> ReadOutcome<U> {
        match self {
            ReadOutcome::Found(value) => ReadOutcome::Found(f(value)),
            ReadOutcome::NotFound => ReadOutcome::NotFound,
            ReadOutcome::Unavailable(err) => ReadOutcome::Unavailable(err),
        }
    }
}

impl<T: Default> ReadOutcome<T> {
    /// The empty-on-failure view.
    pub fn unwrap_or_default(self) -> T { self.into_option().unwrap_or_default() }
}
