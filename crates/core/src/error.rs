//! Error taxonomy shared by every cache layer.

#![forbid(unsafe_code)]

use serde::{Deserialize, Serialize};

use crate::PermissionResult;

pub type Result<T, E = CacheError> = std::result::Result<T, E>;

/// Coarse classification of a [`CacheError`], looking through wrappers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorKind {
    AccessDenied,
    Resolution,
    NotFound,
    FilteredOut,
    ShuttingDown,
    Transient,
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum CacheError {
    /// One or more of get/list/watch is not granted. Fatal for the type until credentials change.
    #[error("check access: {resource}: requires scope-wide get/list/watch access, have {access}")]
    AccessDenied { resource: String, access: PermissionResult },

    /// Unknown or malformed type descriptor.
    #[error("resolution: {0}")]
    Resolution(String),

    #[error("not_found: {reference}")]
    NotFound { reference: String },

    /// The object exists but the caller's selector excludes it.
    #[error("object found but filtered by selector: {reference} (selector {selector})")]
    FilteredOut { reference: String, selector: String },

    #[error("shutting down")]
    ShuttingDown,

    /// Network or server side failure, or a cache that cannot yet answer definitively.
    #[error("transient: {0}")]
    Transient(String),

    #[error("retrieving watcher for {key}: {source}")]
    Resolve {
        key: String,
        #[source]
        source: Box<CacheError>,
    },

    #[error("get {key} failed after {retries} retries: {source}")]
    RetriesExhausted {
        key: String,
        retries: u32,
        #[source]
        source: Box<CacheError>,
    },
}

impl CacheError {
    pub fn not_found(reference: impl ToString) -> Self {
        CacheError::NotFound { reference: reference.to_string() }
    }

    pub fn transient(msg: impl ToString) -> Self { CacheError::Transient(msg.to_string()) }

    pub fn kind(&self) -> ErrorKind {
        match self {
            CacheError::AccessDenied { .. } => ErrorKind::AccessDenied,
            CacheError::Resolution(_) => ErrorKind::Resolution,
            CacheError::NotFound { .. } => ErrorKind::NotFound,
            CacheError::FilteredOut { .. } => ErrorKind::FilteredOut,
            CacheError::ShuttingDown => ErrorKind::ShuttingDown,
            CacheError::Transient(_) => ErrorKind::Transient,
            CacheError::Resolve { source, .. } | CacheError::RetriesExhausted { source, .. } => source.kind(),
        }
    }

    pub fn is_not_found(&self) -> bool { self.kind() == ErrorKind::NotFound }

    /// Wrap a factory failure with the descriptor it was resolving.
    pub fn resolving(key: impl ToString, source: CacheError) -> Self {
        CacheError::Resolve { key: key.to_string(), source: Box::new(source) }
    }
}
