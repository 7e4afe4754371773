//! The `persistence` module is the storage adapter boundary of the broker.
//!
//! Resource handlers only ever see the [`StorageAdapter`] trait: a narrow
//! get/put/query/delete interface over [`Representation`] documents keyed by
//! resource path. Retry policy, if any, belongs to the adapter.
//!
//! The bundled implementation uses `sled` as an embedded document store, one
//! tree per configured database name.

pub mod sled_store;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::transport::ContentFormat;

pub use sled_store::SledStore;

#[derive(Error, Debug)]
pub enum StorageError {
    #[error("no representation stored at this path")]
    NotFound,
    #[error("storage backend error: {0}")]
    Backend(#[from] sled::Error),
    #[error("stored document is corrupt: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("storage unavailable: {0}")]
    Unavailable(String),
}

/// The payload exchanged with a resource, passed through unchanged between
/// the router and the storage adapter.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Representation {
    pub content_format: Option<ContentFormat>,
    pub payload: Vec<u8>,
}

impl Representation {
    pub fn new(content_format: Option<ContentFormat>, payload: impl Into<Vec<u8>>) -> Self {
        Self {
            content_format,
            payload: payload.into(),
        }
    }
}

/// Persists and retrieves resource representations.
///
/// Implementations may block; the broker never calls them while holding the
/// transaction table lock.
pub trait StorageAdapter: Send + Sync {
    fn get(&self, path: &str) -> Result<Representation, StorageError>;

    fn put(&self, path: &str, representation: Representation) -> Result<(), StorageError>;

    /// Returns [`StorageError::NotFound`] when nothing was stored at `path`.
    fn delete(&self, path: &str) -> Result<(), StorageError>;

    /// All stored representations whose path starts with `prefix`, in path order.
    fn query(&self, prefix: &str) -> Result<Vec<(String, Representation)>, StorageError>;
}

#[cfg(test)]
mod tests;
