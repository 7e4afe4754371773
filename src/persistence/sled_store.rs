//! Storage adapter backed by `sled`
//!
//! Every representation is stored as a small JSON document keyed by its
//! resource path inside a tree named after the configured database, so several
//! brokers can share one sled directory without seeing each other's data.

use std::path::Path;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use sled::{Db, Tree};
use tracing::trace;

use crate::persistence::{Representation, StorageAdapter, StorageError};
use crate::transport::ContentFormat;

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct StoredRepresentation {
    pub path: String,
    pub content_format: Option<ContentFormat>,
    pub payload: Vec<u8>,
    pub updated_at: i64,
}

impl From<StoredRepresentation> for Representation {
    fn from(stored: StoredRepresentation) -> Self {
        Representation {
            content_format: stored.content_format,
            payload: stored.payload,
        }
    }
}

#[derive(Clone)]
pub struct SledStore {
    db: Db,
    tree: Tree,
    database: String,
}

impl SledStore {
    /// Open or create a sled database at `path`, using the tree `database`.
    pub fn open(path: impl AsRef<Path>, database: &str) -> Result<Self, StorageError> {
        let db = sled::open(path)?;
        Self::from_db(db, database)
    }

    /// A throwaway store removed from disk when dropped.
    pub fn temporary(database: &str) -> Result<Self, StorageError> {
        let db = sled::Config::new().temporary(true).open()?;
        Self::from_db(db, database)
    }

    /// Share an already opened database; each store only sees its own tree.
    pub fn from_db(db: Db, database: &str) -> Result<Self, StorageError> {
        let tree = db.open_tree(database)?;
        Ok(Self {
            db,
            tree,
            database: database.to_string(),
        })
    }

    pub fn database(&self) -> &str {
        &self.database
    }

    /// Last write time (unix millis) of the document at `path`.
    pub fn updated_at(&self, path: &str) -> Result<i64, StorageError> {
        Ok(self.load(path)?.updated_at)
    }

    pub fn flush(&self) -> Result<(), StorageError> {
        self.db.flush()?;
        Ok(())
    }

    fn load(&self, path: &str) -> Result<StoredRepresentation, StorageError> {
        let raw = self.tree.get(path.as_bytes())?.ok_or(StorageError::NotFound)?;
        Ok(serde_json::from_slice(&raw)?)
    }
}

impl StorageAdapter for SledStore {
    fn get(&self, path: &str) -> Result<Representation, StorageError> {
        self.load(path).map(Representation::from)
    }

    fn put(&self, path: &str, representation: Representation) -> Result<(), StorageError> {
        let doc = StoredRepresentation {
            path: path.to_string(),
            content_format: representation.content_format,
            payload: representation.payload,
            updated_at: Utc::now().timestamp_millis(),
        };
        let serialized = serde_json::to_vec(&doc)?;
        self.tree.insert(path.as_bytes(), serialized)?;
        trace!(database = %self.database, path, "stored representation");
        Ok(())
    }

    fn delete(&self, path: &str) -> Result<(), StorageError> {
        match self.tree.remove(path.as_bytes())? {
            Some(_) => Ok(()),
            None => Err(StorageError::NotFound),
        }
    }

    fn query(&self, prefix: &str) -> Result<Vec<(String, Representation)>, StorageError> {
        self.tree
            .scan_prefix(prefix.as_bytes())
            .map(|entry| -> Result<(String, Representation), StorageError> {
                let (_, raw) = entry?;
                let doc: StoredRepresentation = serde_json::from_slice(&raw)?;
                Ok((doc.path.clone(), doc.into()))
            })
            .collect()
    }
}

impl std::fmt::Debug for SledStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SledStore")
            .field("db", &"sled::Db")
            .field("database", &self.database)
            .finish()
    }
}
