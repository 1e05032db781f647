use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
};

use thiserror::Error;
use tracing::trace;

/// Errors produced by blob storage implementations.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum StorageError {
    /// Nothing has been written to the location yet.
    #[error("no stored value at location: {location}")]
    NotFound { location: String },
    /// Permission, disk or other I/O failure.
    #[error("storage failure at {location}: {reason}")]
    Io { location: String, reason: String },
}

impl StorageError {
    pub fn io(location: impl Into<String>, reason: impl ToString) -> Self {
        Self::Io {
            location: location.into(),
            reason: reason.to_string(),
        }
    }

    /// "No settings yet" is the one storage failure callers commonly recover from.
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }
}

/// Holds exactly one text blob per location.
///
/// Writes fully replace prior contents. Implementations give no guarantees for
/// concurrent writers to the same location; callers serialize those themselves.
pub trait BlobStore: Send + Sync {
    /// Persist `text` at `location`, overwriting any existing blob.
    fn write(&self, location: &str, text: &str) -> Result<(), StorageError>;

    /// Return the full blob previously written to `location`.
    fn read(&self, location: &str) -> Result<String, StorageError>;

    /// Remove the blob at `location` (idempotent).
    fn remove(&self, location: &str) -> Result<(), StorageError>;
}

impl<B: BlobStore + ?Sized> BlobStore for Arc<B> {
    fn write(&self, location: &str, text: &str) -> Result<(), StorageError> {
        (**self).write(location, text)
    }

    fn read(&self, location: &str) -> Result<String, StorageError> {
        (**self).read(location)
    }

    fn remove(&self, location: &str) -> Result<(), StorageError> {
        (**self).remove(location)
    }
}

/// Process-local blob store for tests and smoke runs. Nothing touches disk.
#[derive(Debug, Default, Clone)]
pub struct InMemoryBlobStore {
    inner: Arc<Mutex<HashMap<String, String>>>,
}

impl InMemoryBlobStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of locations currently holding a blob.
    pub fn len(&self) -> usize {
        self.inner.lock().map(|map| map.len()).unwrap_or_default()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl BlobStore for InMemoryBlobStore {
    fn write(&self, location: &str, text: &str) -> Result<(), StorageError> {
        let mut map = self
            .inner
            .lock()
            .map_err(|err| StorageError::io(location, format!("lock poisoned: {err}")))?;
        trace!(location, bytes = text.len(), "in-memory write");
        map.insert(location.to_string(), text.to_string());
        Ok(())
    }

    fn read(&self, location: &str) -> Result<String, StorageError> {
        let map = self
            .inner
            .lock()
            .map_err(|err| StorageError::io(location, format!("lock poisoned: {err}")))?;

        map.get(location)
            .cloned()
            .ok_or_else(|| StorageError::NotFound {
                location: location.to_string(),
            })
    }

    fn remove(&self, location: &str) -> Result<(), StorageError> {
        let mut map = self
            .inner
            .lock()
            .map_err(|err| StorageError::io(location, format!("lock poisoned: {err}")))?;
        map.remove(location);
        Ok(())
    }
}
