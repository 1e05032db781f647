use std::{
    fs::{self, File},
    io::{ErrorKind, Read, Write},
    path::{Path, PathBuf},
};

use sealbox_core::storage::{BlobStore, StorageError};
use tempfile::NamedTempFile;
use tracing::{debug, instrument};

/// File-backed blob store: one file per location.
///
/// Relative locations resolve under `root`; absolute locations are used as-is.
/// Writes go to a temporary file in the target directory and are renamed into
/// place, so a crash mid-write leaves the previous blob intact.
#[derive(Debug, Clone)]
pub struct FileBlobStore {
    root: PathBuf,
}

impl FileBlobStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn path_for(&self, location: &str) -> PathBuf {
        self.root.join(location)
    }
}

impl BlobStore for FileBlobStore {
    #[instrument(skip_all, fields(location = %location))]
    fn write(&self, location: &str, text: &str) -> Result<(), StorageError> {
        let path = self.path_for(location);
        let parent = match path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
            _ => PathBuf::from("."),
        };
        fs::create_dir_all(&parent).map_err(|e| StorageError::io(location, e))?;

        let mut tmp = NamedTempFile::new_in(&parent).map_err(|e| StorageError::io(location, e))?;
        tmp.write_all(text.as_bytes())
            .map_err(|e| StorageError::io(location, e))?;
        tmp.as_file()
            .sync_all()
            .map_err(|e| StorageError::io(location, e))?;
        tmp.persist(&path)
            .map_err(|e| StorageError::io(location, e.error))?;
        debug!(path = %path.display(), bytes = text.len(), "blob written");
        Ok(())
    }

    #[instrument(skip_all, fields(location = %location))]
    fn read(&self, location: &str) -> Result<String, StorageError> {
        let path = self.path_for(location);
        let mut file = File::open(&path).map_err(|err| {
            if err.kind() == ErrorKind::NotFound {
                StorageError::NotFound {
                    location: location.to_string(),
                }
            } else {
                StorageError::io(location, err)
            }
        })?;

        let mut buf = String::new();
        file.read_to_string(&mut buf)
            .map_err(|e| StorageError::io(location, e))?;
        Ok(buf)
    }

    #[instrument(skip_all, fields(location = %location))]
    fn remove(&self, location: &str) -> Result<(), StorageError> {
        match fs::remove_file(self.path_for(location)) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(()),
            Err(err) => Err(StorageError::io(location, err)),
        }
    }
}
