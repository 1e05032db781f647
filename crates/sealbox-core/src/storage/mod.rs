//! Storage stage contract: opaque text blobs addressed by location.

mod blob_store;

pub use blob_store::{BlobStore, InMemoryBlobStore, StorageError};
