//! Encrypted object persistence: serialize a record, encrypt it, and write the
//! base64 envelope to storage; the reverse path on load.
//!
//! Stages run in a fixed order. `save` is `codec` -> `cipher` -> blob store,
//! `load` walks the same stages backwards. See [`object_store::ObjectStore`].

pub mod cipher;
pub mod codec;
pub mod file_store;
pub mod key_provider;
pub mod object_store;

pub use cipher::{Cipher, CipherError, EnvelopeFormat};
pub use codec::CodecError;
pub use file_store::FileBlobStore;
pub use key_provider::{EncryptionKey, KeyError, KeyMaterial, KeyProvider};
pub use object_store::{ErrorKind, ObjectStore, StoreError};
