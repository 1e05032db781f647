use std::marker::PhantomData;

use sealbox_core::storage::{BlobStore, StorageError};
use serde::{de::DeserializeOwned, Serialize};
use thiserror::Error;
use tracing::{debug, instrument};

use crate::{
    cipher::{self, Cipher, CipherError},
    codec::{self, CodecError},
    file_store::FileBlobStore,
};

/// Which stage of the round trip failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Serialization,
    Deserialization,
    Cipher,
    NotFound,
    Storage,
}

/// Failure of a `save` or `load`, keeping the originating stage error.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum StoreError {
    #[error(transparent)]
    Codec(#[from] CodecError),
    #[error(transparent)]
    Cipher(#[from] CipherError),
    #[error(transparent)]
    Storage(#[from] StorageError),
}

impl StoreError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Codec(CodecError::Encode { .. }) => ErrorKind::Serialization,
            Self::Codec(CodecError::Decode { .. }) => ErrorKind::Deserialization,
            Self::Cipher(_) => ErrorKind::Cipher,
            Self::Storage(StorageError::NotFound { .. }) => ErrorKind::NotFound,
            Self::Storage(StorageError::Io { .. }) => ErrorKind::Storage,
        }
    }

    pub fn is_not_found(&self) -> bool {
        self.kind() == ErrorKind::NotFound
    }
}

/// Persists one `T` per location, encrypted at rest.
///
/// `save` serializes, encrypts and writes the base64 envelope; `load` reverses
/// it. Either call completes fully or returns a single error; nothing is cached
/// between calls. Concurrent `save`s to the same location must be serialized by
/// the caller.
pub struct ObjectStore<T, B = FileBlobStore> {
    blobs: B,
    cipher: Cipher,
    _record: PhantomData<fn() -> T>,
}

impl<T, B> ObjectStore<T, B>
where
    T: Serialize + DeserializeOwned,
    B: BlobStore,
{
    pub fn new(blobs: B, cipher: Cipher) -> Self {
        Self {
            blobs,
            cipher,
            _record: PhantomData,
        }
    }

    pub fn cipher(&self) -> &Cipher {
        &self.cipher
    }

    pub fn blobs(&self) -> &B {
        &self.blobs
    }

    #[instrument(skip_all, fields(location = %location, format = %self.cipher.format()))]
    pub fn save(&self, location: &str, value: &T) -> Result<(), StoreError> {
        let text = codec::encode(value)?;
        let envelope = self.cipher.encrypt(&text)?;
        self.blobs.write(location, &cipher::to_text(&envelope))?;
        debug!(envelope_len = envelope.len(), "record saved");
        Ok(())
    }

    #[instrument(skip_all, fields(location = %location))]
    pub fn load(&self, location: &str) -> Result<T, StoreError> {
        let stored = self.blobs.read(location)?;
        let envelope = cipher::from_text(&stored)?;
        let text = self.cipher.decrypt(&envelope)?;
        let value = codec::decode(&text)?;
        debug!(envelope_len = envelope.len(), "record loaded");
        Ok(value)
    }

    /// Rewrite the record at `location` in this store's envelope format.
    /// Used to move legacy files to the sealed format.
    #[instrument(skip_all, fields(location = %location))]
    pub fn reseal(&self, location: &str) -> Result<(), StoreError> {
        let value = self.load(location)?;
        self.save(location, &value)
    }
}

impl<T, B: std::fmt::Debug> std::fmt::Debug for ObjectStore<T, B> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ObjectStore")
            .field("blobs", &self.blobs)
            .field("cipher", &self.cipher)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::{collections::BTreeMap, fs};

    use base64::{engine::general_purpose::STANDARD, Engine as _};
    use chrono::{DateTime, TimeZone, Utc};
    use sealbox_core::{
        settings::{DbConnectionParams, EmailSettings},
        storage::InMemoryBlobStore,
    };
    use serde::Deserialize;

    use super::*;
    use crate::{
        cipher::{EnvelopeFormat, BLOCK_LEN, IV_LEN},
        key_provider::{InMemoryKeyProvider, KeyMaterial, KeyProvider},
    };

    fn db_params() -> DbConnectionParams {
        DbConnectionParams {
            server_name: "MONO".into(),
            database_name: "data".into(),
            user_name: "sa".into(),
            password: "nada123".into(),
        }
    }

    fn file_store<T: Serialize + DeserializeOwned>(
        root: &std::path::Path,
        format: EnvelopeFormat,
    ) -> ObjectStore<T> {
        ObjectStore::new(
            FileBlobStore::new(root),
            Cipher::new(KeyMaterial::legacy(), format),
        )
    }

    #[test]
    fn saved_db_params_load_back_and_file_is_block_aligned_base64() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = file_store::<DbConnectionParams>(dir.path(), EnvelopeFormat::Legacy);

        store.save("cfg.bin", &db_params()).expect("save");
        let loaded = store.load("cfg.bin").expect("load");
        assert_eq!(loaded, db_params());

        let raw = fs::read_to_string(dir.path().join("cfg.bin")).expect("raw read");
        assert!(!raw.contains("nada123"), "plaintext must not be stored");
        let envelope = STANDARD.decode(raw.trim()).expect("file is base64");
        assert!(envelope.len() >= IV_LEN + BLOCK_LEN);
        assert_eq!((envelope.len() - IV_LEN) % BLOCK_LEN, 0);
    }

    #[test]
    fn load_of_missing_location_is_not_found() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = file_store::<DbConnectionParams>(dir.path(), EnvelopeFormat::Legacy);

        let err = store.load("missing.bin").expect_err("nothing saved yet");
        assert_eq!(err.kind(), ErrorKind::NotFound);
        assert!(err.is_not_found());
    }

    #[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
    struct Deployment {
        name: String,
        started_at: DateTime<Utc>,
        replicas: u32,
        canary: bool,
        db: DbConnectionParams,
        mail: Vec<EmailSettings>,
        labels: BTreeMap<String, String>,
    }

    #[test]
    fn nested_records_round_trip_in_both_formats() {
        let value = Deployment {
            name: "prod".into(),
            started_at: Utc.with_ymd_and_hms(2024, 2, 29, 12, 30, 0).unwrap(),
            replicas: 3,
            canary: false,
            db: db_params(),
            mail: vec![EmailSettings::default(), EmailSettings {
                smtp_server_name: "smtp.example.com".into(),
                smtp_port_number: 587,
                ..EmailSettings::default()
            }],
            labels: BTreeMap::from([("team".to_string(), "ops".to_string())]),
        };

        for format in [EnvelopeFormat::Legacy, EnvelopeFormat::Sealed] {
            let store = ObjectStore::<Deployment, _>::new(
                InMemoryBlobStore::new(),
                Cipher::new(KeyMaterial::legacy(), format),
            );
            store.save("deploy", &value).expect("save");
            assert_eq!(store.load("deploy").expect("load"), value, "{format}");
        }
    }

    #[test]
    fn save_overwrites_previous_value() {
        let store = ObjectStore::<DbConnectionParams, _>::new(
            InMemoryBlobStore::new(),
            Cipher::new(KeyMaterial::legacy(), EnvelopeFormat::Legacy),
        );
        store.save("cfg", &db_params()).expect("first save");
        let changed = DbConnectionParams {
            database_name: "DatabaseScript".into(),
            ..db_params()
        };
        store.save("cfg", &changed).expect("second save");

        assert_eq!(store.load("cfg").expect("load"), changed);
        assert_eq!(store.blobs().len(), 1);
    }

    #[test]
    fn unencodable_value_is_a_serialization_error() {
        let store = ObjectStore::<BTreeMap<Vec<u8>, String>, _>::new(
            InMemoryBlobStore::new(),
            Cipher::new(KeyMaterial::legacy(), EnvelopeFormat::Legacy),
        );
        let value = BTreeMap::from([(vec![1u8, 2], "x".to_string())]);

        let err = store.save("bad", &value).expect_err("non-string keys");
        assert_eq!(err.kind(), ErrorKind::Serialization);
        assert_eq!(store.blobs().len(), 0, "nothing written on failure");
    }

    #[test]
    fn loading_as_wrong_record_type_is_a_deserialization_error() {
        let blobs = InMemoryBlobStore::new();
        let cipher = Cipher::new(KeyMaterial::legacy(), EnvelopeFormat::Legacy);
        ObjectStore::<EmailSettings, _>::new(blobs.clone(), cipher.clone())
            .save("mail", &EmailSettings::default())
            .expect("save");

        let err = ObjectStore::<DbConnectionParams, _>::new(blobs, cipher)
            .load("mail")
            .expect_err("email settings are not db params");
        assert_eq!(err.kind(), ErrorKind::Deserialization);
    }

    #[test]
    fn wrong_key_is_a_cipher_error_for_sealed_files() {
        let blobs = InMemoryBlobStore::new();
        ObjectStore::<DbConnectionParams, _>::new(
            blobs.clone(),
            Cipher::new(KeyMaterial::legacy(), EnvelopeFormat::Sealed),
        )
        .save("cfg", &db_params())
        .expect("save");

        let other = InMemoryKeyProvider::default()
            .get_or_create()
            .expect("ephemeral key");
        let err = ObjectStore::<DbConnectionParams, _>::new(
            blobs,
            Cipher::new(other, EnvelopeFormat::Sealed),
        )
        .load("cfg")
        .expect_err("wrong key");
        assert_eq!(err, StoreError::Cipher(CipherError::Decrypt));
    }

    /// Legacy files have no MAC, so a wrong key can slip past the padding
    /// check; it then fails later as a deserialization error. Either way the
    /// load fails.
    #[test]
    fn wrong_key_never_loads_a_legacy_file() {
        let blobs = InMemoryBlobStore::new();
        ObjectStore::<DbConnectionParams, _>::new(
            blobs.clone(),
            Cipher::new(KeyMaterial::legacy(), EnvelopeFormat::Legacy),
        )
        .save("cfg", &db_params())
        .expect("save");

        for _ in 0..20 {
            let key = KeyMaterial::generate("other").expect("key");
            let err = ObjectStore::<DbConnectionParams, _>::new(
                blobs.clone(),
                Cipher::new(key, EnvelopeFormat::Legacy),
            )
            .load("cfg")
            .expect_err("wrong key");
            assert!(matches!(
                err.kind(),
                ErrorKind::Cipher | ErrorKind::Deserialization
            ));
        }
    }

    #[test]
    fn truncated_files_are_cipher_errors() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = file_store::<DbConnectionParams>(dir.path(), EnvelopeFormat::Legacy);

        let short_iv = STANDARD.encode([0u8; 15]);
        for contents in ["", "AAAA", short_iv.as_str()] {
            fs::write(dir.path().join("cfg.bin"), contents).expect("write raw");
            let err = store.load("cfg.bin").expect_err("truncated");
            assert!(
                matches!(err, StoreError::Cipher(CipherError::MalformedEnvelope { .. })),
                "{contents:?} gave {err:?}"
            );
        }
    }

    #[test]
    fn garbage_file_is_a_cipher_error() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = file_store::<DbConnectionParams>(dir.path(), EnvelopeFormat::Legacy);
        fs::write(dir.path().join("cfg.bin"), "<DbConnectionParams/>").expect("write raw");

        let err = store.load("cfg.bin").expect_err("not an envelope");
        assert_eq!(err.kind(), ErrorKind::Cipher);
    }

    #[test]
    fn unreadable_location_is_a_storage_error() {
        let dir = tempfile::tempdir().expect("tempdir");
        fs::create_dir(dir.path().join("cfg.bin")).expect("mkdir");
        let store = file_store::<DbConnectionParams>(dir.path(), EnvelopeFormat::Legacy);

        let err = store.load("cfg.bin").expect_err("a directory is not a record");
        assert_eq!(err.kind(), ErrorKind::Storage);
        assert!(!err.is_not_found());
        assert!(matches!(err, StoreError::Storage(StorageError::Io { .. })));
    }

    /// Flipping a ciphertext byte in a legacy file is caught by the padding
    /// check, the UTF-8 check, or the record parser; it is never loaded as the
    /// original value.
    #[test]
    fn tampered_legacy_file_never_loads_original() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = file_store::<DbConnectionParams>(dir.path(), EnvelopeFormat::Legacy);
        store.save("cfg.bin", &db_params()).expect("save");
        let path = dir.path().join("cfg.bin");
        let envelope = STANDARD
            .decode(fs::read_to_string(&path).expect("raw").trim())
            .expect("base64");

        for index in IV_LEN..envelope.len() {
            let mut tampered = envelope.clone();
            tampered[index] ^= 0x80;
            fs::write(&path, STANDARD.encode(&tampered)).expect("write tampered");
            if let Ok(loaded) = store.load("cfg.bin") {
                assert_ne!(loaded, db_params(), "flip at {index} went unnoticed");
            }
        }
    }

    #[test]
    fn tampered_sealed_file_is_a_cipher_error() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = file_store::<DbConnectionParams>(dir.path(), EnvelopeFormat::Sealed);
        store.save("cfg.bin", &db_params()).expect("save");
        let path = dir.path().join("cfg.bin");
        let mut envelope = STANDARD
            .decode(fs::read_to_string(&path).expect("raw").trim())
            .expect("base64");

        let last = envelope.len() - 1;
        envelope[last] ^= 0x01;
        fs::write(&path, STANDARD.encode(&envelope)).expect("write tampered");

        let err = store.load("cfg.bin").expect_err("tag mismatch");
        assert_eq!(err, StoreError::Cipher(CipherError::Decrypt));
    }

    #[test]
    fn reseal_upgrades_legacy_file() {
        let dir = tempfile::tempdir().expect("tempdir");
        let legacy = file_store::<DbConnectionParams>(dir.path(), EnvelopeFormat::Legacy);
        legacy.save("cfg.bin", &db_params()).expect("legacy save");

        let sealed = file_store::<DbConnectionParams>(dir.path(), EnvelopeFormat::Sealed);
        sealed.reseal("cfg.bin").expect("reseal");

        let raw = fs::read_to_string(dir.path().join("cfg.bin")).expect("raw");
        let envelope = STANDARD.decode(raw.trim()).expect("base64");
        assert_eq!(EnvelopeFormat::detect(&envelope), EnvelopeFormat::Sealed);
        assert_eq!(sealed.load("cfg.bin").expect("load"), db_params());
    }

    #[test]
    fn reseal_of_missing_location_is_not_found() {
        let store = ObjectStore::<DbConnectionParams, _>::new(
            InMemoryBlobStore::new(),
            Cipher::new(KeyMaterial::legacy(), EnvelopeFormat::Sealed),
        );
        let err = store.reseal("nope").expect_err("missing");
        assert!(err.is_not_found());
    }

    #[test]
    fn store_is_shareable_across_threads() {
        let store = std::sync::Arc::new(ObjectStore::<DbConnectionParams, _>::new(
            InMemoryBlobStore::new(),
            Cipher::new(KeyMaterial::legacy(), EnvelopeFormat::Sealed),
        ));

        let handles: Vec<_> = (0..4)
            .map(|i| {
                let store = std::sync::Arc::clone(&store);
                std::thread::spawn(move || {
                    let location = format!("cfg-{i}");
                    store.save(&location, &db_params()).expect("save");
                    store.load(&location).expect("load")
                })
            })
            .collect();

        for handle in handles {
            assert_eq!(handle.join().expect("thread"), db_params());
        }
    }

    /// Collects the `location` field of every span opened while installed.
    #[derive(Clone, Default)]
    struct SpanLocations(std::sync::Arc<std::sync::Mutex<Vec<(String, String)>>>);

    struct LocationVisitor(Option<String>);

    impl tracing::field::Visit for LocationVisitor {
        fn record_debug(&mut self, field: &tracing::field::Field, value: &dyn std::fmt::Debug) {
            if field.name() == "location" {
                self.0 = Some(format!("{value:?}"));
            }
        }
    }

    impl<S: tracing::Subscriber> tracing_subscriber::Layer<S> for SpanLocations {
        fn on_new_span(
            &self,
            attrs: &tracing::span::Attributes<'_>,
            _id: &tracing::span::Id,
            _ctx: tracing_subscriber::layer::Context<'_, S>,
        ) {
            let mut visitor = LocationVisitor(None);
            attrs.record(&mut visitor);
            if let Some(location) = visitor.0 {
                self.0
                    .lock()
                    .expect("span log")
                    .push((attrs.metadata().name().to_string(), location));
            }
        }
    }

    #[test]
    fn spans_record_the_location() {
        use tracing_subscriber::layer::SubscriberExt;

        let spans = SpanLocations::default();
        let subscriber = tracing_subscriber::registry().with(spans.clone());
        let dir = tempfile::tempdir().expect("tempdir");
        let store = file_store::<DbConnectionParams>(dir.path(), EnvelopeFormat::Sealed);

        tracing::subscriber::with_default(subscriber, || {
            store.save("cfg.bin", &db_params()).expect("save");
            store.load("cfg.bin").expect("load");
        });

        let recorded = spans.0.lock().expect("span log").clone();
        for name in ["save", "load", "write", "read"] {
            assert!(
                recorded
                    .iter()
                    .any(|(span, location)| span == name && location == "cfg.bin"),
                "no {name} span with a location in {recorded:?}"
            );
        }
    }
}
