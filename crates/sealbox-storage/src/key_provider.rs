use std::{
    fmt,
    sync::{Arc, Mutex},
};

use base64::{engine::general_purpose, Engine as _};
use rand::{rngs::OsRng, RngCore};
use thiserror::Error;
use tracing::info;
use zeroize::{Zeroize, ZeroizeOnDrop};

/// AES-128 key length in bytes.
pub const KEY_LEN: usize = 16;

/// The key compiled into every build of the original settings tool.
///
/// Anyone holding a binary can read files written with it. It exists only so
/// files written by older deployments stay readable; configure a real key.
pub const LEGACY_KEY: [u8; KEY_LEN] = [
    0x01, 0x23, 0x45, 0x67, 0x89, 0xab, 0xcd, 0xef, 0xfe, 0xdc, 0xba, 0x98, 0x76, 0x54, 0x32, 0x10,
];

/// A 128-bit symmetric key. Wiped from memory on drop, never printed.
#[derive(Clone, PartialEq, Eq, Zeroize, ZeroizeOnDrop)]
pub struct EncryptionKey([u8; KEY_LEN]);

impl EncryptionKey {
    pub fn new(bytes: [u8; KEY_LEN]) -> Self {
        Self(bytes)
    }

    pub fn from_slice(bytes: &[u8]) -> Result<Self, KeyError> {
        let bytes: [u8; KEY_LEN] = bytes.try_into().map_err(|_| KeyError::InvalidLength {
            expected: KEY_LEN,
            actual: bytes.len(),
        })?;
        Ok(Self(bytes))
    }

    pub fn from_base64(encoded: &str) -> Result<Self, KeyError> {
        let mut bytes = general_purpose::STANDARD
            .decode(encoded.trim())
            .map_err(|e| KeyError::Decode(e.to_string()))?;
        let key = Self::from_slice(&bytes);
        bytes.zeroize();
        key
    }

    pub fn to_base64(&self) -> String {
        general_purpose::STANDARD.encode(self.0)
    }

    pub fn as_bytes(&self) -> &[u8; KEY_LEN] {
        &self.0
    }
}

impl fmt::Debug for EncryptionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("EncryptionKey(..)")
    }
}

/// Key material used for encryption at rest.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyMaterial {
    /// Identifier for logging/rotation (never log key bytes).
    pub id: String,
    pub key: EncryptionKey,
}

impl KeyMaterial {
    pub fn new(id: impl Into<String>, key: EncryptionKey) -> Self {
        Self {
            id: id.into(),
            key,
        }
    }

    /// The built-in key of the original tool. See [`LEGACY_KEY`].
    pub fn legacy() -> Self {
        Self::new("legacy", EncryptionKey::new(LEGACY_KEY))
    }

    pub fn generate(id: impl Into<String>) -> Result<Self, KeyError> {
        let mut bytes = [0u8; KEY_LEN];
        OsRng
            .try_fill_bytes(&mut bytes)
            .map_err(|e| KeyError::Generation(e.to_string()))?;
        let material = Self::new(id, EncryptionKey::new(bytes));
        bytes.zeroize();
        Ok(material)
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum KeyError {
    #[error("keyring error: {0}")]
    Keyring(String),
    #[error("decode error: {0}")]
    Decode(String),
    #[error("key must be {expected} bytes, got {actual}")]
    InvalidLength { expected: usize, actual: usize },
    #[error("environment variable {0} is not set")]
    MissingEnv(String),
    #[error("generation error: {0}")]
    Generation(String),
}

/// Supplies the key a store is constructed with.
pub trait KeyProvider: Send + Sync {
    fn get_or_create(&self) -> Result<KeyMaterial, KeyError>;
}

/// A key fixed at construction, typically read from configuration.
#[derive(Debug, Clone)]
pub struct StaticKeyProvider {
    material: KeyMaterial,
}

impl StaticKeyProvider {
    pub fn new(material: KeyMaterial) -> Self {
        Self { material }
    }

    pub fn from_base64(id: impl Into<String>, encoded: &str) -> Result<Self, KeyError> {
        Ok(Self::new(KeyMaterial::new(
            id,
            EncryptionKey::from_base64(encoded)?,
        )))
    }
}

impl KeyProvider for StaticKeyProvider {
    fn get_or_create(&self) -> Result<KeyMaterial, KeyError> {
        Ok(self.material.clone())
    }
}

/// Reads a base64 key from an environment variable on every call.
#[derive(Debug, Clone)]
pub struct EnvKeyProvider {
    var: String,
}

impl EnvKeyProvider {
    pub fn new(var: impl Into<String>) -> Self {
        Self { var: var.into() }
    }
}

impl KeyProvider for EnvKeyProvider {
    fn get_or_create(&self) -> Result<KeyMaterial, KeyError> {
        let encoded =
            std::env::var(&self.var).map_err(|_| KeyError::MissingEnv(self.var.clone()))?;
        Ok(KeyMaterial::new(
            format!("env:{}", self.var),
            EncryptionKey::from_base64(&encoded)?,
        ))
    }
}

/// OS keyring-backed provider. Uses the `keyring` crate to store the key,
/// generating one only when the entry does not exist yet.
pub struct KeyringProvider {
    service: String,
    account: String,
}

impl KeyringProvider {
    pub fn new(service: impl Into<String>, account: impl Into<String>) -> Self {
        Self {
            service: service.into(),
            account: account.into(),
        }
    }
}

impl KeyProvider for KeyringProvider {
    fn get_or_create(&self) -> Result<KeyMaterial, KeyError> {
        let entry = keyring::Entry::new(&self.service, &self.account).map_err(keyring_error)?;
        key_from_entry(&self.account, &entry)
    }
}

// Any failure other than a missing entry must surface: generating here would
// overwrite the stored key and orphan every file written with it.
fn key_from_entry(id: &str, entry: &keyring::Entry) -> Result<KeyMaterial, KeyError> {
    match entry.get_password() {
        Ok(secret) => decode_key(id, &secret),
        Err(keyring::Error::NoEntry) => {
            let material = KeyMaterial::generate(id)?;
            entry
                .set_password(&material.key.to_base64())
                .map_err(keyring_error)?;
            info!(key_id = %material.id, "generated new keyring key");
            Ok(material)
        }
        Err(err) => Err(keyring_error(err)),
    }
}

fn keyring_error(err: keyring::Error) -> KeyError {
    KeyError::Keyring(err.to_string())
}

/// In-memory key provider for tests and ephemeral sessions.
#[derive(Debug, Default, Clone)]
pub struct InMemoryKeyProvider {
    inner: Arc<Mutex<Option<KeyMaterial>>>,
}

impl KeyProvider for InMemoryKeyProvider {
    fn get_or_create(&self) -> Result<KeyMaterial, KeyError> {
        let mut guard = self
            .inner
            .lock()
            .map_err(|err| KeyError::Generation(format!("lock poisoned: {err}")))?;

        if let Some(existing) = guard.clone() {
            return Ok(existing);
        }

        let material = KeyMaterial::generate("ephemeral")?;
        *guard = Some(material.clone());
        Ok(material)
    }
}

fn decode_key(id: &str, secret: &str) -> Result<KeyMaterial, KeyError> {
    Ok(KeyMaterial::new(id, EncryptionKey::from_base64(secret)?))
}
