use std::path::{Path, PathBuf};

use crate::config::{Config, KeySource};
use color_eyre::Result;
use dirs::data_dir;
use sealbox_storage::{
    key_provider::{EnvKeyProvider, KeyringProvider, StaticKeyProvider},
    Cipher, EnvelopeFormat, FileBlobStore, KeyMaterial, KeyProvider, ObjectStore,
};
use serde::{de::DeserializeOwned, Serialize};
use tracing::{debug, warn};

pub const DB_SETTINGS_FILE: &str = "dbConnectionParams.STD";
pub const MAIL_SETTINGS_FILE: &str = "emailSettings.STD";

const DEFAULT_KEY_ENV: &str = "SEALBOX_KEY";
const KEYRING_SERVICE: &str = "sealbox";
const KEYRING_ACCOUNT: &str = "data-key";

/// Resolve the default data directory for sealbox.
pub fn default_data_dir() -> Result<PathBuf> {
    let base = data_dir().ok_or_else(|| color_eyre::eyre::eyre!("no data dir available"))?;
    Ok(base.join("sealbox"))
}

/// Root directory for settings files, honoring the config override.
pub fn data_root(config: &Config) -> Result<PathBuf> {
    match &config.data_dir {
        Some(root) => Ok(root.clone()),
        None => default_data_dir(),
    }
}

/// Turn a `--file` argument into a store location. Explicit paths are made
/// absolute against the working directory so they bypass the data root.
pub fn location(file: Option<&Path>, default_name: &str) -> Result<String> {
    let Some(file) = file else {
        return Ok(default_name.to_string());
    };
    let path = if file.is_absolute() {
        file.to_path_buf()
    } else {
        std::env::current_dir()?.join(file)
    };
    path.to_str()
        .map(str::to_string)
        .ok_or_else(|| color_eyre::eyre::eyre!("path is not valid UTF-8: {}", path.display()))
}

/// Pick the key provider described by the config.
pub fn key_provider(config: &Config) -> Result<Box<dyn KeyProvider>> {
    let key = config.key.clone().unwrap_or_default();
    let provider: Box<dyn KeyProvider> = match key.source {
        KeySource::Inline => {
            let value = key
                .value
                .ok_or_else(|| color_eyre::eyre::eyre!("key.value is required for inline keys"))?;
            Box::new(StaticKeyProvider::from_base64("config", &value)?)
        }
        KeySource::Env => Box::new(EnvKeyProvider::new(
            key.env_var.unwrap_or_else(|| DEFAULT_KEY_ENV.to_string()),
        )),
        KeySource::Keyring => Box::new(KeyringProvider::new(
            key.service.unwrap_or_else(|| KEYRING_SERVICE.to_string()),
            key.account.unwrap_or_else(|| KEYRING_ACCOUNT.to_string()),
        )),
        KeySource::Legacy => {
            warn!("using the built-in legacy key; configure [key] to protect stored credentials");
            Box::new(StaticKeyProvider::new(KeyMaterial::legacy()))
        }
    };
    Ok(provider)
}

/// Build the cipher for this invocation. `format` overrides the config file.
pub fn cipher_from_config(config: &Config, format: Option<EnvelopeFormat>) -> Result<Cipher> {
    let material = key_provider(config)?.get_or_create()?;
    let format = format.unwrap_or_else(|| config.format());
    debug!(key_id = %material.id, %format, "cipher configured");
    Ok(Cipher::new(material, format).accept_legacy(config.accept_legacy()))
}

/// Build a file-backed object store for `T` using config overrides.
pub fn store_from_config<T>(
    config: &Config,
    format: Option<EnvelopeFormat>,
) -> Result<ObjectStore<T>>
where
    T: Serialize + DeserializeOwned,
{
    let root = data_root(config)?;
    debug!(?root, "initializing encrypted store");
    Ok(ObjectStore::new(
        FileBlobStore::new(root),
        cipher_from_config(config, format)?,
    ))
}

/// Helper for tests to construct a store rooted at a temp dir with an ephemeral key.
#[cfg(test)]
pub fn test_store<T: Serialize + DeserializeOwned>(
    root: impl Into<PathBuf>,
    format: EnvelopeFormat,
) -> ObjectStore<T> {
    let material = KeyMaterial::generate("test").expect("generate key");
    ObjectStore::new(FileBlobStore::new(root), Cipher::new(material, format))
}
