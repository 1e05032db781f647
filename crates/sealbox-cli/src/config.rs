use std::{
    fs,
    path::{Path, PathBuf},
};

use color_eyre::Result;
use dirs::config_dir;
use sealbox_storage::EnvelopeFormat;
use serde::{Deserialize, Serialize};

/// User-level configuration loaded from `~/.config/sealbox/config.toml` (platform-specific).
#[derive(Debug, Clone, Deserialize, Serialize, Default, PartialEq, Eq)]
pub struct Config {
    /// Directory holding the settings files.
    pub data_dir: Option<PathBuf>,
    /// Envelope format used for writes. Defaults to `legacy`.
    pub format: Option<EnvelopeFormat>,
    /// Read legacy files when writing sealed ones. Defaults to true.
    pub accept_legacy: Option<bool>,
    pub key: Option<KeyConfig>,
}

/// Where the encryption key comes from.
#[derive(Debug, Clone, Deserialize, Serialize, Default, PartialEq, Eq)]
pub struct KeyConfig {
    pub source: KeySource,
    /// Base64 key when `source = "inline"`.
    pub value: Option<String>,
    /// Variable name when `source = "env"`.
    pub env_var: Option<String>,
    pub service: Option<String>,
    pub account: Option<String>,
}

#[derive(Debug, Clone, Copy, Deserialize, Serialize, Default, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum KeySource {
    Inline,
    Env,
    Keyring,
    /// The key built into the original tool.
    #[default]
    Legacy,
}

impl Config {
    pub fn format(&self) -> EnvelopeFormat {
        self.format.unwrap_or_default()
    }

    pub fn accept_legacy(&self) -> bool {
        self.accept_legacy.unwrap_or(true)
    }
}

/// Load config from the default path; if missing, return defaults.
pub fn load() -> Result<Config> {
    let path = default_path()?;
    load_from_path(path)
}

/// Load config from a given path; if missing or empty, return defaults.
pub fn load_from_path(path: impl AsRef<Path>) -> Result<Config> {
    let path = path.as_ref();
    if !path.exists() {
        return Ok(Config::default());
    }
    let contents = fs::read_to_string(path)?;
    if contents.trim().is_empty() {
        return Ok(Config::default());
    }
    let cfg: Config = toml::from_str(&contents)?;
    Ok(cfg)
}

/// Resolve the default config path (platform aware).
pub fn default_path() -> Result<PathBuf> {
    let base = config_dir().ok_or_else(|| color_eyre::eyre::eyre!("no config dir available"))?;
    Ok(base.join("sealbox").join("config.toml"))
}

/// Write the given config to the default path unless a file is already there.
pub fn write_default_if_missing(config: &Config) -> Result<PathBuf> {
    write_to_path_if_missing(config, &default_path()?)
}

fn write_to_path_if_missing(config: &Config, path: &Path) -> Result<PathBuf> {
    if path.exists() {
        return Ok(path.to_path_buf());
    }
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let body = toml::to_string_pretty(config)?;
    fs::write(path, body)?;
    Ok(path.to_path_buf())
}
