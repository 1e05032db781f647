//! Cipher stage: turns serialized text into an envelope and back.
//!
//! Two envelope layouts exist:
//!
//! ```text
//! legacy v0:  IV (16) | AES-128-CBC + PKCS#7 ciphertext (16 * k, k >= 1)
//! sealed v1:  "SBOX" (4) | version (1) | alg (1) | nonce (12) | AES-128-GCM ciphertext + tag (16)
//! ```
//!
//! Legacy envelopes carry no header and no authentication tag. A flipped bit or
//! a wrong key is only caught when it happens to break the padding or the UTF-8
//! decoding; otherwise garbage comes back. Sealed envelopes bind the header as
//! associated data, so any modification fails decryption.
//!
//! Both layouts are stored as standard base64 text.

use std::{fmt, str::FromStr};

use aes::Aes128;
use aes_gcm::{
    aead::{Aead, KeyInit, Payload},
    Aes128Gcm, Key, Nonce,
};
use base64::{engine::general_purpose::STANDARD, Engine as _};
use cbc::cipher::{block_padding::Pkcs7, BlockDecryptMut, BlockEncryptMut, KeyIvInit};
use rand::{rngs::OsRng, RngCore};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

use crate::key_provider::KeyMaterial;

type Aes128CbcEnc = cbc::Encryptor<Aes128>;
type Aes128CbcDec = cbc::Decryptor<Aes128>;

pub const BLOCK_LEN: usize = 16;
pub const IV_LEN: usize = BLOCK_LEN;

pub const MAGIC: [u8; 4] = *b"SBOX";
pub const VERSION: u8 = 0x01;
pub const ALG_AES128_GCM: u8 = 0x01;
pub const HEADER_LEN: usize = MAGIC.len() + 2;
pub const NONCE_LEN: usize = 12;
pub const TAG_LEN: usize = 16;
pub const MIN_SEALED_LEN: usize = HEADER_LEN + NONCE_LEN + TAG_LEN;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EnvelopeFormat {
    /// Headerless AES-128-CBC, readable by every existing deployment.
    #[default]
    Legacy,
    /// Versioned AES-128-GCM.
    Sealed,
}

impl EnvelopeFormat {
    /// Identify the layout of raw envelope bytes.
    pub fn detect(envelope: &[u8]) -> Self {
        if envelope.starts_with(&MAGIC) {
            Self::Sealed
        } else {
            Self::Legacy
        }
    }
}

impl fmt::Display for EnvelopeFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Legacy => f.write_str("legacy"),
            Self::Sealed => f.write_str("sealed"),
        }
    }
}

impl FromStr for EnvelopeFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "legacy" | "v0" => Ok(Self::Legacy),
            "sealed" | "v1" => Ok(Self::Sealed),
            other => Err(format!("unknown envelope format: {other}")),
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum CipherError {
    /// Too short, wrong block alignment, or not base64.
    #[error("malformed envelope: {reason}")]
    MalformedEnvelope { reason: String },
    #[error("unsupported envelope: {reason}")]
    UnsupportedEnvelope { reason: String },
    /// Bad padding or authentication tag: wrong key, corruption, or truncation.
    #[error("decryption failed (wrong key or corrupted data)")]
    Decrypt,
    #[error("decrypted bytes are not valid UTF-8 text")]
    InvalidText,
    #[error("encryption failed: {reason}")]
    Encrypt { reason: String },
    #[error("entropy source failure: {reason}")]
    Entropy { reason: String },
}

/// Encrypts and decrypts envelopes under one fixed key.
///
/// Immutable after construction, so a single instance can be shared by any
/// number of threads.
#[derive(Clone)]
pub struct Cipher {
    material: KeyMaterial,
    aead: Aes128Gcm,
    format: EnvelopeFormat,
    accept_legacy: bool,
}

impl Cipher {
    pub fn new(material: KeyMaterial, format: EnvelopeFormat) -> Self {
        let aead = Aes128Gcm::new(Key::<Aes128Gcm>::from_slice(material.key.as_bytes()));
        Self {
            material,
            aead,
            format,
            accept_legacy: true,
        }
    }

    /// Whether headerless legacy envelopes may be decrypted. Always true when
    /// the cipher itself writes the legacy format.
    pub fn accept_legacy(mut self, accept: bool) -> Self {
        self.accept_legacy = accept;
        self
    }

    pub fn format(&self) -> EnvelopeFormat {
        self.format
    }

    pub fn key_id(&self) -> &str {
        &self.material.id
    }

    pub fn encrypt(&self, plain_text: &str) -> Result<Vec<u8>, CipherError> {
        match self.format {
            EnvelopeFormat::Legacy => self.encrypt_legacy(plain_text.as_bytes()),
            EnvelopeFormat::Sealed => self.encrypt_sealed(plain_text.as_bytes()),
        }
    }

    pub fn decrypt(&self, envelope: &[u8]) -> Result<String, CipherError> {
        let plain = match EnvelopeFormat::detect(envelope) {
            EnvelopeFormat::Sealed => self.decrypt_sealed(envelope)?,
            EnvelopeFormat::Legacy => {
                if !self.accept_legacy && self.format != EnvelopeFormat::Legacy {
                    return Err(CipherError::UnsupportedEnvelope {
                        reason: "legacy envelopes are not accepted".to_string(),
                    });
                }
                self.decrypt_legacy(envelope)?
            }
        };
        String::from_utf8(plain).map_err(|_| CipherError::InvalidText)
    }

    fn encrypt_legacy(&self, plain: &[u8]) -> Result<Vec<u8>, CipherError> {
        let mut iv = [0u8; IV_LEN];
        // A legacy IV that begins with the sealed magic would be misread as v1.
        loop {
            fill_random(&mut iv)?;
            if !iv.starts_with(&MAGIC) {
                break;
            }
        }

        let encryptor = Aes128CbcEnc::new_from_slices(self.material.key.as_bytes(), &iv)
            .map_err(|e| CipherError::Encrypt {
                reason: e.to_string(),
            })?;
        let ciphertext = encryptor.encrypt_padded_vec_mut::<Pkcs7>(plain);

        let mut envelope = Vec::with_capacity(IV_LEN + ciphertext.len());
        envelope.extend_from_slice(&iv);
        envelope.extend_from_slice(&ciphertext);
        debug!(key_id = %self.material.id, len = envelope.len(), "encrypted legacy envelope");
        Ok(envelope)
    }

    fn decrypt_legacy(&self, envelope: &[u8]) -> Result<Vec<u8>, CipherError> {
        if envelope.len() < IV_LEN {
            return Err(CipherError::MalformedEnvelope {
                reason: format!(
                    "{} bytes is shorter than the {IV_LEN}-byte IV",
                    envelope.len()
                ),
            });
        }
        let (iv, ciphertext) = envelope.split_at(IV_LEN);
        if ciphertext.is_empty() || ciphertext.len() % BLOCK_LEN != 0 {
            return Err(CipherError::MalformedEnvelope {
                reason: format!(
                    "ciphertext length {} is not a positive multiple of {BLOCK_LEN}",
                    ciphertext.len()
                ),
            });
        }

        let decryptor = Aes128CbcDec::new_from_slices(self.material.key.as_bytes(), iv)
            .map_err(|e| CipherError::MalformedEnvelope {
                reason: e.to_string(),
            })?;
        decryptor
            .decrypt_padded_vec_mut::<Pkcs7>(ciphertext)
            .map_err(|_| CipherError::Decrypt)
    }

    fn encrypt_sealed(&self, plain: &[u8]) -> Result<Vec<u8>, CipherError> {
        let header = sealed_header();
        let mut nonce = [0u8; NONCE_LEN];
        fill_random(&mut nonce)?;

        let ciphertext = self
            .aead
            .encrypt(
                Nonce::from_slice(&nonce),
                Payload {
                    msg: plain,
                    aad: &header,
                },
            )
            .map_err(|e| CipherError::Encrypt {
                reason: e.to_string(),
            })?;

        let mut envelope = Vec::with_capacity(HEADER_LEN + NONCE_LEN + ciphertext.len());
        envelope.extend_from_slice(&header);
        envelope.extend_from_slice(&nonce);
        envelope.extend_from_slice(&ciphertext);
        debug!(key_id = %self.material.id, len = envelope.len(), "encrypted sealed envelope");
        Ok(envelope)
    }

    fn decrypt_sealed(&self, envelope: &[u8]) -> Result<Vec<u8>, CipherError> {
        if envelope.len() < MIN_SEALED_LEN {
            return Err(CipherError::MalformedEnvelope {
                reason: format!(
                    "{} bytes is shorter than the {MIN_SEALED_LEN}-byte sealed minimum",
                    envelope.len()
                ),
            });
        }
        let (header, rest) = envelope.split_at(HEADER_LEN);
        let (version, alg) = (header[MAGIC.len()], header[MAGIC.len() + 1]);
        if version != VERSION {
            return Err(CipherError::UnsupportedEnvelope {
                reason: format!("version {version:#04x}"),
            });
        }
        if alg != ALG_AES128_GCM {
            return Err(CipherError::UnsupportedEnvelope {
                reason: format!("algorithm {alg:#04x}"),
            });
        }

        let (nonce, ciphertext) = rest.split_at(NONCE_LEN);
        self.aead
            .decrypt(
                Nonce::from_slice(nonce),
                Payload {
                    msg: ciphertext,
                    aad: header,
                },
            )
            .map_err(|_| CipherError::Decrypt)
    }
}

impl fmt::Debug for Cipher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Cipher")
            .field("material", &self.material)
            .field("format", &self.format)
            .field("accept_legacy", &self.accept_legacy)
            .finish_non_exhaustive()
    }
}

/// Render an envelope as the text written to storage.
pub fn to_text(envelope: &[u8]) -> String {
    STANDARD.encode(envelope)
}

/// Parse stored text back into envelope bytes. Surrounding whitespace is ignored.
pub fn from_text(text: &str) -> Result<Vec<u8>, CipherError> {
    STANDARD
        .decode(text.trim())
        .map_err(|e| CipherError::MalformedEnvelope {
            reason: format!("not base64: {e}"),
        })
}

fn sealed_header() -> [u8; HEADER_LEN] {
    let mut header = [0u8; HEADER_LEN];
    header[..MAGIC.len()].copy_from_slice(&MAGIC);
    header[MAGIC.len()] = VERSION;
    header[MAGIC.len() + 1] = ALG_AES128_GCM;
    header
}

fn fill_random(buf: &mut [u8]) -> Result<(), CipherError> {
    OsRng
        .try_fill_bytes(buf)
        .map_err(|e| CipherError::Entropy {
            reason: e.to_string(),
        })
}
