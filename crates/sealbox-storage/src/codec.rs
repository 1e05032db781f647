//! Textual encoding of records. Pretty JSON keeps stored plaintext diffable and
//! lets readers skip fields they do not know about.

use serde::{de::DeserializeOwned, Serialize};
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum CodecError {
    /// The value has a shape JSON cannot represent.
    #[error("serialization failed: {reason}")]
    Encode { reason: String },
    /// The text is malformed, misses a required field, or has a type mismatch.
    #[error("deserialization failed: {reason}")]
    Decode { reason: String },
}

pub fn encode<T: Serialize + ?Sized>(value: &T) -> Result<String, CodecError> {
    serde_json::to_string_pretty(value).map_err(|e| CodecError::Encode {
        reason: e.to_string(),
    })
}

pub fn decode<T: DeserializeOwned>(text: &str) -> Result<T, CodecError> {
    serde_json::from_str(text).map_err(|e| CodecError::Decode {
        reason: e.to_string(),
    })
}
