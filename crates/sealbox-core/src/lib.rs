//! Core contracts for sealbox: the blob storage seam and the settings records
//! persisted through the encrypted object store.
//! This crate is intentionally small to keep dependency surface minimal.

pub mod settings;
pub mod storage;
