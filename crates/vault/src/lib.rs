//! Encrypted-at-rest storage for connection descriptors.
//!
//! [`SecretCipher`] owns the AES-256-GCM key; [`ConfigStore`] persists
//! descriptors to `connections.toml`, encrypting the sensitive bundle of
//! each record with the cipher before anything touches disk.

mod atomic;
pub mod cipher;
pub mod store;

pub use cipher::{KeySource, SecretCipher, KEY_ENV};
pub use store::{ConfigStore, EncryptedRecord, StoreInfo, CURRENT_VERSION, SUPPORTED_VERSIONS};
