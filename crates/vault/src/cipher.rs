//! AES-256-GCM secret cipher.
//!
//! Ciphertext layout is `nonce (12) || ciphertext || tag (16)`. The key is a
//! raw 32-byte file generated from the OS CSPRNG on first use, or 64 hex
//! characters in `DBCONN_ENCRYPTION_KEY`.

use std::fmt;
use std::path::{Path, PathBuf};

use aes_gcm::aead::{Aead, KeyInit, OsRng};
use aes_gcm::{Aes256Gcm, Nonce};
use rand::RngCore;
use tracing::info;

use dbconn_core::{Error, Result};

use crate::atomic;

pub const KEY_LEN: usize = 32;
pub const NONCE_LEN: usize = 12;
pub const TAG_LEN: usize = 16;

/// Environment variable carrying the key as hex; overrides the key file.
pub const KEY_ENV: &str = "DBCONN_ENCRYPTION_KEY";

/// Where the active key came from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KeySource {
    File(PathBuf),
    Env,
    /// Generated in memory and never persisted.
    Ephemeral,
}

impl fmt::Display for KeySource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            KeySource::File(path) => write!(f, "{}", path.display()),
            KeySource::Env => write!(f, "${}", KEY_ENV),
            KeySource::Ephemeral => f.write_str("ephemeral"),
        }
    }
}

#[derive(Clone)]
pub struct SecretCipher {
    cipher: Aes256Gcm,
    source: KeySource,
}

impl fmt::Debug for SecretCipher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SecretCipher")
            .field("source", &self.source)
            .finish_non_exhaustive()
    }
}

impl SecretCipher {
    fn with_key(key: &[u8; KEY_LEN], source: KeySource) -> Self {
        Self {
            cipher: Aes256Gcm::new(key.into()),
            source,
        }
    }

    pub fn from_key(key: &[u8; KEY_LEN]) -> Self {
        Self::with_key(key, KeySource::Ephemeral)
    }

    /// Fresh random key held only in memory.
    pub fn generate() -> Self {
        let mut key = [0u8; KEY_LEN];
        OsRng.fill_bytes(&mut key);
        Self::from_key(&key)
    }

    /// Parse a 64-character hex key.
    pub fn from_hex(hex_key: &str) -> Result<Self> {
        let bytes = hex::decode(hex_key.trim())
            .map_err(|e| Error::corrupt(format!("{} is not valid hex: {}", KEY_ENV, e)))?;
        let key = key_from_slice(&bytes, KEY_ENV)?;
        Ok(Self::with_key(&key, KeySource::Env))
    }

    /// Load the key from `DBCONN_ENCRYPTION_KEY` or `key_path`, generating the file if absent.
    pub fn load_or_create(key_path: &Path) -> Result<Self> {
        if let Ok(env_key) = std::env::var(KEY_ENV) {
            if !env_key.trim().is_empty() {
                info!("Using encryption key from {} env var", KEY_ENV);
                return Self::from_hex(&env_key);
            }
        }
        Self::load_or_create_file(key_path)
    }

    /// Same as [`load_or_create`](Self::load_or_create) but ignores the environment.
    pub fn load_or_create_file(key_path: &Path) -> Result<Self> {
        if key_path.exists() {
            let key = read_key_file(key_path)?;
            info!(path = %key_path.display(), "Loaded encryption key");
            return Ok(Self::with_key(&key, KeySource::File(key_path.to_path_buf())));
        }

        let mut key = [0u8; KEY_LEN];
        OsRng.fill_bytes(&mut key);

        let staged = atomic::stage(key_path, &key)?;
        let key = if atomic::commit_new(&staged, key_path)? {
            info!(path = %key_path.display(), "Generated new encryption key");
            key
        } else {
            // A concurrent first use published its key first.
            read_key_file(key_path)?
        };
        Ok(Self::with_key(&key, KeySource::File(key_path.to_path_buf())))
    }

    pub fn source(&self) -> &KeySource {
        &self.source
    }

    /// Encrypt with a fresh random nonce; returns `nonce || ciphertext || tag`.
    pub fn encrypt(&self, plaintext: &[u8]) -> Result<Vec<u8>> {
        let mut nonce_bytes = [0u8; NONCE_LEN];
        OsRng.fill_bytes(&mut nonce_bytes);
        let nonce = Nonce::from_slice(&nonce_bytes);

        let sealed = self
            .cipher
            .encrypt(nonce, plaintext)
            .map_err(|e| Error::corrupt(format!("encryption failed: {}", e)))?;

        let mut out = Vec::with_capacity(NONCE_LEN + sealed.len());
        out.extend_from_slice(&nonce_bytes);
        out.extend_from_slice(&sealed);
        Ok(out)
    }

    /// Authenticate and decrypt. Tampered, truncated or foreign-key input is an
    /// [`Error::Integrity`].
    pub fn decrypt(&self, data: &[u8]) -> Result<Vec<u8>> {
        if data.len() < NONCE_LEN + TAG_LEN {
            return Err(Error::Integrity { name: None });
        }
        let (nonce_bytes, sealed) = data.split_at(NONCE_LEN);
        self.cipher
            .decrypt(Nonce::from_slice(nonce_bytes), sealed)
            .map_err(|_| Error::Integrity { name: None })
    }

    pub fn encrypt_hex(&self, plaintext: &[u8]) -> Result<String> {
        self.encrypt(plaintext).map(hex::encode)
    }

    /// Hex decoding failures are [`Error::ConfigCorrupt`]; authentication failures are integrity errors.
    pub fn decrypt_hex(&self, encoded: &str) -> Result<Vec<u8>> {
        let data = hex::decode(encoded.trim())
            .map_err(|e| Error::corrupt(format!("ciphertext is not valid hex: {}", e)))?;
        self.decrypt(&data)
    }

    /// Round-trip a probe through the cipher.
    pub fn verify(&self) -> bool {
        const PROBE: &[u8] = b"dbconn self-check";
        self.encrypt(PROBE)
            .and_then(|sealed| self.decrypt(&sealed))
            .is_ok_and(|opened| opened == PROBE)
    }
}

fn key_from_slice(bytes: &[u8], origin: &str) -> Result<[u8; KEY_LEN]> {
    <[u8; KEY_LEN]>::try_from(bytes).map_err(|_| {
        Error::corrupt(format!(
            "{}: expected a {}-byte key, got {} bytes",
            origin,
            KEY_LEN,
            bytes.len()
        ))
    })
}

fn read_key_file(path: &Path) -> Result<[u8; KEY_LEN]> {
    let bytes = std::fs::read(path)?;
    key_from_slice(&bytes, &path.display().to_string())
}
