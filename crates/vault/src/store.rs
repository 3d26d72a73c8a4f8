//! TOML-backed connection store.
//!
//! Each record keeps its structural fields in plaintext so connections can be
//! listed without the key; the sensitive bundle is serialized to JSON,
//! encrypted with [`SecretCipher`] and stored hex-encoded as `secret`.
//! Every mutation rewrites the file through a staged temp file and a rename,
//! after copying the previous file to a timestamped backup.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::RwLock;

use chrono::{DateTime, Local, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use dbconn_core::{
    config::APP_NAME, BackendKind, ConnectionDescriptor, ConnectionSummary, Error, Result,
    Settings,
};

use crate::atomic;
use crate::cipher::SecretCipher;

/// Version written on every save.
pub const CURRENT_VERSION: &str = "1.1.0";
/// Versions `load` accepts. `1.0.0` files carry a bare encrypted `password` per record.
pub const SUPPORTED_VERSIONS: &[&str] = &["1.0.0", "1.1.0"];

const BACKUP_MARKER: &str = ".backup.";

// ── On-disk model ─────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
struct ConfigFile {
    version: String,
    #[serde(default = "default_app_name")]
    app_name: String,
    #[serde(default)]
    metadata: Metadata,
    #[serde(default)]
    connections: BTreeMap<String, EncryptedRecord>,
}

fn default_app_name() -> String {
    APP_NAME.to_string()
}

impl ConfigFile {
    fn empty() -> Self {
        Self {
            version: CURRENT_VERSION.to_string(),
            app_name: default_app_name(),
            metadata: Metadata::default(),
            connections: BTreeMap::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Metadata {
    created: DateTime<Utc>,
    last_modified: DateTime<Utc>,
}

impl Default for Metadata {
    fn default() -> Self {
        let now = Utc::now();
        Self {
            created: now,
            last_modified: now,
        }
    }
}

/// Persisted form of one descriptor: plaintext metadata plus the encrypted bundle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EncryptedRecord {
    pub backend_kind: BackendKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub host: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    pub database: String,
    #[serde(default)]
    pub passwordless: bool,
    /// Hex of `nonce || ciphertext || tag` over the JSON secret bundle.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub secret: Option<String>,
    /// `1.0.0` layout: hex ciphertext of the bare password. Kept until the record is rewritten.
    #[serde(default, rename = "password", skip_serializing_if = "Option::is_none")]
    legacy_password: Option<String>,
    #[serde(default)]
    pub extra_params: BTreeMap<String, String>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct SecretBundle {
    #[serde(default)]
    password: Option<String>,
}

impl EncryptedRecord {
    fn seal(descriptor: &ConnectionDescriptor, cipher: &SecretCipher) -> Result<Self> {
        let bundle = SecretBundle {
            password: descriptor.password.clone(),
        };
        let json = serde_json::to_vec(&bundle)
            .map_err(|e| Error::corrupt(format!("failed to serialize secret bundle: {}", e)))?;

        Ok(Self {
            backend_kind: descriptor.backend_kind,
            host: descriptor.host.clone(),
            port: descriptor.port,
            username: descriptor.username.clone(),
            database: descriptor.database.clone(),
            passwordless: descriptor.passwordless,
            secret: Some(cipher.encrypt_hex(&json)?),
            legacy_password: None,
            extra_params: descriptor.extra_params.clone(),
        })
    }

    fn open(&self, name: &str, cipher: &SecretCipher) -> Result<ConnectionDescriptor> {
        let password = match (&self.secret, &self.legacy_password) {
            (Some(secret), _) => {
                let json = cipher.decrypt_hex(secret)?;
                let bundle: SecretBundle = serde_json::from_slice(&json)
                    .map_err(|e| Error::corrupt(format!("secret bundle is not valid JSON: {}", e)))?;
                bundle.password
            }
            (None, Some(legacy)) => {
                let raw = cipher.decrypt_hex(legacy)?;
                Some(
                    String::from_utf8(raw)
                        .map_err(|_| Error::corrupt("decrypted password is not UTF-8"))?,
                )
            }
            (None, None) => None,
        };

        Ok(ConnectionDescriptor {
            name: name.to_string(),
            backend_kind: self.backend_kind,
            host: self.host.clone(),
            port: self.port,
            username: self.username.clone(),
            password,
            database: self.database.clone(),
            passwordless: self.passwordless,
            extra_params: self.extra_params.clone(),
        })
    }

    fn summary(&self, name: &str) -> ConnectionSummary {
        ConnectionSummary {
            name: name.to_string(),
            backend_kind: self.backend_kind,
            host: self.host.clone(),
            database: self.database.clone(),
        }
    }
}

/// File-level facts reported by `dbconn info`.
#[derive(Debug, Clone, Serialize)]
pub struct StoreInfo {
    pub path: PathBuf,
    pub exists: bool,
    pub version: String,
    pub app_name: String,
    pub created: Option<DateTime<Utc>>,
    pub last_modified: Option<DateTime<Utc>>,
    pub connection_count: usize,
    pub backup_count: usize,
}

// ── Store ─────────────────────────────────────────────────────

pub struct ConfigStore {
    path: PathBuf,
    cipher: SecretCipher,
    max_backups: usize,
    lock: RwLock<()>,
}

impl std::fmt::Debug for ConfigStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConfigStore")
            .field("path", &self.path)
            .field("max_backups", &self.max_backups)
            .finish_non_exhaustive()
    }
}

impl ConfigStore {
    pub fn new(path: impl Into<PathBuf>, cipher: SecretCipher) -> Self {
        Self {
            path: path.into(),
            cipher,
            max_backups: 5,
            lock: RwLock::new(()),
        }
    }

    pub fn from_settings(settings: &Settings, cipher: SecretCipher) -> Self {
        Self::new(settings.connections_path(), cipher).with_max_backups(settings.max_backups)
    }

    pub fn with_max_backups(mut self, max_backups: usize) -> Self {
        self.max_backups = max_backups;
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn cipher(&self) -> &SecretCipher {
        &self.cipher
    }

    fn read_guard(&self) -> std::sync::RwLockReadGuard<'_, ()> {
        self.lock.read().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn write_guard(&self) -> std::sync::RwLockWriteGuard<'_, ()> {
        self.lock.write().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    // ── Reads ─────────────────────────────────────────────────

    fn read_file(&self) -> Result<Option<ConfigFile>> {
        if !self.path.exists() {
            return Ok(None);
        }
        let content = fs::read_to_string(&self.path)?;
        let file: ConfigFile = toml::from_str(&content)
            .map_err(|e| Error::corrupt(format!("{}: {}", self.path.display(), e)))?;

        if !SUPPORTED_VERSIONS.contains(&file.version.as_str()) {
            return Err(Error::corrupt(format!(
                "unsupported config version '{}' (supported: {})",
                file.version,
                SUPPORTED_VERSIONS.join(", ")
            )));
        }
        Ok(Some(file))
    }

    fn read_or_empty(&self) -> Result<ConfigFile> {
        Ok(self.read_file()?.unwrap_or_else(ConfigFile::empty))
    }

    /// Decrypt every record. The first record that fails aborts the load,
    /// tagged with its name.
    pub fn load(&self) -> Result<BTreeMap<String, ConnectionDescriptor>> {
        let _guard = self.read_guard();
        let Some(file) = self.read_file()? else {
            return Ok(BTreeMap::new());
        };

        let mut out = BTreeMap::new();
        for (name, record) in &file.connections {
            let descriptor = record
                .open(name, &self.cipher)
                .map_err(|e| e.for_record(name))?;
            out.insert(name.clone(), descriptor);
        }
        debug!(count = out.len(), path = %self.path.display(), "Loaded connections");
        Ok(out)
    }

    /// Decrypt a single record.
    pub fn get(&self, name: &str) -> Result<ConnectionDescriptor> {
        let _guard = self.read_guard();
        let file = self.read_or_empty()?;
        let record = file
            .connections
            .get(name)
            .ok_or_else(|| Error::NotFound(name.to_string()))?;
        record.open(name, &self.cipher).map_err(|e| e.for_record(name))
    }

    pub fn contains(&self, name: &str) -> Result<bool> {
        let _guard = self.read_guard();
        Ok(self.read_or_empty()?.connections.contains_key(name))
    }

    /// Name-ordered summaries built from plaintext fields; never decrypts.
    pub fn list(&self) -> Result<Vec<ConnectionSummary>> {
        let _guard = self.read_guard();
        let file = self.read_or_empty()?;
        Ok(file
            .connections
            .iter()
            .map(|(name, record)| record.summary(name))
            .collect())
    }

    pub fn info(&self) -> Result<StoreInfo> {
        let _guard = self.read_guard();
        let file = self.read_file()?;
        let backup_count = self.backups()?.len();
        Ok(match file {
            Some(file) => StoreInfo {
                path: self.path.clone(),
                exists: true,
                version: file.version,
                app_name: file.app_name,
                created: Some(file.metadata.created),
                last_modified: Some(file.metadata.last_modified),
                connection_count: file.connections.len(),
                backup_count,
            },
            None => StoreInfo {
                path: self.path.clone(),
                exists: false,
                version: CURRENT_VERSION.to_string(),
                app_name: default_app_name(),
                created: None,
                last_modified: None,
                connection_count: 0,
                backup_count,
            },
        })
    }

    // ── Writes ────────────────────────────────────────────────

    /// Replace the whole mapping, re-encrypting every record.
    pub fn save(&self, connections: &BTreeMap<String, ConnectionDescriptor>) -> Result<()> {
        let _guard = self.write_guard();
        // A corrupt previous file only loses its `created` timestamp.
        let mut file = match self.read_file() {
            Ok(Some(file)) => file,
            Ok(None) => ConfigFile::empty(),
            Err(e) => {
                warn!(error = %e, "Previous config unreadable, starting fresh metadata");
                ConfigFile::empty()
            }
        };

        let mut records = BTreeMap::new();
        for (name, descriptor) in connections {
            let descriptor = descriptor.clone().normalized();
            records.insert(name.clone(), EncryptedRecord::seal(&descriptor, &self.cipher)?);
        }
        file.connections = records;
        self.write_file(file)?;
        info!(count = connections.len(), "Saved connections");
        Ok(())
    }

    /// Insert or replace one record; the others are carried over still encrypted.
    pub fn upsert(&self, name: &str, descriptor: &ConnectionDescriptor) -> Result<()> {
        let _guard = self.write_guard();
        let mut file = self.read_or_empty()?;

        let mut descriptor = descriptor.clone().normalized();
        descriptor.name = name.to_string();
        let record = EncryptedRecord::seal(&descriptor, &self.cipher)?;
        let replaced = file.connections.insert(name.to_string(), record).is_some();

        self.write_file(file)?;
        info!(name = %name, backend = %descriptor.backend_kind, replaced, "Stored connection");
        Ok(())
    }

    pub fn delete(&self, name: &str) -> Result<()> {
        let _guard = self.write_guard();
        let mut file = self.read_or_empty()?;
        if file.connections.remove(name).is_none() {
            return Err(Error::NotFound(name.to_string()));
        }
        self.write_file(file)?;
        info!(name = %name, "Deleted connection");
        Ok(())
    }

    /// Copy the current file to a timestamped backup and return its path.
    pub fn backup(&self) -> Result<PathBuf> {
        let _guard = self.read_guard();
        if !self.path.exists() {
            return Err(Error::Io(std::io::Error::new(
                std::io::ErrorKind::NotFound,
                format!("{} does not exist yet", self.path.display()),
            )));
        }
        let backup = self.copy_to_backup()?;
        self.prune_backups()?;
        Ok(backup)
    }

    /// Serialize and stage `file` without publishing it.
    fn stage(&self, mut file: ConfigFile) -> Result<PathBuf> {
        file.version = CURRENT_VERSION.to_string();
        file.metadata.last_modified = Utc::now();
        let body = toml::to_string_pretty(&file)
            .map_err(|e| Error::corrupt(format!("failed to serialize config: {}", e)))?;
        Ok(atomic::stage(&self.path, body.as_bytes())?)
    }

    fn write_file(&self, file: ConfigFile) -> Result<()> {
        let staged = self.stage(file)?;
        if self.path.exists() {
            if let Err(e) = self.copy_to_backup() {
                let _ = fs::remove_file(&staged);
                return Err(e);
            }
        }
        atomic::commit(&staged, &self.path)?;
        self.prune_backups()?;
        debug!(path = %self.path.display(), "Config written");
        Ok(())
    }

    // ── Backups ───────────────────────────────────────────────

    fn backup_prefix(&self) -> String {
        let file_name = self
            .path
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or("connections.toml");
        format!("{}{}", file_name, BACKUP_MARKER)
    }

    fn copy_to_backup(&self) -> Result<PathBuf> {
        let stamp = Local::now().format("%Y%m%d_%H%M%S_%3f").to_string();
        let dir = self.path.parent().unwrap_or_else(|| Path::new("."));
        let base = format!("{}{}", self.backup_prefix(), stamp);

        let mut target = dir.join(&base);
        let mut n = 1;
        while target.exists() {
            target = dir.join(format!("{}-{}", base, n));
            n += 1;
        }
        fs::copy(&self.path, &target)?;
        debug!(backup = %target.display(), "Backed up config");
        Ok(target)
    }

    /// Existing backups, oldest first.
    pub fn backups(&self) -> Result<Vec<PathBuf>> {
        let dir = self.path.parent().unwrap_or_else(|| Path::new("."));
        if !dir.exists() {
            return Ok(Vec::new());
        }
        let prefix = self.backup_prefix();
        let mut found = Vec::new();
        for entry in fs::read_dir(dir)? {
            let entry = entry?;
            let is_backup = entry
                .file_name()
                .to_str()
                .is_some_and(|n| n.starts_with(&prefix));
            if is_backup {
                found.push(entry.path());
            }
        }
        found.sort_by_key(|p| backup_sort_key(p));
        Ok(found)
    }

    fn prune_backups(&self) -> Result<()> {
        let backups = self.backups()?;
        let excess = backups.len().saturating_sub(self.max_backups);
        for old in backups.into_iter().take(excess) {
            if let Err(e) = fs::remove_file(&old) {
                warn!(backup = %old.display(), error = %e, "Failed to prune backup");
            }
        }
        Ok(())
    }
}

/// Timestamp part plus the numeric `-N` collision suffix (0 when absent).
fn backup_sort_key(path: &Path) -> (String, u32) {
    let name = path
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or_default()
        .to_string();
    match name.rsplit_once('-') {
        Some((base, n)) => match n.parse::<u32>() {
            Ok(n) => (base.to_string(), n),
            Err(_) => (name, 0),
        },
        None => (name, 0),
    }
}
