//! Connection descriptors: the named, persisted definition of how to reach
//! one database, plus the per-backend shape rules enforced before anything
//! is written to disk.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::{Error, Result};

/// Literal accepted as a sqlite `database` meaning "no file, keep it in memory".
pub const SQLITE_MEMORY: &str = ":memory:";

/// TDS protocol version spoken by the SQL Server driver.
pub const MSSQL_TDS_VERSION: &str = "7.3";

// ── Backend kind ──────────────────────────────────────────────

/// Database family; selects the adapter that serves a descriptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    Postgresql,
    Mysql,
    Mssql,
    Oracle,
    Sqlite,
}

impl BackendKind {
    pub const ALL: [BackendKind; 5] = [
        BackendKind::Postgresql,
        BackendKind::Mysql,
        BackendKind::Mssql,
        BackendKind::Oracle,
        BackendKind::Sqlite,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Postgresql => "postgresql",
            Self::Mysql => "mysql",
            Self::Mssql => "mssql",
            Self::Oracle => "oracle",
            Self::Sqlite => "sqlite",
        }
    }

    /// True for engines reached over host/port; false for the file-based one.
    pub fn is_network(&self) -> bool {
        !matches!(self, Self::Sqlite)
    }

    /// Returns the default port for this backend (`None` for sqlite).
    pub fn default_port(&self) -> Option<u16> {
        match self {
            Self::Postgresql => Some(5432),
            Self::Mysql => Some(3306),
            Self::Mssql => Some(1433),
            Self::Oracle => Some(1521),
            Self::Sqlite => None,
        }
    }

    /// Returns the URL scheme used when building a connect string.
    pub fn url_scheme(&self) -> &'static str {
        match self {
            Self::Postgresql => "postgres",
            Self::Mysql => "mysql",
            Self::Mssql => "mssql",
            Self::Oracle => "oracle",
            Self::Sqlite => "sqlite",
        }
    }

    /// Trivial statement used for round-trip checks.
    pub fn ping_statement(&self) -> &'static str {
        match self {
            Self::Oracle => "SELECT 1 FROM DUAL",
            _ => "SELECT 1",
        }
    }

    /// Driver options this backend understands in `extra_params`.
    pub fn known_params(&self) -> &'static [&'static str] {
        match self {
            Self::Postgresql => &["sslmode", "sslrootcert", "application_name", "connect_timeout"],
            Self::Mysql => &["charset", "collation", "ssl_mode", "ssl_ca"],
            Self::Mssql => &[
                "trust_server_certificate",
                "encrypt",
                "instance_name",
                "application_name",
                "tds_version",
            ],
            Self::Oracle => &["service_name", "sid"],
            Self::Sqlite => &["timeout", "journal_mode", "create_if_missing", "read_only"],
        }
    }
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BackendKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "postgresql" | "postgres" | "pg" => Ok(Self::Postgresql),
            "mysql" | "mariadb" => Ok(Self::Mysql),
            "mssql" | "sqlserver" => Ok(Self::Mssql),
            "oracle" => Ok(Self::Oracle),
            "sqlite" | "sqlite3" => Ok(Self::Sqlite),
            other => Err(Error::Validation(format!(
                "unsupported backend kind '{}' (expected one of: postgresql, mysql, mssql, oracle, sqlite)",
                other
            ))),
        }
    }
}

// ── Descriptor ────────────────────────────────────────────────

/// Full connection definition with the decrypted password (internal use only).
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionDescriptor {
    pub name: String,
    pub backend_kind: BackendKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub host: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
    pub database: String,
    /// Network backends normally need a password; this marks the exception.
    #[serde(default)]
    pub passwordless: bool,
    #[serde(default)]
    pub extra_params: BTreeMap<String, String>,
}

impl fmt::Debug for ConnectionDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionDescriptor")
            .field("name", &self.name)
            .field("backend_kind", &self.backend_kind)
            .field("host", &self.host)
            .field("port", &self.port)
            .field("username", &self.username)
            .field("password", &self.password.as_ref().map(|_| "********"))
            .field("database", &self.database)
            .field("passwordless", &self.passwordless)
            .field("extra_params", &self.extra_params)
            .finish()
    }
}

impl ConnectionDescriptor {
    /// Descriptor for a network engine; port defaults from the backend kind.
    pub fn network(
        name: impl Into<String>,
        backend_kind: BackendKind,
        host: impl Into<String>,
        database: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            backend_kind,
            host: Some(host.into()),
            port: backend_kind.default_port(),
            username: None,
            password: None,
            database: database.into(),
            passwordless: false,
            extra_params: BTreeMap::new(),
        }
    }

    /// Descriptor for a sqlite file path or [`SQLITE_MEMORY`].
    pub fn sqlite(name: impl Into<String>, database: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            backend_kind: BackendKind::Sqlite,
            host: None,
            port: None,
            username: None,
            password: None,
            database: database.into(),
            passwordless: false,
            extra_params: BTreeMap::new(),
        }
    }

    pub fn with_credentials(mut self, username: impl Into<String>, password: impl Into<String>) -> Self {
        self.username = Some(username.into());
        self.password = Some(password.into());
        self
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.port = Some(port);
        self
    }

    pub fn with_param(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.extra_params.insert(key.into(), value.into());
        self
    }

    pub fn is_in_memory(&self) -> bool {
        self.backend_kind == BackendKind::Sqlite && self.database == SQLITE_MEMORY
    }

    /// Strip fields that do not apply to the backend kind.
    pub fn normalized(mut self) -> Self {
        if !self.backend_kind.is_network() {
            self.host = None;
            self.port = None;
            self.username = None;
            self.password = None;
            self.passwordless = false;
        }
        self
    }

    /// Check the required-field shape for this descriptor's backend kind.
    pub fn validate(&self) -> Result<()> {
        if self.name.trim().is_empty() {
            return Err(Error::Validation("connection name must not be empty".into()));
        }
        if self.database.trim().is_empty() {
            return Err(Error::Validation(format!(
                "'{}': database is required for {}",
                self.name, self.backend_kind
            )));
        }

        if self.backend_kind.is_network() {
            let mut missing = Vec::new();
            if self.host.as_deref().map_or(true, |h| h.trim().is_empty()) {
                missing.push("host");
            }
            if self.port.is_none() {
                missing.push("port");
            }
            let has_password = self.password.as_deref().is_some_and(|p| !p.is_empty());
            if !has_password && !self.passwordless {
                missing.push("password");
            }
            if !missing.is_empty() {
                return Err(Error::Validation(format!(
                    "'{}': {} requires {}",
                    self.name,
                    self.backend_kind,
                    missing.join(", ")
                )));
            }
            if self.port == Some(0) {
                return Err(Error::Validation(format!("'{}': port must be non-zero", self.name)));
            }
        }

        self.validate_params()
    }

    fn validate_params(&self) -> Result<()> {
        let known = self.backend_kind.known_params();
        for key in self.extra_params.keys() {
            if !known.contains(&key.as_str()) {
                warn!(
                    name = %self.name,
                    backend = %self.backend_kind,
                    param = %key,
                    "Unknown driver parameter, it will be ignored"
                );
            }
        }

        let invalid = |key: &str, value: &str, expected: &str| {
            Error::Validation(format!(
                "'{}': invalid {} '{}' for {} (expected {})",
                self.name, key, value, self.backend_kind, expected
            ))
        };

        for (key, value) in &self.extra_params {
            let (key, value) = (key.as_str(), value.as_str());
            match (self.backend_kind, key) {
                (BackendKind::Postgresql, "sslmode") => {
                    const MODES: &[&str] =
                        &["disable", "allow", "prefer", "require", "verify-ca", "verify-full"];
                    if !MODES.contains(&value) {
                        return Err(invalid(key, value, &MODES.join("|")));
                    }
                }
                (BackendKind::Postgresql, "connect_timeout") => {
                    if value.parse::<u64>().is_err() {
                        return Err(invalid(key, value, "integer seconds"));
                    }
                }
                (BackendKind::Mysql, "ssl_mode") => {
                    const MODES: &[&str] =
                        &["disabled", "preferred", "required", "verify_ca", "verify_identity"];
                    if !MODES.contains(&value.to_lowercase().as_str()) {
                        return Err(invalid(key, value, &MODES.join("|")));
                    }
                }
                // The driver always speaks TDS 7.3; anything else cannot be honoured.
                (BackendKind::Mssql, "tds_version") => {
                    if value != MSSQL_TDS_VERSION {
                        return Err(invalid(key, value, MSSQL_TDS_VERSION));
                    }
                }
                (BackendKind::Mssql, "trust_server_certificate" | "encrypt")
                | (BackendKind::Sqlite, "create_if_missing" | "read_only") => {
                    if parse_bool(value).is_none() {
                        return Err(invalid(key, value, "true|false"));
                    }
                }
                (BackendKind::Sqlite, "timeout") => {
                    if value.parse::<f64>().map_or(true, |t| !t.is_finite() || t < 0.0) {
                        return Err(invalid(key, value, "non-negative seconds"));
                    }
                }
                (BackendKind::Sqlite, "journal_mode") => {
                    const MODES: &[&str] = &["delete", "truncate", "persist", "memory", "wal", "off"];
                    if !MODES.contains(&value.to_lowercase().as_str()) {
                        return Err(invalid(key, value, &MODES.join("|")));
                    }
                }
                _ => {}
            }
        }
        Ok(())
    }

    /// Metadata-only view for listings.
    pub fn summary(&self) -> ConnectionSummary {
        ConnectionSummary {
            name: self.name.clone(),
            backend_kind: self.backend_kind,
            host: self.host.clone(),
            database: self.database.clone(),
        }
    }

    /// Safe view with the password removed.
    pub fn info(&self, is_open: bool) -> ConnectionInfo {
        ConnectionInfo {
            name: self.name.clone(),
            backend_kind: self.backend_kind,
            host: self.host.clone(),
            port: self.port,
            username: self.username.clone(),
            database: self.database.clone(),
            passwordless: self.passwordless,
            extra_params: self.extra_params.clone(),
            is_open,
        }
    }
}

/// Parse the boolean spellings accepted in `extra_params`.
pub fn parse_bool(value: &str) -> Option<bool> {
    match value.trim().to_lowercase().as_str() {
        "true" | "yes" | "1" | "on" => Some(true),
        "false" | "no" | "0" | "off" => Some(false),
        _ => None,
    }
}

// ── Views ─────────────────────────────────────────────────────

/// One row of `list_connections`: plaintext metadata only.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ConnectionSummary {
    pub name: String,
    pub backend_kind: BackendKind,
    pub host: Option<String>,
    pub database: String,
}

/// Descriptor without the password, plus whether a pool is currently open.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ConnectionInfo {
    pub name: String,
    pub backend_kind: BackendKind,
    pub host: Option<String>,
    pub port: Option<u16>,
    pub username: Option<String>,
    pub database: String,
    pub passwordless: bool,
    pub extra_params: BTreeMap<String, String>,
    pub is_open: bool,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;

    fn pg() -> ConnectionDescriptor {
        ConnectionDescriptor::network("y", BackendKind::Postgresql, "db.internal", "d")
            .with_credentials("app", "s3cret")
    }

    #[test]
    fn test_network_requires_host() {
        let mut d = pg();
        d.host = None;
        let err = d.validate().unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Validation);
        assert!(err.to_string().contains("host"));
    }

    #[test]
    fn test_network_requires_password_unless_passwordless() {
        let mut d = pg();
        d.password = Some(String::new());
        assert_eq!(d.validate().unwrap_err().kind(), ErrorKind::Validation);

        d.passwordless = true;
        d.validate().unwrap();
    }

    #[test]
    fn test_sqlite_memory_needs_only_database() {
        let d = ConnectionDescriptor::sqlite("z", SQLITE_MEMORY);
        d.validate().unwrap();
        assert!(d.is_in_memory());
    }

    #[test]
    fn test_normalized_strips_network_fields_for_sqlite() {
        let mut d = ConnectionDescriptor::sqlite("z", "/tmp/app.db");
        d.host = Some("ignored".into());
        d.port = Some(1);
        d.password = Some("ignored".into());
        let d = d.normalized();
        assert!(d.host.is_none() && d.port.is_none() && d.password.is_none());
    }

    #[test]
    fn test_param_validation() {
        let d = pg().with_param("sslmode", "sometimes");
        assert_eq!(d.validate().unwrap_err().kind(), ErrorKind::Validation);

        let d = pg().with_param("sslmode", "require").with_param("whatever", "x");
        d.validate().unwrap();

        let d = ConnectionDescriptor::sqlite("z", SQLITE_MEMORY).with_param("timeout", "-1");
        assert!(d.validate().is_err());
    }

    #[test]
    fn test_sqlite_timeout_must_be_finite() {
        for bad in ["NaN", "inf", "-inf", "infinity"] {
            let d = ConnectionDescriptor::sqlite("z", SQLITE_MEMORY).with_param("timeout", bad);
            assert_eq!(d.validate().unwrap_err().kind(), ErrorKind::Validation, "{}", bad);
        }
        ConnectionDescriptor::sqlite("z", SQLITE_MEMORY)
            .with_param("timeout", "2.5")
            .validate()
            .unwrap();
    }

    #[test]
    fn test_tds_version_limited_to_driver_version() {
        let mssql = || {
            ConnectionDescriptor::network("m", BackendKind::Mssql, "db", "app")
                .with_credentials("sa", "pw")
        };
        mssql().with_param("tds_version", "7.3").validate().unwrap();
        for other in ["7.0", "7.4", "8.0", "nine"] {
            let err = mssql().with_param("tds_version", other).validate().unwrap_err();
            assert_eq!(err.kind(), ErrorKind::Validation, "{}", other);
        }
    }

    #[test]
    fn test_debug_redacts_password() {
        let rendered = format!("{:?}", pg());
        assert!(!rendered.contains("s3cret"));
        assert!(rendered.contains("********"));
    }

    #[test]
    fn test_backend_kind_parsing() {
        assert_eq!("Postgres".parse::<BackendKind>().unwrap(), BackendKind::Postgresql);
        assert_eq!("sqlserver".parse::<BackendKind>().unwrap(), BackendKind::Mssql);
        assert!("db2".parse::<BackendKind>().is_err());
        assert_eq!(BackendKind::Oracle.default_port(), Some(1521));
        assert_eq!(BackendKind::Sqlite.default_port(), None);
    }
}
