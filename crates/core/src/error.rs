use std::fmt;
use std::time::Duration;

use thiserror::Error;

use crate::descriptor::BackendKind;

pub type Result<T> = std::result::Result<T, Error>;

/// Every failure the vault, adapters and registry can report.
#[derive(Error, Debug)]
pub enum Error {
    #[error("config corrupt{}: {detail}", tag(.name))]
    ConfigCorrupt {
        name: Option<String>,
        detail: String,
    },

    #[error("integrity check failed{}: ciphertext was tampered with or encrypted under a different key", tag(.name))]
    Integrity { name: Option<String> },

    #[error("connection '{0}' not found")]
    NotFound(String),

    #[error("conflict on '{name}': {detail}")]
    Conflict { name: String, detail: String },

    #[error("{backend} connection error: {detail}")]
    Connection { backend: BackendKind, detail: String },

    #[error("{operation} timed out after {after:?}")]
    Timeout {
        operation: &'static str,
        after: Duration,
    },

    #[error("invalid connection descriptor: {0}")]
    Validation(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{operation} '{name}': {source}")]
    Context {
        name: String,
        operation: &'static str,
        #[source]
        source: Box<Error>,
    },
}

fn tag(name: &Option<String>) -> String {
    match name {
        Some(n) => format!(" for '{}'", n),
        None => String::new(),
    }
}

/// Coarse classification used for exit reporting and tests.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    ConfigCorrupt,
    Integrity,
    NotFound,
    Conflict,
    Connection,
    Timeout,
    Validation,
    Io,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::ConfigCorrupt => "config_corrupt",
            ErrorKind::Integrity => "integrity",
            ErrorKind::NotFound => "not_found",
            ErrorKind::Conflict => "conflict",
            ErrorKind::Connection => "connection",
            ErrorKind::Timeout => "timeout",
            ErrorKind::Validation => "validation",
            ErrorKind::Io => "io",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Error {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::ConfigCorrupt { .. } => ErrorKind::ConfigCorrupt,
            Error::Integrity { .. } => ErrorKind::Integrity,
            Error::NotFound(_) => ErrorKind::NotFound,
            Error::Conflict { .. } => ErrorKind::Conflict,
            Error::Connection { .. } => ErrorKind::Connection,
            Error::Timeout { .. } => ErrorKind::Timeout,
            Error::Validation(_) => ErrorKind::Validation,
            Error::Io(_) => ErrorKind::Io,
            Error::Context { source, .. } => source.kind(),
        }
    }

    pub fn corrupt(detail: impl Into<String>) -> Self {
        Error::ConfigCorrupt {
            name: None,
            detail: detail.into(),
        }
    }

    pub fn connection(backend: BackendKind, detail: impl fmt::Display) -> Self {
        Error::Connection {
            backend,
            detail: detail.to_string(),
        }
    }

    /// Attach a record name to config/integrity errors that do not carry one yet.
    pub fn for_record(self, record: &str) -> Self {
        match self {
            Error::ConfigCorrupt { name: None, detail } => Error::ConfigCorrupt {
                name: Some(record.to_string()),
                detail,
            },
            Error::Integrity { name: None } => Error::Integrity {
                name: Some(record.to_string()),
            },
            other => other,
        }
    }

    /// Wrap with the registry operation and connection name; the kind is preserved.
    pub fn with_context(self, operation: &'static str, name: &str) -> Self {
        Error::Context {
            name: name.to_string(),
            operation,
            source: Box::new(self),
        }
    }

    /// Innermost error, skipping any context layers.
    pub fn root(&self) -> &Error {
        match self {
            Error::Context { source, .. } => source.root(),
            other => other,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn context_preserves_kind() {
        let err = Error::NotFound("x".into()).with_context("get_connection", "x");
        assert_eq!(err.kind(), ErrorKind::NotFound);
        assert!(matches!(err.root(), Error::NotFound(_)));
        assert_eq!(err.to_string(), "get_connection 'x': connection 'x' not found");
    }

    #[test]
    fn for_record_tags_only_untagged_errors() {
        let err = Error::Integrity { name: None }.for_record("prod");
        assert!(matches!(err, Error::Integrity { name: Some(ref n) } if n == "prod"));
        assert!(err.to_string().contains("for 'prod'"));

        let err = Error::corrupt("bad hex").for_record("a").for_record("b");
        assert!(matches!(err, Error::ConfigCorrupt { name: Some(ref n), .. } if n == "a"));
    }
}
