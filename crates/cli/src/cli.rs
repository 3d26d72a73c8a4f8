use std::path::PathBuf;

use clap::{ArgAction, Args, Parser, Subcommand};

use dbconn_core::{BackendKind, ConnectionDescriptor};

use crate::output::OutputFormat;

/// Manage named database connections with credentials encrypted at rest.
#[derive(Parser, Debug)]
#[command(name = "dbconn", version, about = "Encrypted database connection manager")]
pub struct CliArgs {
    /// Configuration root (default: $DBCONN_CONFIG_DIR or <config dir>/db_connector)
    #[arg(long, global = true, env = "DBCONN_CONFIG_DIR")]
    pub config_dir: Option<PathBuf>,

    /// Raise stderr log verbosity (-v info, -vv debug); RUST_LOG takes precedence
    #[arg(short, long, global = true, action = ArgAction::Count)]
    pub verbose: u8,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Add a connection, or overwrite one that is not open
    Add {
        name: String,
        /// postgresql, mysql, mssql, oracle or sqlite
        #[arg(long = "type", value_name = "KIND")]
        kind: BackendKind,
        #[command(flatten)]
        fields: DescriptorArgs,
    },
    /// Change fields of an existing connection
    Update {
        name: String,
        #[arg(long = "type", value_name = "KIND")]
        kind: Option<BackendKind>,
        #[command(flatten)]
        fields: DescriptorArgs,
    },
    /// Delete a connection
    Remove { name: String },
    /// List configured connections
    List,
    /// Show one connection without its password
    Show { name: String },
    /// Connect once and run a trivial round-trip
    Test { name: String },
    /// Run a read statement and print the rows
    Query {
        name: String,
        sql: String,
        /// Positional parameter; JSON literals keep their type
        #[arg(long = "param", value_name = "VALUE")]
        params: Vec<String>,
        #[command(flatten)]
        output: OutputArgs,
    },
    /// Run a write statement and print the affected row count
    Execute {
        name: String,
        sql: String,
        #[arg(long = "param", value_name = "VALUE")]
        params: Vec<String>,
    },
    /// Run every statement in a SQL file
    Run {
        name: String,
        file: PathBuf,
        /// Keep going after a failed statement
        #[arg(long)]
        continue_on_error: bool,
        #[command(flatten)]
        output: OutputArgs,
    },
    /// Interactive SQL shell
    Shell { name: String },
    /// Config store and encryption status
    Info,
    /// Copy the connection file to a timestamped backup
    Backup,
    /// Write all connections to JSON with passwords masked
    Export { file: PathBuf },
    /// Add every connection from a JSON file
    Import { file: PathBuf },
}

#[derive(Args, Debug, Default)]
pub struct DescriptorArgs {
    #[arg(long)]
    pub host: Option<String>,
    #[arg(long)]
    pub port: Option<u16>,
    #[arg(long)]
    pub username: Option<String>,
    #[arg(long)]
    pub password: Option<String>,
    /// Database name, or file path / :memory: for sqlite
    #[arg(long)]
    pub database: Option<String>,
    /// Allow a network connection without a password
    #[arg(long)]
    pub passwordless: bool,
    /// Driver option, repeatable
    #[arg(long = "param", value_name = "KEY=VALUE", value_parser = parse_key_value)]
    pub params: Vec<(String, String)>,
}

#[derive(Args, Debug, Default)]
pub struct OutputArgs {
    #[arg(long, value_enum, default_value_t = OutputFormat::Table)]
    pub format: OutputFormat,
    /// Write results to this file instead of stdout
    #[arg(long)]
    pub output: Option<PathBuf>,
}

fn parse_key_value(raw: &str) -> Result<(String, String), String> {
    let (key, value) = raw
        .split_once('=')
        .ok_or_else(|| format!("expected KEY=VALUE, got '{}'", raw))?;
    let key = key.trim();
    if key.is_empty() {
        return Err(format!("empty key in '{}'", raw));
    }
    Ok((key.to_string(), value.trim().to_string()))
}

impl DescriptorArgs {
    /// Fresh descriptor for `add`; the port defaults from the kind.
    pub fn into_descriptor(self, name: &str, kind: BackendKind) -> ConnectionDescriptor {
        let base = ConnectionDescriptor {
            name: name.to_string(),
            backend_kind: kind,
            host: None,
            port: kind.default_port(),
            username: None,
            password: None,
            database: String::new(),
            passwordless: false,
            extra_params: Default::default(),
        };
        self.merge_into(base)
    }

    /// Overlay the flags that were given onto `descriptor`.
    pub fn merge_into(self, mut descriptor: ConnectionDescriptor) -> ConnectionDescriptor {
        if let Some(host) = self.host {
            descriptor.host = Some(host);
        }
        if let Some(port) = self.port {
            descriptor.port = Some(port);
        }
        if let Some(username) = self.username {
            descriptor.username = Some(username);
        }
        if let Some(password) = self.password {
            descriptor.password = Some(password);
        }
        if let Some(database) = self.database {
            descriptor.database = database;
        }
        if self.passwordless {
            descriptor.passwordless = true;
        }
        descriptor.extra_params.extend(self.params);
        descriptor
    }
}

/// Switch an existing descriptor to another kind, re-defaulting the port
/// unless one was given explicitly.
pub fn retype(mut descriptor: ConnectionDescriptor, kind: BackendKind, port_given: bool) -> ConnectionDescriptor {
    if descriptor.backend_kind != kind {
        descriptor.backend_kind = kind;
        if !port_given {
            descriptor.port = kind.default_port();
        }
    }
    descriptor
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_add_parses_params_and_defaults_port() {
        let args = CliArgs::try_parse_from([
            "dbconn", "add", "prod", "--type", "postgres", "--host", "db", "--username", "app",
            "--password", "pw", "--database", "sales", "--param", "sslmode=require",
        ])
        .unwrap();
        let Command::Add { name, kind, fields } = args.command else {
            panic!("expected add");
        };
        let d = fields.into_descriptor(&name, kind);
        assert_eq!(d.backend_kind, BackendKind::Postgresql);
        assert_eq!(d.port, Some(5432));
        assert_eq!(d.extra_params.get("sslmode").map(String::as_str), Some("require"));
        d.validate().unwrap();
    }

    #[test]
    fn test_bad_param_rejected() {
        let err = CliArgs::try_parse_from(["dbconn", "add", "x", "--type", "sqlite", "--param", "novalue"])
            .unwrap_err();
        assert!(err.to_string().contains("KEY=VALUE"));
    }

    #[test]
    fn test_unknown_kind_rejected() {
        assert!(CliArgs::try_parse_from(["dbconn", "add", "x", "--type", "db2"]).is_err());
    }

    #[test]
    fn test_update_merges_only_given_fields() {
        let stored = ConnectionDescriptor::network("x", BackendKind::Mysql, "old", "shop")
            .with_credentials("root", "pw");
        let fields = DescriptorArgs {
            host: Some("new".into()),
            params: vec![("ssl_mode".into(), "required".into())],
            ..DescriptorArgs::default()
        };
        let merged = fields.merge_into(stored);
        assert_eq!(merged.host.as_deref(), Some("new"));
        assert_eq!(merged.password.as_deref(), Some("pw"));
        assert_eq!(merged.database, "shop");

        let retyped = retype(merged, BackendKind::Postgresql, false);
        assert_eq!(retyped.port, Some(5432));
    }

    #[test]
    fn test_query_params_and_format() {
        let args = CliArgs::try_parse_from([
            "dbconn", "query", "cache", "SELECT ?", "--param", "42", "--format", "json",
        ])
        .unwrap();
        let Command::Query { params, output, .. } = args.command else {
            panic!("expected query");
        };
        assert_eq!(params, vec!["42"]);
        assert_eq!(output.format, OutputFormat::Json);
    }
}
