//! One handler per subcommand. Every handler returns `Err` on failure so
//! `main` can report it and exit non-zero.

use std::collections::BTreeMap;
use std::path::Path;

use anyhow::{bail, Context, Result};
use serde_json::{json, Value};
use tracing::{info, warn};

use dbconn_backend::{parse_param, Row};
use dbconn_core::sql::{classify_statement, split_statements, truncate_statement, StatementKind};
use dbconn_core::ConnectionDescriptor;
use dbconn_registry::ConnectionRegistry;

use crate::cli::{retype, Command, OutputArgs};
use crate::output::{render, save};
use crate::shell;
use crate::terminal::Terminal;

/// Placeholder written instead of passwords on export.
const MASKED_PASSWORD: &str = "***";

pub async fn run(registry: &ConnectionRegistry, terminal: &Terminal, command: Command) -> Result<()> {
    match command {
        Command::Add { name, kind, fields } => {
            let descriptor = fields.into_descriptor(&name, kind);
            registry.add_connection(&name, descriptor.clone()).await?;
            terminal.print_success(&format!("Connection '{}' added ({})", name, kind))?;
            print_params(terminal, &descriptor)?;
        }
        Command::Update { name, kind, fields } => {
            let port_given = fields.port.is_some();
            let descriptor = registry
                .amend_connection(&name, move |stored| {
                    let merged = fields.merge_into(stored);
                    match kind {
                        Some(kind) => retype(merged, kind, port_given),
                        None => merged,
                    }
                })
                .await?;
            terminal.print_success(&format!("Connection '{}' updated", name))?;
            print_params(terminal, &descriptor)?;
        }
        Command::Remove { name } => {
            registry.remove_connection(&name).await?;
            terminal.print_success(&format!("Connection '{}' removed", name))?;
        }
        Command::List => list(registry, terminal)?,
        Command::Show { name } => show(registry, terminal, &name)?,
        Command::Test { name } => {
            registry.test_connection(&name).await?;
            terminal.print_success(&format!("Connection '{}' OK", name))?;
        }
        Command::Query {
            name,
            sql,
            params,
            output,
        } => {
            let params: Vec<Value> = params.iter().map(|p| parse_param(p)).collect();
            let rows = registry.execute_query(&name, &sql, &params).await?;
            emit(terminal, &rows, &output)?;
        }
        Command::Execute { name, sql, params } => {
            let params: Vec<Value> = params.iter().map(|p| parse_param(p)).collect();
            let affected = registry.execute_command(&name, &sql, &params).await?;
            terminal.print_success(&format!("{} row(s) affected", affected))?;
        }
        Command::Run {
            name,
            file,
            continue_on_error,
            output,
        } => run_file(registry, terminal, &name, &file, continue_on_error, &output).await?,
        Command::Shell { name } => shell::run(registry, terminal, &name).await?,
        Command::Info => store_info(registry, terminal)?,
        Command::Backup => {
            let path = registry.store().backup()?;
            terminal.print_success(&format!("Backup written to {}", path.display()))?;
        }
        Command::Export { file } => export(registry, terminal, &file)?,
        Command::Import { file } => import(registry, terminal, &file).await?,
    }
    Ok(())
}

fn print_params(terminal: &Terminal, descriptor: &ConnectionDescriptor) -> Result<()> {
    if !descriptor.extra_params.is_empty() {
        let keys: Vec<&str> = descriptor.extra_params.keys().map(String::as_str).collect();
        terminal.print_info(&format!("Driver params: {}", keys.join(", ")))?;
    }
    Ok(())
}

fn emit(terminal: &Terminal, rows: &[Row], output: &OutputArgs) -> Result<()> {
    let text = render(rows, output.format)?;
    match &output.output {
        Some(path) => {
            save(&text, path)?;
            terminal.print_success(&format!("{} row(s) written to {}", rows.len(), path.display()))?;
        }
        None => terminal.print_output(&text)?,
    }
    Ok(())
}

fn list(registry: &ConnectionRegistry, terminal: &Terminal) -> Result<()> {
    let summaries = registry.list_connections()?;
    if summaries.is_empty() {
        terminal.print_info("No connections configured")?;
        return Ok(());
    }
    let rows: Vec<Row> = summaries
        .into_iter()
        .map(|s| {
            let mut row = Row::new();
            row.insert("name".into(), json!(s.name));
            row.insert("type".into(), json!(s.backend_kind.as_str()));
            row.insert("host".into(), json!(s.host.unwrap_or_else(|| "-".into())));
            row.insert("database".into(), json!(s.database));
            row
        })
        .collect();
    terminal.print_output(&crate::output::render_table(&rows))
}

fn show(registry: &ConnectionRegistry, terminal: &Terminal, name: &str) -> Result<()> {
    let info = registry.connection_info(name)?;
    let mut fields = vec![
        ("type", info.backend_kind.to_string()),
        ("database", info.database.clone()),
    ];
    if let Some(host) = &info.host {
        fields.push(("host", host.clone()));
    }
    if let Some(port) = info.port {
        fields.push(("port", port.to_string()));
    }
    if let Some(username) = &info.username {
        fields.push(("username", username.clone()));
    }
    if info.backend_kind.is_network() {
        let password = if info.passwordless { "(none)" } else { MASKED_PASSWORD };
        fields.push(("password", password.to_string()));
    }
    for (key, value) in &info.extra_params {
        fields.push((key.as_str(), value.clone()));
    }
    fields.push(("open", info.is_open.to_string()));
    terminal.print_fields(&format!("Connection '{}'", info.name), &fields)
}

enum Outcome {
    Rows(Vec<Row>),
    Affected(u64),
}

async fn run_file(
    registry: &ConnectionRegistry,
    terminal: &Terminal,
    name: &str,
    file: &Path,
    continue_on_error: bool,
    output: &OutputArgs,
) -> Result<()> {
    let script = std::fs::read_to_string(file)
        .with_context(|| format!("reading SQL file {}", file.display()))?;
    let statements = split_statements(&script);
    if statements.is_empty() {
        terminal.print_info("No statements found")?;
        return Ok(());
    }

    let total = statements.len();
    let mut collected = String::new();
    let (mut ok, mut failed) = (0usize, 0usize);

    for (i, statement) in statements.iter().enumerate() {
        terminal.print_info(&format!("[{}/{}] {}", i + 1, total, truncate_statement(statement, 50)))?;
        let result = match classify_statement(statement) {
            StatementKind::Query => registry
                .execute_query(name, statement, &[])
                .await
                .map(Outcome::Rows),
            StatementKind::Command => registry
                .execute_command(name, statement, &[])
                .await
                .map(Outcome::Affected),
        };

        match result {
            Ok(Outcome::Rows(rows)) => {
                let text = render(&rows, output.format)?;
                if output.output.is_some() {
                    collected.push_str(&text);
                } else {
                    terminal.print_output(&text)?;
                }
                ok += 1;
            }
            Ok(Outcome::Affected(affected)) => {
                terminal.print_success(&format!("{} row(s) affected", affected))?;
                ok += 1;
            }
            Err(e) if continue_on_error => {
                failed += 1;
                warn!(name, statement = i + 1, error = %e, "Statement failed, continuing");
                terminal.print_error(e.kind().as_str(), &e.to_string())?;
            }
            Err(e) => {
                return Err(e).with_context(|| format!("statement {}/{}", i + 1, total));
            }
        }
    }

    if let Some(path) = &output.output {
        save(&collected, path)?;
        terminal.print_info(&format!("Results written to {}", path.display()))?;
    }
    terminal.print_info(&format!("Done: {} succeeded, {} failed", ok, failed))?;
    info!(name, ok, failed, file = %file.display(), "SQL file executed");
    if failed > 0 {
        bail!("{} of {} statements failed", failed, total);
    }
    Ok(())
}

fn store_info(registry: &ConnectionRegistry, terminal: &Terminal) -> Result<()> {
    let store = registry.store();
    let info = store.info()?;
    let settings = registry.settings();
    let timestamp = |t: Option<chrono::DateTime<chrono::Utc>>| {
        t.map(|t| t.to_rfc3339()).unwrap_or_else(|| "-".into())
    };

    let fields = vec![
        ("config file", info.path.display().to_string()),
        ("exists", info.exists.to_string()),
        ("version", info.version.clone()),
        ("app", info.app_name.clone()),
        ("created", timestamp(info.created)),
        ("last modified", timestamp(info.last_modified)),
        ("connections", info.connection_count.to_string()),
        ("backups", format!("{} (keeping {})", info.backup_count, settings.max_backups)),
        ("key source", store.cipher().source().to_string()),
        (
            "encryption",
            if store.cipher().verify() { "ok" } else { "FAILED" }.to_string(),
        ),
        ("log file", settings.log_dir().join("dbconn.log").display().to_string()),
    ];
    terminal.print_fields("Config store", &fields)
}

fn export(registry: &ConnectionRegistry, terminal: &Terminal, file: &Path) -> Result<()> {
    let connections = registry.store().load()?;
    let masked: BTreeMap<String, ConnectionDescriptor> = connections
        .into_iter()
        .map(|(name, mut d)| {
            if d.password.is_some() {
                d.password = Some(MASKED_PASSWORD.to_string());
            }
            (name, d)
        })
        .collect();

    let text = serde_json::to_string_pretty(&masked).context("serializing connections")?;
    save(&text, file)?;
    info!(count = masked.len(), file = %file.display(), "Connections exported");
    terminal.print_success(&format!(
        "{} connection(s) exported to {} (passwords masked)",
        masked.len(),
        file.display()
    ))
}

/// Parse `{ name: descriptor }`. Entries may omit `name`; a masked password
/// counts as absent.
fn parse_import(text: &str) -> Result<Vec<(String, serde_json::Result<ConnectionDescriptor>)>> {
    let entries: BTreeMap<String, Value> =
        serde_json::from_str(text).context("import file must be a JSON object of connections")?;
    Ok(entries
        .into_iter()
        .map(|(name, mut value)| {
            if let Some(obj) = value.as_object_mut() {
                obj.entry("name").or_insert_with(|| json!(name));
                if obj.get("password").and_then(Value::as_str) == Some(MASKED_PASSWORD) {
                    obj.remove("password");
                }
            }
            let parsed = serde_json::from_value::<ConnectionDescriptor>(value);
            (name, parsed)
        })
        .collect())
}

async fn import(registry: &ConnectionRegistry, terminal: &Terminal, file: &Path) -> Result<()> {
    let text = std::fs::read_to_string(file)
        .with_context(|| format!("reading import file {}", file.display()))?;
    let entries = parse_import(&text)?;

    let (mut imported, mut failed) = (0usize, 0usize);
    for (name, parsed) in entries {
        let outcome = match parsed {
            Ok(descriptor) => registry
                .add_connection(&name, descriptor)
                .await
                .map_err(|e| format!("{} [{}]", e, e.kind())),
            Err(e) => Err(format!("malformed entry: {}", e)),
        };
        match outcome {
            Ok(()) => {
                imported += 1;
                terminal.print_success(&format!("Imported '{}'", name))?;
            }
            Err(detail) => {
                failed += 1;
                warn!(name = %name, detail = %detail, "Import entry skipped");
                terminal.print_warning(&format!("skipped '{}': {}", name, detail))?;
            }
        }
    }

    info!(imported, failed, file = %file.display(), "Import finished");
    terminal.print_info(&format!("Import finished: {} imported, {} failed", imported, failed))?;
    if failed > 0 {
        bail!("{} of {} import entries failed", failed, imported + failed);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use dbconn_core::BackendKind;

    #[test]
    fn test_parse_import_fills_name_and_drops_masked_password() {
        let text = r#"{
            "cache": { "backend_kind": "sqlite", "database": ":memory:" },
            "prod": {
                "backend_kind": "postgresql", "host": "db", "port": 5432,
                "username": "app", "password": "***", "database": "sales"
            },
            "broken": { "backend_kind": "db2", "database": "x" }
        }"#;
        let entries = parse_import(text).unwrap();
        assert_eq!(entries.len(), 3);

        let (name, broken) = &entries[0];
        assert_eq!(name, "broken");
        assert!(broken.is_err());

        let cache = entries[1].1.as_ref().unwrap();
        assert_eq!(cache.name, "cache");
        assert_eq!(cache.backend_kind, BackendKind::Sqlite);

        let prod = entries[2].1.as_ref().unwrap();
        assert_eq!(prod.password, None);
        assert!(prod.validate().is_err());
    }

    #[test]
    fn test_parse_import_rejects_non_object() {
        assert!(parse_import("[1, 2]").is_err());
    }
}
