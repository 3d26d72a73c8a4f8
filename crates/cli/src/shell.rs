//! Interactive SQL shell bound to one connection.

use anyhow::Result;
use tokio::sync::mpsc;
use tracing::{debug, info};

use dbconn_core::sql::{classify_statement, split_statements, StatementKind};
use dbconn_registry::ConnectionRegistry;

use crate::output::{render, OutputFormat};
use crate::terminal::Terminal;

const HELP: &str = "\
Shell commands:
  help           show this help
  exit, quit     leave the shell

Statements end with ';' (or an empty line). Reads (SELECT, WITH, SHOW,
DESCRIBE, EXPLAIN, PRAGMA, VALUES, TABLE) print rows; anything else prints
the affected row count.";

/// What one line of input means for the statement buffer.
#[derive(Debug, PartialEq, Eq)]
enum Input {
    Exit,
    Help,
    /// Buffered text forms at least one complete statement.
    Ready(String),
    /// Keep reading.
    Pending,
}

#[derive(Debug, Default)]
struct LineBuffer {
    text: String,
}

impl LineBuffer {
    fn is_empty(&self) -> bool {
        self.text.trim().is_empty()
    }

    fn push(&mut self, line: &str) -> Input {
        let trimmed = line.trim();
        if self.is_empty() {
            match trimmed.to_lowercase().as_str() {
                "exit" | "quit" | "\\q" => return Input::Exit,
                "help" | "\\?" => return Input::Help,
                "" => return Input::Pending,
                _ => {}
            }
        }

        if trimmed.is_empty() || trimmed.ends_with(';') {
            if !trimmed.is_empty() {
                self.text.push_str(line);
                self.text.push('\n');
            }
            return Input::Ready(std::mem::take(&mut self.text));
        }
        self.text.push_str(line);
        self.text.push('\n');
        Input::Pending
    }
}

/// Stdin is read on a plain thread so a pending read never holds up runtime shutdown.
fn spawn_reader() -> mpsc::UnboundedReceiver<String> {
    let (tx, rx) = mpsc::unbounded_channel();
    std::thread::spawn(move || {
        let stdin = std::io::stdin();
        let mut line = String::new();
        loop {
            line.clear();
            match stdin.read_line(&mut line) {
                Ok(0) | Err(_) => break,
                Ok(_) => {
                    if tx.send(line.trim_end_matches(['\n', '\r']).to_string()).is_err() {
                        break;
                    }
                }
            }
        }
    });
    rx
}

async fn run_statement(
    registry: &ConnectionRegistry,
    terminal: &Terminal,
    name: &str,
    statement: &str,
) -> Result<()> {
    match classify_statement(statement) {
        StatementKind::Query => {
            let rows = registry.execute_query(name, statement, &[]).await?;
            terminal.print_output(&render(&rows, OutputFormat::Table)?)?;
        }
        StatementKind::Command => {
            let affected = registry.execute_command(name, statement, &[]).await?;
            terminal.print_info(&format!("{} row(s) affected", affected))?;
        }
    }
    Ok(())
}

pub async fn run(registry: &ConnectionRegistry, terminal: &Terminal, name: &str) -> Result<()> {
    let info = registry.connection_info(name)?;
    registry.get_connection(name).await?;
    terminal.print_banner(name, info.backend_kind)?;
    info!(name, "Shell started");

    let mut lines = spawn_reader();
    let mut buffer = LineBuffer::default();

    loop {
        terminal.print_prompt(name, !buffer.is_empty())?;
        let line = tokio::select! {
            line = lines.recv() => line,
            _ = tokio::signal::ctrl_c() => {
                println!();
                break;
            }
        };
        let Some(line) = line else {
            println!();
            break;
        };

        let script = match buffer.push(&line) {
            Input::Exit => break,
            Input::Help => {
                terminal.print_info(HELP)?;
                continue;
            }
            Input::Pending => continue,
            Input::Ready(script) => script,
        };

        for statement in split_statements(&script) {
            terminal.reset_cancel();
            debug!(name, "Shell statement");
            tokio::select! {
                result = run_statement(registry, terminal, name, &statement) => {
                    if let Err(e) = result {
                        let kind = crate::error_kind(&e);
                        terminal.print_error(kind, &format!("{:#}", e))?;
                    }
                }
                _ = tokio::signal::ctrl_c() => {
                    terminal.cancel();
                }
            }
            if terminal.is_cancelled() {
                terminal.print_warning("statement cancelled")?;
                break;
            }
        }
    }

    let closed = registry.close_all_connections().await;
    info!(name, closed, "Shell exited");
    terminal.print_info("Goodbye.")?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_meta_commands_only_at_statement_start() {
        let mut buffer = LineBuffer::default();
        assert_eq!(buffer.push("  QUIT "), Input::Exit);
        assert_eq!(buffer.push("help"), Input::Help);
        assert_eq!(buffer.push("SELECT name"), Input::Pending);
        assert_eq!(buffer.push("exit"), Input::Pending);
        assert_eq!(
            buffer.push("FROM t;"),
            Input::Ready("SELECT name\nexit\nFROM t;\n".into())
        );
        assert!(buffer.is_empty());
    }

    #[test]
    fn test_blank_line_flushes_buffer() {
        let mut buffer = LineBuffer::default();
        assert_eq!(buffer.push(""), Input::Pending);
        assert_eq!(buffer.push("DELETE FROM t"), Input::Pending);
        assert_eq!(buffer.push(""), Input::Ready("DELETE FROM t\n".into()));
    }
}
