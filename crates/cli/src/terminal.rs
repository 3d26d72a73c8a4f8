use anyhow::Result;
use crossterm::{
    execute,
    style::{Color, Print, ResetColor, SetForegroundColor},
};
use std::io::{self, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use dbconn_core::BackendKind;

/// Color scheme for terminal output.
struct Colors;

impl Colors {
    const PROMPT: Color = Color::Green;
    const SUCCESS: Color = Color::Green;
    const WARNING: Color = Color::Yellow;
    const ERROR: Color = Color::Red;
    const DIM: Color = Color::DarkGrey;
    const HEADER: Color = Color::Magenta;
}

/// Terminal I/O for one-shot commands and the interactive shell.
pub struct Terminal {
    /// Set when Ctrl+C interrupts the running statement.
    cancelled: Arc<AtomicBool>,
}

impl Terminal {
    pub fn new() -> Self {
        Self {
            cancelled: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    pub fn reset_cancel(&self) {
        self.cancelled.store(false, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    /// Shell startup banner.
    pub fn print_banner(&self, name: &str, kind: BackendKind) -> Result<()> {
        let mut stdout = io::stdout();
        execute!(
            stdout,
            SetForegroundColor(Colors::HEADER),
            Print("dbconn shell"),
            ResetColor,
            Print(format!(" - {} ({})\n", name, kind)),
            SetForegroundColor(Colors::DIM),
            Print("End statements with ';'. Type 'help' for commands, 'exit' to leave.\n"),
            Print("Ctrl+C cancels the running statement, or exits at the prompt.\n"),
            ResetColor,
        )?;
        stdout.flush()?;
        Ok(())
    }

    /// `name> ` for a fresh statement, `   -> ` while one is being continued.
    pub fn print_prompt(&self, name: &str, continuation: bool) -> Result<()> {
        let mut stdout = io::stdout();
        let prompt = if continuation {
            format!("{:>width$}-> ", "", width = name.len().saturating_sub(1))
        } else {
            format!("{}> ", name)
        };
        execute!(
            stdout,
            SetForegroundColor(Colors::PROMPT),
            Print(prompt),
            ResetColor,
        )?;
        stdout.flush()?;
        Ok(())
    }

    /// Plain result text (tables, JSON, CSV) to stdout.
    pub fn print_output(&self, text: &str) -> Result<()> {
        let mut stdout = io::stdout();
        stdout.write_all(text.as_bytes())?;
        if !text.ends_with('\n') {
            stdout.write_all(b"\n")?;
        }
        stdout.flush()?;
        Ok(())
    }

    pub fn print_success(&self, msg: &str) -> Result<()> {
        let mut stdout = io::stdout();
        execute!(
            stdout,
            SetForegroundColor(Colors::SUCCESS),
            Print(format!("{}\n", msg)),
            ResetColor,
        )?;
        stdout.flush()?;
        Ok(())
    }

    pub fn print_info(&self, msg: &str) -> Result<()> {
        let mut stdout = io::stdout();
        execute!(
            stdout,
            SetForegroundColor(Colors::DIM),
            Print(format!("{}\n", msg)),
            ResetColor,
        )?;
        stdout.flush()?;
        Ok(())
    }

    pub fn print_warning(&self, msg: &str) -> Result<()> {
        let mut stderr = io::stderr();
        execute!(
            stderr,
            SetForegroundColor(Colors::WARNING),
            Print(format!("warning: {}\n", msg)),
            ResetColor,
        )?;
        stderr.flush()?;
        Ok(())
    }

    /// `error[<kind>]: <message>` on stderr.
    pub fn print_error(&self, kind: &str, msg: &str) -> Result<()> {
        let mut stderr = io::stderr();
        execute!(
            stderr,
            SetForegroundColor(Colors::ERROR),
            Print(format!("error[{}]", kind)),
            ResetColor,
            Print(format!(": {}\n", msg)),
        )?;
        stderr.flush()?;
        Ok(())
    }

    /// Aligned `key: value` lines under a heading.
    pub fn print_fields(&self, heading: &str, fields: &[(&str, String)]) -> Result<()> {
        let width = fields.iter().map(|(k, _)| k.len()).max().unwrap_or(0);
        let mut stdout = io::stdout();
        execute!(
            stdout,
            SetForegroundColor(Colors::HEADER),
            Print(format!("{}\n", heading)),
            ResetColor,
        )?;
        for (key, value) in fields {
            execute!(
                stdout,
                SetForegroundColor(Colors::DIM),
                Print(format!("  {:<width$}  ", format!("{}:", key), width = width + 1)),
                ResetColor,
                Print(format!("{}\n", value)),
            )?;
        }
        stdout.flush()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_terminal_creation() {
        let term = Terminal::new();
        assert!(!term.is_cancelled());
    }

    #[test]
    fn test_cancel_and_reset() {
        let term = Terminal::new();
        term.cancel();
        assert!(term.is_cancelled());
        term.reset_cancel();
        assert!(!term.is_cancelled());
    }
}
