mod cli;
mod commands;
mod logging;
mod output;
mod shell;
mod terminal;

use std::process::ExitCode;

use anyhow::Context;
use clap::Parser;
use tracing::{debug, error};

use dbconn_core::Settings;
use dbconn_registry::ConnectionRegistry;

use crate::cli::CliArgs;
use crate::terminal::Terminal;

/// Short kind label for `error[<kind>]`: the core error kind when the chain
/// carries one, `io` for bare filesystem failures, else `cli`.
pub(crate) fn error_kind(err: &anyhow::Error) -> &'static str {
    for cause in err.chain() {
        if let Some(e) = cause.downcast_ref::<dbconn_core::Error>() {
            return e.kind().as_str();
        }
    }
    if err.chain().any(|c| c.is::<std::io::Error>()) {
        return "io";
    }
    "cli"
}

fn report(terminal: &Terminal, err: &anyhow::Error) {
    error!(error = %format!("{:#}", err), "Command failed");
    let kind = error_kind(err);
    if terminal.print_error(kind, &format!("{:#}", err)).is_err() {
        eprintln!("error[{}]: {:#}", kind, err);
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    dbconn_core::config::load_dotenv();

    let args = match CliArgs::try_parse() {
        Ok(args) => args,
        Err(e) => {
            let _ = e.print();
            return if e.use_stderr() {
                ExitCode::FAILURE
            } else {
                ExitCode::SUCCESS
            };
        }
    };
    let terminal = Terminal::new();

    let settings = match Settings::load(args.config_dir.as_deref()).context("loading settings") {
        Ok(settings) => settings,
        Err(e) => {
            report(&terminal, &e);
            return ExitCode::FAILURE;
        }
    };
    let _log_guard = logging::init(&settings, args.verbose);
    settings.log_summary();

    let registry = match ConnectionRegistry::open(settings).context("opening config store") {
        Ok(registry) => registry,
        Err(e) => {
            report(&terminal, &e);
            return ExitCode::FAILURE;
        }
    };
    debug!(?registry, "Registry ready");

    let result = commands::run(&registry, &terminal, args.command).await;
    registry.close_all_connections().await;

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            report(&terminal, &e);
            ExitCode::FAILURE
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_kind_from_chain() {
        let err = anyhow::Error::new(dbconn_core::Error::NotFound("x".into())).context("show");
        assert_eq!(error_kind(&err), "not_found");

        let wrapped = dbconn_core::Error::Validation("bad".into()).with_context("add_connection", "x");
        assert_eq!(error_kind(&anyhow::Error::new(wrapped)), "validation");

        let io = anyhow::Error::new(std::io::Error::new(std::io::ErrorKind::NotFound, "gone"));
        assert_eq!(error_kind(&io), "io");
        assert_eq!(error_kind(&anyhow::anyhow!("plain")), "cli");
    }
}
