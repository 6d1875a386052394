// src/bin/testbed.rs

use anyhow::{Result, anyhow};
use clap::Parser;
use colored::*;
use std::env;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use testbed::{
    cli::{AppContext, Cli, CliError, handlers},
    constants::INTERRUPTED_EXIT_CODE,
    system::output::LogHandler,
};

// --- Command Definition and Registry ---

/// Defines a command, its aliases, and its synchronous handler function.
struct CommandDefinition {
    name: &'static str,
    aliases: &'static [&'static str],
    handler: fn(Vec<String>, &AppContext) -> Result<()>,
}

/// Every command `testbed` understands. To add a command, add an entry here.
static COMMAND_REGISTRY: &[CommandDefinition] = &[
    CommandDefinition {
        name: "run",
        aliases: &["r"],
        handler: handlers::run::handle,
    },
    CommandDefinition {
        name: "config",
        aliases: &["c"],
        handler: handlers::config::handle,
    },
];

/// Finds a command definition in the registry by its name or alias.
fn find_command(name: &str) -> Option<&'static CommandDefinition> {
    COMMAND_REGISTRY
        .iter()
        .find(|cmd| cmd.name == name || cmd.aliases.contains(&name))
}

/// The main entry point of `testbed`.
/// It sets up logging, parses arguments, dispatches to the correct handler,
/// and performs centralized error handling.
fn main() {
    let cli = Cli::parse();
    let verbosity = cli.verbosity();
    if let Err(e) = LogHandler::install_logger(verbosity) {
        eprintln!("{}: could not install logger: {}", "Warning".yellow(), e);
    }

    let invocation_dir = match env::current_dir() {
        Ok(dir) => dir,
        Err(e) => {
            eprintln!("\n{}: cannot read the current directory: {}", "Error".red().bold(), e);
            std::process::exit(1);
        }
    };
    let context = AppContext {
        verbosity,
        cancellation_token: Arc::new(AtomicBool::new(false)),
        invocation_dir,
    };

    if let Err(e) = run_cli(cli, &context) {
        // --- Centralized Error Handling ---
        let interrupted = context.cancellation_token.load(Ordering::SeqCst)
            || matches!(e.downcast_ref::<CliError>(), Some(CliError::Interrupted));
        if interrupted {
            std::process::exit(INTERRUPTED_EXIT_CODE);
        }
        eprintln!("\n{}: {:#}", "Error".red().bold(), e);
        std::process::exit(1);
    }
}

/// Routes `testbed [command] [args...]` to its handler. Without a command, `run` is assumed.
fn run_cli(cli: Cli, context: &AppContext) -> Result<()> {
    log::debug!("CLI args parsed: {:?}", cli);

    let (command_name, args) = match cli.command {
        Some(name) => (name, cli.args),
        None => ("run".to_string(), Vec::new()),
    };
    let command = find_command(&command_name).ok_or_else(|| {
        anyhow!(
            "Unknown command '{}'. Available commands: {}.",
            command_name.cyan(),
            COMMAND_REGISTRY.iter().map(|c| c.name).collect::<Vec<_>>().join(", ")
        )
    })?;
    (command.handler)(args, context)
}
