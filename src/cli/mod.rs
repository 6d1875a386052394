// src/cli/mod.rs

//! Command-line surface: the top-level parser, the per-command argument structs and the
//! handlers the binary dispatches to.

use crate::CancellationToken;
use crate::constants::DEFAULT_VERBOSITY;
use clap::{ArgAction, Parser};
use std::path::PathBuf;
use thiserror::Error;

pub mod args;
pub mod handlers;

/// Errors a handler raises to steer the process exit code.
#[derive(Error, Debug)]
pub enum CliError {
    #[error("Interrupted.")]
    Interrupted,
    #[error("{0} environment(s) failed.")]
    EnvironmentsFailed(usize),
}

/// testbed: provisions isolated test environments and runs commands inside them.
#[derive(Parser, Debug)]
#[command(
    author,
    version,
    about,
    styles = clap::builder::Styles::styled()
        .header(clap::builder::styling::AnsiColor::Yellow.on_default().bold())
        .usage(clap::builder::styling::AnsiColor::Yellow.on_default().bold())
        .literal(clap::builder::styling::AnsiColor::Cyan.on_default().bold())
        .placeholder(clap::builder::styling::AnsiColor::Green.on_default()),
)]
#[command(disable_help_subcommand = true)]
pub struct Cli {
    /// Increase verbosity (repeatable). At -v the output of every command is shown.
    #[arg(short, long, action = ArgAction::Count)]
    pub verbose: u8,

    /// Decrease verbosity (repeatable).
    #[arg(short, long, action = ArgAction::Count)]
    pub quiet: u8,

    /// The command to run: `run` (default) or `config`.
    pub command: Option<String>,

    /// Arguments for the command.
    #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
    pub args: Vec<String>,
}

impl Cli {
    /// The effective verbosity: the default level moved up by `-v` and down by `-q`.
    pub fn verbosity(&self) -> u8 {
        DEFAULT_VERBOSITY
            .saturating_add(self.verbose)
            .saturating_sub(self.quiet)
    }
}

/// What every handler receives besides its own arguments.
#[derive(Debug, Clone)]
pub struct AppContext {
    pub verbosity: u8,
    pub cancellation_token: CancellationToken,
    /// The process working directory, captured once at start.
    pub invocation_dir: PathBuf,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_verbosity_counts_flags() {
        let cli = Cli::try_parse_from(["testbed", "-vv", "run", "-e", "unit"]).unwrap();
        assert_eq!(cli.verbosity(), DEFAULT_VERBOSITY + 2);
        assert_eq!(cli.command.as_deref(), Some("run"));
        assert_eq!(cli.args, vec!["-e", "unit"]);

        let cli = Cli::try_parse_from(["testbed", "-qqqq"]).unwrap();
        assert_eq!(cli.verbosity(), 0);
        assert!(cli.command.is_none());
    }
}
