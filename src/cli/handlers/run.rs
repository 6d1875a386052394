// src/cli/handlers/run.rs

use crate::cli::args::RunArgs;
use crate::cli::handlers::commons;
use crate::cli::{AppContext, CliError};
use crate::core::environment::InterruptHandle;
use crate::core::runner::EnvStatus;
use crate::core::session::{Session, summary_lines};
use crate::models::RunOptions;
use crate::system::signals;
use anyhow::{Context, Result};
use clap::Parser;
use colored::*;
use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::thread;

/// The main handler for the `run` command.
///
/// Sets up and runs every selected environment, prints one summary line per environment
/// and fails if any of them failed or the run was interrupted.
pub fn handle(args: Vec<String>, context: &AppContext) -> Result<()> {
    let run_args = RunArgs::try_parse_from(&args)?;
    let project = commons::load_project(run_args.conf.as_deref(), context)?;

    let options = RunOptions {
        verbosity: context.verbosity,
        envs: run_args.env,
        recreate: run_args.recreate,
        parallel: run_args.parallel,
        parallel_live: run_args.parallel_live,
        result_json: run_args
            .result_json
            .map(|path| commons::resolve_cli_path(&path, context)),
    };
    let mut session = Session::new(&project, options)?;

    let handles = session.interrupt_handles();
    signals::spawn_interrupt_watcher(Arc::clone(&context.cancellation_token), move || {
        interrupt_all(&handles);
    })
    .context("Failed to install the Ctrl+C handler")?;

    let reports = session.run(&context.cancellation_token)?;

    println!();
    for line in summary_lines(&reports) {
        println!("{}", line);
    }

    if context.cancellation_token.load(Ordering::SeqCst) {
        return Err(CliError::Interrupted.into());
    }
    let failed = reports.iter().filter(|r| r.status == EnvStatus::Failed).count();
    if failed > 0 {
        return Err(CliError::EnvironmentsFailed(failed).into());
    }
    println!("  {}", "congratulations :)".green().bold());
    Ok(())
}

/// Interrupts every environment concurrently, so each one's escalation timeouts overlap.
fn interrupt_all(handles: &[InterruptHandle]) {
    thread::scope(|scope| {
        for handle in handles {
            scope.spawn(move || handle.interrupt());
        }
    });
}
