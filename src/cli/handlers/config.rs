// src/cli/handlers/config.rs

use crate::cli::AppContext;
use crate::cli::args::ConfigArgs;
use crate::cli::handlers::commons;
use crate::core::config_set::{ConfigSet, stringify};
use crate::core::environment::Environment;
use crate::models::{CoreConfig, RunOptions};
use crate::system::output::LogHandler;
use anyhow::Result;
use clap::Parser;
use colored::*;
use std::sync::Arc;

/// The main handler for the `config` command.
/// Prints the resolved configuration of the selected environments in an INI-like layout.
pub fn handle(args: Vec<String>, context: &AppContext) -> Result<()> {
    let config_args = ConfigArgs::try_parse_from(&args)?;
    let project = commons::load_project(config_args.conf.as_deref(), context)?;

    let names: Vec<String> = if config_args.env.is_empty() {
        project.config.env.keys().cloned().collect()
    } else {
        project.select(&config_args.env)?
    };
    let options = Arc::new(RunOptions {
        verbosity: context.verbosity,
        ..RunOptions::default()
    });
    let log_handler = Arc::new(LogHandler::new());

    let mut blocks = Vec::with_capacity(names.len() + 1);
    for name in &names {
        let env = project.environment(name, Arc::clone(&options), None, Arc::clone(&log_handler))?;
        blocks.push(render_env(&env, &config_args.keys));
    }
    if config_args.core {
        blocks.push(render_core(&project.core, &config_args.keys));
    }
    println!("{}", blocks.join("\n\n"));
    Ok(())
}

/// Renders one `[env:<name>]` block. With `keys` empty every registered key is shown,
/// together with the runner and any key the environment table sets but nothing reads.
pub fn render_env(env: &Environment, keys: &[String]) -> String {
    let conf = env.conf();
    let mut lines = vec![format!("[env:{}]", conf.name()).yellow().bold().to_string()];
    if keys.is_empty() {
        lines.push(key_value("type", env.kind().id()));
    }
    for key in selected_keys(conf, keys) {
        match conf.get_value(&key) {
            Ok(value) => lines.push(key_value(&key, &stringify(&value))),
            Err(e) => lines.push(format!("{} = {}", key.green(), format!("# Exception: {}", e).red())),
        }
    }
    if keys.is_empty() {
        let unused = conf.unused();
        if !unused.is_empty() {
            lines.push(format!("# !!! unused: {}", unused.join(", ")).cyan().to_string());
        }
    }
    lines.join("\n")
}

/// Renders the `[core]` block.
pub fn render_core(core: &CoreConfig, keys: &[String]) -> String {
    let values = [
        ("root", core.root.display().to_string()),
        ("work_dir", core.work_dir.display().to_string()),
        ("env_list", stringify(&toml::Value::from(core.env_list.clone()))),
        ("interrupt_timeout", core.interrupt_timeout.as_secs_f64().to_string()),
        ("terminate_timeout", core.terminate_timeout.as_secs_f64().to_string()),
    ];
    let mut lines = vec!["[core]".yellow().bold().to_string()];
    lines.extend(
        values
            .iter()
            .filter(|(key, _)| keys.is_empty() || keys.iter().any(|k| k == key))
            .map(|(key, value)| key_value(key, value)),
    );
    lines.join("\n")
}

// Requested keys resolve through aliases; unknown ones are skipped.
fn selected_keys(conf: &ConfigSet, keys: &[String]) -> Vec<String> {
    if keys.is_empty() {
        return conf.definitions().map(|d| d.key().to_string()).collect();
    }
    keys.iter()
        .filter_map(|key| conf.primary_key(key).map(str::to_string))
        .collect()
}

fn key_value(key: &str, value: &str) -> String {
    if value.starts_with('\n') {
        format!("{} ={}", key.green(), value)
    } else {
        format!("{} = {}", key.green(), value)
    }
}
