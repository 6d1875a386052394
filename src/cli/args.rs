// src/cli/args.rs
use clap::Parser;
use std::path::PathBuf;

#[derive(Parser, Debug, Default)]
#[command(no_binary_name = true, about = "Sets up the selected environments and runs their commands.")]
pub struct RunArgs {
    /// Environments to run (comma separated or repeated). Defaults to `core.env_list`.
    #[arg(short, long, value_delimiter = ',')]
    pub env: Vec<String>,

    /// Recreate the environments even if their fingerprint did not change.
    #[arg(short, long)]
    pub recreate: bool,

    /// Run environments in parallel on N workers (0, or no value, means one per CPU).
    #[arg(short, long, value_name = "N", num_args = 0..=1, default_missing_value = "0")]
    pub parallel: Option<usize>,

    /// In parallel mode, stream output as it happens instead of buffering it per environment.
    #[arg(long)]
    pub parallel_live: bool,

    /// Write a JSON journal of every executed command to this file.
    #[arg(long, value_name = "PATH")]
    pub result_json: Option<PathBuf>,

    /// Use this configuration file instead of searching for `testbed.toml`.
    #[arg(short, long, value_name = "PATH")]
    pub conf: Option<PathBuf>,
}

#[derive(Parser, Debug, Default)]
#[command(no_binary_name = true, about = "Shows the resolved configuration of environments.")]
pub struct ConfigArgs {
    /// Environments to show (comma separated or repeated). Defaults to all of them.
    #[arg(short, long, value_delimiter = ',')]
    pub env: Vec<String>,

    /// Only show these keys.
    #[arg(short, long = "key", value_name = "KEY", num_args = 1..)]
    pub keys: Vec<String>,

    /// Also show the `[core]` section.
    #[arg(long)]
    pub core: bool,

    /// Use this configuration file instead of searching for `testbed.toml`.
    #[arg(short, long, value_name = "PATH")]
    pub conf: Option<PathBuf>,
}
