// src/models.rs

use crate::constants::{DEFAULT_INTERRUPT_TIMEOUT, DEFAULT_TERMINATE_TIMEOUT, DEFAULT_VERBOSITY, DEFAULT_WORK_DIR};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

// --- `testbed.toml` MODELS (What is read from the configuration file) ---

/// Represents the deserialized structure of a `testbed.toml` file.
///
/// Environment tables are kept as raw TOML tables: their keys are only interpreted once an
/// environment registers its configuration definitions.
#[derive(Deserialize, Serialize, Debug, Clone, Default)]
pub struct ProjectConfig {
    #[serde(default)]
    pub core: CoreSection,
    /// Keys inherited by every `[env.*]` table that does not set them itself.
    #[serde(default)]
    pub env_defaults: toml::Table,
    /// One raw table per environment, in file order.
    #[serde(default)]
    pub env: IndexMap<String, toml::Table>,
}

/// The `[core]` table.
#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct CoreSection {
    #[serde(default = "default_work_dir")]
    pub work_dir: PathBuf,
    #[serde(default)]
    pub env_list: Vec<String>,
    #[serde(default = "default_interrupt_timeout")]
    pub interrupt_timeout: f64,
    #[serde(default = "default_terminate_timeout")]
    pub terminate_timeout: f64,
}

impl Default for CoreSection {
    fn default() -> Self {
        Self {
            work_dir: default_work_dir(),
            env_list: Vec::new(),
            interrupt_timeout: DEFAULT_INTERRUPT_TIMEOUT,
            terminate_timeout: DEFAULT_TERMINATE_TIMEOUT,
        }
    }
}

fn default_work_dir() -> PathBuf {
    PathBuf::from(DEFAULT_WORK_DIR)
}

fn default_interrupt_timeout() -> f64 {
    DEFAULT_INTERRUPT_TIMEOUT
}

fn default_terminate_timeout() -> f64 {
    DEFAULT_TERMINATE_TIMEOUT
}

// --- RESOLVED MODELS ---

/// The resolved, project-wide configuration shared by every environment of a run.
#[derive(Debug, Clone, PartialEq)]
pub struct CoreConfig {
    /// The directory containing `testbed.toml`; the default working directory of commands.
    pub root: PathBuf,
    /// Absolute directory under which each environment gets its own folder.
    pub work_dir: PathBuf,
    pub env_list: Vec<String>,
    pub interrupt_timeout: Duration,
    pub terminate_timeout: Duration,
    /// The process working directory, captured once at start. Used only to shorten
    /// displayed paths.
    pub invocation_dir: PathBuf,
}

impl CoreConfig {
    /// Resolves a `[core]` table against the project root.
    pub fn from_section(section: &CoreSection, root: &Path, invocation_dir: &Path) -> Self {
        let work_dir = if section.work_dir.is_absolute() {
            section.work_dir.clone()
        } else {
            root.join(&section.work_dir)
        };
        Self {
            root: root.to_path_buf(),
            work_dir,
            env_list: section.env_list.clone(),
            interrupt_timeout: seconds(section.interrupt_timeout),
            terminate_timeout: seconds(section.terminate_timeout),
            invocation_dir: invocation_dir.to_path_buf(),
        }
    }

    /// A core configuration rooted at `root` with every other value defaulted.
    pub fn for_root(root: &Path) -> Self {
        Self::from_section(&CoreSection::default(), root, root)
    }
}

// Negative or NaN timeouts collapse to zero instead of failing the run.
fn seconds(value: f64) -> Duration {
    Duration::try_from_secs_f64(value).unwrap_or(Duration::ZERO)
}

/// Options given on the command line for a run.
#[derive(Debug, Clone)]
pub struct RunOptions {
    pub verbosity: u8,
    /// Environment names selected with `-e`; empty means "use the configured list".
    pub envs: Vec<String>,
    pub recreate: bool,
    /// `None` runs sequentially, `Some(0)` uses one worker per CPU.
    pub parallel: Option<usize>,
    pub parallel_live: bool,
    pub result_json: Option<PathBuf>,
}

impl Default for RunOptions {
    fn default() -> Self {
        Self {
            verbosity: DEFAULT_VERBOSITY,
            envs: Vec::new(),
            recreate: false,
            parallel: None,
            parallel_live: false,
            result_json: None,
        }
    }
}
