// src/cli/handlers/commons.rs

// Shared helpers used by multiple handlers.

use crate::cli::AppContext;
use crate::core::session::Project;
use anyhow::{Context, Result};
use std::path::{Path, PathBuf};

/// Loads the project named by `--conf`, or the one discovered from the invocation directory.
pub fn load_project(conf: Option<&Path>, context: &AppContext) -> Result<Project> {
    let project = Project::load(conf, &context.invocation_dir).context("Failed to load the project configuration")?;
    log::info!("root: {}", project.core.root.display());
    Ok(project)
}

/// Resolves a path given on the command line against the invocation directory.
pub fn resolve_cli_path(path: &Path, context: &AppContext) -> PathBuf {
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        context.invocation_dir.join(path)
    }
}
