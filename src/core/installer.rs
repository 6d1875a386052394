// src/core/installer.rs

use crate::constants::INSTALLER_FINGERPRINT_SECTION;
use crate::core::environment::{EnvError, Environment};
use crate::system::executor::{StdinSource, parse_command};
use log::debug;
use std::fmt;

/// Provisions an environment during setup. May request a recreation with
/// [`EnvError::Recreate`].
pub trait Installer: Send + Sync + fmt::Debug {
    fn install(&self, env: &mut Environment) -> Result<(), EnvError>;
}

/// Hashes the bincode encoding of `commands` into a short, stable hex string.
pub fn fingerprint(commands: &[String]) -> Result<String, bincode::error::EncodeError> {
    let bytes = bincode::serde::encode_to_vec(commands, bincode::config::standard())?;
    Ok(hex::encode(blake3::hash(&bytes).as_bytes()))
}

/// Runs the `install_commands` of an environment once.
///
/// The fingerprint of the command list is kept in the environment's info store. An
/// unchanged list is not run again; a changed list asks for the environment to be recreated.
#[derive(Debug, Clone, Copy, Default)]
pub struct CommandsInstaller;

impl Installer for CommandsInstaller {
    fn install(&self, env: &mut Environment) -> Result<(), EnvError> {
        let commands: Vec<String> = env.conf().get("install_commands")?;
        let fingerprint = fingerprint(&commands)?;
        let comparison = env.cache_mut().compare(&fingerprint, INSTALLER_FINGERPRINT_SECTION)?;
        match comparison.previous {
            Some(previous) if !comparison.matches => {
                let previous = previous.as_str().map(str::to_string).unwrap_or_else(|| previous.to_string());
                return Err(EnvError::Recreate(format!(
                    "install commands changed from {} to {}",
                    previous, fingerprint
                )));
            }
            Some(_) => {
                debug!("install commands unchanged, nothing to install");
                return Ok(());
            }
            None => {}
        }

        // Only a complete installation may keep its fingerprint.
        if let Err(e) = run_install_commands(env, &commands) {
            env.cache_mut().remove(INSTALLER_FINGERPRINT_SECTION)?;
            return Err(e);
        }
        Ok(())
    }
}

fn run_install_commands(env: &mut Environment, commands: &[String]) -> Result<(), EnvError> {
    for (index, line) in commands.iter().enumerate() {
        let (cmd, ignore_errors) = parse_command(line)?;
        let run_id = format!("install_commands[{}]", index);
        let outcome = env.execute(cmd, StdinSource::Off, None, None, &run_id)?;
        if !ignore_errors {
            outcome.assert_success()?;
        }
    }
    Ok(())
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::core::config_set::ConfigSet;
    use crate::core::kinds::LocalRunner;
    use crate::models::{CoreConfig, RunOptions};
    use crate::system::output::LogHandler;
    use std::fs;
    use std::path::Path;
    use std::sync::Arc;
    use tempfile::tempdir;

    fn environment(root: &Path, install_commands: &[&str]) -> Environment {
        let core = Arc::new(CoreConfig::for_root(root));
        let mut raw = toml::Table::new();
        raw.insert("install_commands".to_string(), toml::Value::from(install_commands.to_vec()));
        let conf = ConfigSet::new("unit", raw, toml::Table::new(), Arc::clone(&core));
        Environment::new(
            conf,
            Arc::new(LocalRunner::new(&core)),
            Arc::new(RunOptions::default()),
            None,
            Arc::new(LogHandler::new()),
        )
        .unwrap()
    }

    fn runs(root: &Path) -> usize {
        fs::read_to_string(root.join("installs")).map(|s| s.lines().count()).unwrap_or(0)
    }

    #[test]
    fn test_fingerprint_is_stable_and_order_sensitive() {
        let a = vec!["one".to_string(), "two".to_string()];
        let b = vec!["two".to_string(), "one".to_string()];
        assert_eq!(fingerprint(&a).unwrap(), fingerprint(&a).unwrap());
        assert_ne!(fingerprint(&a).unwrap(), fingerprint(&b).unwrap());
        assert_eq!(fingerprint(&a).unwrap().len(), 64);
    }

    #[test]
    fn test_unchanged_commands_install_once() {
        let dir = tempdir().unwrap();
        let commands = ["sh -c 'echo run >> installs'"];

        environment(dir.path(), &commands).setup(false).unwrap();
        environment(dir.path(), &commands).setup(false).unwrap();

        assert_eq!(runs(dir.path()), 1);
    }

    #[test]
    fn test_changed_commands_recreate_and_reinstall() {
        let dir = tempdir().unwrap();
        environment(dir.path(), &["sh -c 'echo run >> installs'"]).setup(false).unwrap();
        let env_dir = dir.path().join(".testbed").join("unit");
        fs::write(env_dir.join("artifact"), "").unwrap();

        environment(dir.path(), &["sh -c 'echo run >> installs'", "true"]).setup(false).unwrap();

        assert_eq!(runs(dir.path()), 2);
        assert!(!env_dir.join("artifact").exists());
    }

    #[test]
    fn test_failed_install_forgets_the_fingerprint() {
        let dir = tempdir().unwrap();
        let commands = ["sh -c 'echo run >> installs'", "false"];

        assert!(environment(dir.path(), &commands).setup(false).is_err());
        // Not recorded, so the next run tries again instead of trusting a broken install.
        assert!(environment(dir.path(), &commands).setup(false).is_err());
        assert_eq!(runs(dir.path()), 2);
    }

    #[test]
    fn test_ignored_failures_complete_the_install() {
        let dir = tempdir().unwrap();
        let commands = ["- false", "sh -c 'echo run >> installs'"];

        environment(dir.path(), &commands).setup(false).unwrap();
        environment(dir.path(), &commands).setup(false).unwrap();

        assert_eq!(runs(dir.path()), 1);
    }
}
