use crate::core::environment::{EnvError, Environment};
use crate::system::executor::{StdinSource, parse_command};
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

/// How an environment ended up after a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnvStatus {
    Ok,
    Skipped,
    Failed,
}

impl fmt::Display for EnvStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Ok => "OK",
            Self::Skipped => "SKIP",
            Self::Failed => "FAIL",
        })
    }
}

/// The result of running one environment.
#[derive(Debug, Clone, PartialEq)]
pub struct EnvReport {
    pub name: String,
    pub status: EnvStatus,
    pub reason: Option<String>,
    pub duration: Duration,
}

impl EnvReport {
    pub fn interrupted(name: &str) -> Self {
        Self {
            name: name.to_string(),
            status: EnvStatus::Failed,
            reason: Some("interrupted".to_string()),
            duration: Duration::ZERO,
        }
    }
}

// --- Main Public Function ---

/// Sets up `env`, runs its `commands_pre`, `commands` and `commands_post`, then tears it down.
///
/// `commands_post` always run. Otherwise the first failing command stops the run, unless
/// `ignore_errors` is set, in which case the remaining commands still run and the
/// environment is reported as failed.
pub fn run_environment(env: &mut Environment, recreate: bool) -> EnvReport {
    let started = Instant::now();
    let (mut status, mut reason) = match run_phases(env, recreate) {
        Ok(None) => (EnvStatus::Ok, None),
        Ok(Some(reason)) => (EnvStatus::Failed, Some(reason)),
        Err(EnvError::Skip(reason)) => (EnvStatus::Skipped, Some(reason)),
        Err(EnvError::HardAbort) => (EnvStatus::Failed, Some("interrupted".to_string())),
        Err(e) => (EnvStatus::Failed, Some(e.to_string())),
    };
    if let Err(e) = env.teardown() {
        log::error!("teardown failed: {}", e);
        if status != EnvStatus::Failed {
            status = EnvStatus::Failed;
            reason = Some(format!("teardown failed: {}", e));
        }
    }
    EnvReport {
        name: env.name().to_string(),
        status,
        reason,
        duration: started.elapsed(),
    }
}

/// Returns the reason of the first failure, if any command failed.
fn run_phases(env: &mut Environment, recreate: bool) -> Result<Option<String>, EnvError> {
    env.setup(recreate)?;

    let ignore_errors: bool = env.conf().get("ignore_errors")?;
    let change_dir: PathBuf = env.conf().get("change_dir")?;
    let cwd = if change_dir.is_absolute() {
        change_dir
    } else {
        env.conf().core().root.join(change_dir)
    };

    let mut failure = None;
    for phase in ["commands_pre", "commands"] {
        if failure.is_some() && !ignore_errors {
            break;
        }
        let commands: Vec<String> = env.conf().get(phase)?;
        let phase_failure = run_commands(env, phase, &commands, &cwd, ignore_errors)?;
        failure = failure.or(phase_failure);
    }

    let commands: Vec<String> = env.conf().get("commands_post")?;
    let post_failure = run_commands(env, "commands_post", &commands, &cwd, ignore_errors)?;
    Ok(failure.or(post_failure))
}

fn run_commands(
    env: &mut Environment,
    phase: &str,
    commands: &[String],
    cwd: &Path,
    ignore_errors: bool,
) -> Result<Option<String>, EnvError> {
    // Parallel workers have no terminal to read from.
    let stdin = if env.has_display_suspended() {
        StdinSource::Off
    } else {
        StdinSource::User
    };
    let mut failure = None;
    for (index, line) in commands.iter().enumerate() {
        let run_id = format!("{}[{}]", phase, index);
        let (cmd, ignore_exit_code) = match parse_command(line) {
            Ok(parsed) => parsed,
            Err(e) => {
                log::error!("{}: {}", run_id, e);
                failure.get_or_insert_with(|| format!("{}: {}", run_id, e));
                if ignore_errors {
                    continue;
                }
                break;
            }
        };

        let outcome = match env.execute(cmd, stdin, None, Some(cwd.to_path_buf()), &run_id) {
            Ok(outcome) => outcome,
            Err(e @ EnvError::HardAbort) => return Err(e),
            Err(EnvError::Execution(e)) => {
                log::error!("{}", e);
                failure.get_or_insert_with(|| format!("{}: {}", run_id, e));
                if ignore_errors {
                    continue;
                }
                break;
            }
            Err(e) => return Err(e),
        };

        if outcome.is_success() || ignore_exit_code {
            continue;
        }
        log::error!("{} failed with exit code {}", run_id, outcome.exit_code);
        failure.get_or_insert_with(|| format!("{} failed with exit code {}", run_id, outcome.exit_code));
        if !ignore_errors {
            break;
        }
    }
    Ok(failure)
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::core::config_set::ConfigSet;
    use crate::core::kinds::kind_of;
    use crate::models::{CoreConfig, RunOptions};
    use crate::system::output::LogHandler;
    use std::fs;
    use std::sync::Arc;
    use tempfile::tempdir;

    fn environment(root: &Path, raw: &str) -> Environment {
        let core = Arc::new(CoreConfig::for_root(root));
        let mut conf = ConfigSet::new("unit", toml::from_str(raw).unwrap(), toml::Table::new(), core);
        let kind = kind_of(&mut conf).unwrap();
        Environment::new(
            conf,
            kind,
            Arc::new(RunOptions::default()),
            None,
            Arc::new(LogHandler::new()),
        )
        .unwrap()
    }

    fn log(root: &Path) -> String {
        fs::read_to_string(root.join("log")).unwrap_or_default()
    }

    #[test]
    fn test_phases_run_in_order() {
        let dir = tempdir().unwrap();
        let mut env = environment(
            dir.path(),
            r#"
            runner = "system"
            commands_pre = ["sh -c 'echo pre >> log'"]
            commands = ["sh -c 'echo main >> log'"]
            commands_post = ["sh -c 'echo post >> log'"]
            "#,
        );

        let report = run_environment(&mut env, false);

        assert_eq!(report.status, EnvStatus::Ok);
        assert_eq!(log(dir.path()), "pre\nmain\npost\n");
        assert!(env.run_state().teardown);
    }

    #[test]
    fn test_failure_stops_commands_but_not_post() {
        let dir = tempdir().unwrap();
        let mut env = environment(
            dir.path(),
            r#"
            runner = "system"
            commands = ["sh -c 'exit 3'", "sh -c 'echo main >> log'"]
            commands_post = ["sh -c 'echo post >> log'"]
            "#,
        );

        let report = run_environment(&mut env, false);

        assert_eq!(report.status, EnvStatus::Failed);
        assert_eq!(report.reason.as_deref(), Some("commands[0] failed with exit code 3"));
        assert_eq!(log(dir.path()), "post\n");
    }

    #[test]
    fn test_ignore_errors_keeps_going_but_still_fails() {
        let dir = tempdir().unwrap();
        let mut env = environment(
            dir.path(),
            r#"
            runner = "system"
            ignore_errors = true
            commands = ["false", "sh -c 'echo main >> log'"]
            "#,
        );

        let report = run_environment(&mut env, false);

        assert_eq!(report.status, EnvStatus::Failed);
        assert_eq!(log(dir.path()), "main\n");
    }

    #[test]
    fn test_dash_prefix_ignores_exit_code() {
        let dir = tempdir().unwrap();
        let mut env = environment(
            dir.path(),
            r#"
            runner = "system"
            commands = ["- false", "sh -c 'echo main >> log'"]
            change_dir = "sub"
            "#,
        );
        fs::create_dir(dir.path().join("sub")).unwrap();

        let report = run_environment(&mut env, false);

        assert_eq!(report.status, EnvStatus::Ok);
        assert_eq!(fs::read_to_string(dir.path().join("sub").join("log")).unwrap(), "main\n");
    }

    #[test]
    fn test_platform_mismatch_is_skipped() {
        let dir = tempdir().unwrap();
        let mut env = environment(dir.path(), "platform = 'no-such-os'\ncommands = ['true']");

        let report = run_environment(&mut env, false);

        assert_eq!(report.status, EnvStatus::Skipped);
        assert!(report.reason.unwrap().contains("no-such-os"));
    }

    #[test]
    fn test_interrupted_environment_reports_interrupted() {
        let dir = tempdir().unwrap();
        let mut env = environment(dir.path(), "runner = 'system'\ncommands = ['true']");
        env.interrupt();

        let report = run_environment(&mut env, false);

        assert_eq!(report.status, EnvStatus::Failed);
        assert_eq!(report.reason.as_deref(), Some("interrupted"));
    }
}
