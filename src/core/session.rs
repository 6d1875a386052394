//! # Session
//!
//! Loads a project, builds one [`Environment`] per selected name and drives them, either one
//! after the other or on a `rayon` pool.
//!
//! In parallel mode every worker suspends its environment's output into buffers. Once the
//! environment is done the buffers are replayed to the terminal if it failed or asked for
//! its output with `parallel_show_output`. `--parallel-live` skips the suspension.

use crate::CancellationToken;
use crate::constants::PROJECT_CONFIG_FILENAME;
use crate::core::config_set::{ConfigError, ConfigSet};
use crate::core::environment::{EnvError, Environment, InterruptHandle};
use crate::core::journal::{Journal, JournalError};
use crate::core::kinds::kind_of;
use crate::core::runner::{EnvReport, EnvStatus, run_environment};
use crate::models::{CoreConfig, ProjectConfig, RunOptions};
use crate::system::lock;
use crate::system::output::LogHandler;
use colored::Colorize;
use rayon::prelude::*;
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::Ordering;
use std::sync::{Arc, Mutex};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum SessionError {
    #[error("No 'testbed.toml' found in '{0}' or any parent directory.")]
    ConfigNotFound(PathBuf),
    #[error("Could not read '{path}': {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("Failed to parse '{path}': {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("Environment '{name}' could not be created: {source}")]
    Environment {
        name: String,
        #[source]
        source: EnvError,
    },
    #[error("Could not start the parallel worker pool: {0}")]
    ThreadPool(#[from] rayon::ThreadPoolBuildError),
    #[error(transparent)]
    Journal(#[from] JournalError),
}

/// Finds the project configuration in `start` or its closest ancestor.
pub fn find_config(start: &Path) -> Result<PathBuf, SessionError> {
    start
        .ancestors()
        .map(|dir| dir.join(PROJECT_CONFIG_FILENAME))
        .find(|candidate| candidate.is_file())
        .ok_or_else(|| SessionError::ConfigNotFound(start.to_path_buf()))
}

/// A loaded `testbed.toml` and the core configuration resolved from it.
#[derive(Debug, Clone)]
pub struct Project {
    pub config: ProjectConfig,
    pub core: Arc<CoreConfig>,
}

impl Project {
    /// Loads `conf` (or the configuration discovered from `invocation_dir`).
    pub fn load(conf: Option<&Path>, invocation_dir: &Path) -> Result<Self, SessionError> {
        let path = match conf {
            Some(path) => invocation_dir.join(path),
            None => find_config(invocation_dir)?,
        };
        let path = dunce::canonicalize(&path).map_err(|source| SessionError::Io {
            path: path.clone(),
            source,
        })?;
        let text = fs::read_to_string(&path).map_err(|source| SessionError::Io {
            path: path.clone(),
            source,
        })?;
        let config: ProjectConfig = toml::from_str(&text).map_err(|source| SessionError::Parse {
            path: path.clone(),
            source,
        })?;
        let root = path.parent().unwrap_or(invocation_dir);
        log::debug!("Loaded project configuration from '{}'", path.display());
        let core = Arc::new(CoreConfig::from_section(&config.core, root, invocation_dir));
        Ok(Self { config, core })
    }

    /// The environments to run: `requested` if given, else `core.env_list`, else every
    /// `[env.*]` table in file order.
    pub fn select(&self, requested: &[String]) -> Result<Vec<String>, ConfigError> {
        let names: Vec<String> = if !requested.is_empty() {
            requested.to_vec()
        } else if !self.core.env_list.is_empty() {
            self.core.env_list.clone()
        } else {
            self.config.env.keys().cloned().collect()
        };
        let mut selected: Vec<String> = Vec::with_capacity(names.len());
        for name in names {
            if !self.config.env.contains_key(&name) {
                return Err(ConfigError::UnknownEnvironment(name));
            }
            if !selected.contains(&name) {
                selected.push(name);
            }
        }
        Ok(selected)
    }

    /// The raw configuration set of `name`, with only the `runner` key registered.
    pub fn config_set(&self, name: &str) -> Result<ConfigSet, ConfigError> {
        let raw = self
            .config
            .env
            .get(name)
            .cloned()
            .ok_or_else(|| ConfigError::UnknownEnvironment(name.to_string()))?;
        Ok(ConfigSet::new(
            name,
            raw,
            self.config.env_defaults.clone(),
            Arc::clone(&self.core),
        ))
    }

    /// Builds the environment `name` with every configuration key registered.
    pub fn environment(
        &self,
        name: &str,
        options: Arc<RunOptions>,
        journal: Option<&Journal>,
        log_handler: Arc<LogHandler>,
    ) -> Result<Environment, SessionError> {
        let mut conf = self.config_set(name)?;
        let kind = kind_of(&mut conf)?;
        Environment::new(
            conf,
            kind,
            options,
            journal.map(|j| j.env_journal(name)),
            log_handler,
        )
        .map_err(|source| SessionError::Environment {
            name: name.to_string(),
            source,
        })
    }
}

/// The environments of one `run` invocation.
#[derive(Debug)]
pub struct Session {
    options: Arc<RunOptions>,
    journal: Option<Journal>,
    envs: Vec<Environment>,
}

impl Session {
    pub fn new(project: &Project, options: RunOptions) -> Result<Self, SessionError> {
        let options = Arc::new(options);
        let journal = options.result_json.as_ref().map(|_| Journal::new());
        let log_handler = Arc::new(LogHandler::new());
        let envs = project
            .select(&options.envs)?
            .iter()
            .map(|name| project.environment(name, Arc::clone(&options), journal.as_ref(), Arc::clone(&log_handler)))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self { options, journal, envs })
    }

    /// Handles through which a signal watcher can interrupt every environment.
    pub fn interrupt_handles(&self) -> Vec<InterruptHandle> {
        self.envs.iter().map(Environment::interrupt_handle).collect()
    }

    /// Runs every environment and returns one report per environment, in selection order.
    pub fn run(&mut self, token: &CancellationToken) -> Result<Vec<EnvReport>, SessionError> {
        let recreate = self.options.recreate;
        let reports: Vec<EnvReport> = match self.options.parallel {
            None => self
                .envs
                .iter_mut()
                .map(|env| run_one(env, token, recreate, false))
                .collect(),
            Some(workers) => {
                let suspend = !self.options.parallel_live;
                let replay_lock = Mutex::new(());
                let pool = rayon::ThreadPoolBuilder::new().num_threads(workers).build()?;
                pool.install(|| {
                    self.envs
                        .par_iter_mut()
                        .map(|env| {
                            let report = run_one(env, token, recreate, suspend);
                            replay(env, &report, &replay_lock);
                            report
                        })
                        .collect()
                })
            }
        };
        if let (Some(journal), Some(path)) = (&self.journal, &self.options.result_json) {
            for (env, report) in self.envs.iter().zip(&reports) {
                journal
                    .env_journal(env.name())
                    .set_result(&report.status.to_string(), report.reason.as_deref(), report.duration);
            }
            journal.write(path)?;
        }
        Ok(reports)
    }
}

fn run_one(env: &mut Environment, token: &CancellationToken, recreate: bool, suspend: bool) -> EnvReport {
    if token.load(Ordering::SeqCst) {
        return EnvReport::interrupted(env.name());
    }
    let _display = env.display_context(suspend);
    run_environment(env, recreate)
}

/// Writes the captured output of a parallel environment to the terminal when it is wanted.
fn replay(env: &mut Environment, report: &EnvReport, replay_lock: &Mutex<()>) {
    let Some((out, err)) = env.close_and_read_out_err() else {
        return;
    };
    let show_output = env.conf().get::<bool>("parallel_show_output").unwrap_or_else(|e| {
        log::warn!("{}", e);
        false
    });
    if report.status != EnvStatus::Failed && !show_output {
        return;
    }
    let _guard = lock(replay_lock);
    let result = io::stdout()
        .write_all(&out)
        .and_then(|()| io::stdout().flush())
        .and_then(|()| io::stderr().write_all(&err));
    if let Err(e) = result {
        log::debug!("Could not replay output of {}: {}", env.name(), e);
    }
}

/// One line per environment, e.g. `unit: OK in 1.23 s`.
pub fn summary_lines(reports: &[EnvReport]) -> Vec<String> {
    reports
        .iter()
        .map(|report| {
            let status = match report.status {
                EnvStatus::Ok => report.status.to_string().green().bold(),
                EnvStatus::Skipped => report.status.to_string().yellow().bold(),
                EnvStatus::Failed => report.status.to_string().red().bold(),
            };
            let reason = report
                .reason
                .as_deref()
                .map(|reason| format!(" ({})", reason))
                .unwrap_or_default();
            format!(
                "  {}: {}{} in {:.2} s",
                report.name,
                status,
                reason,
                report.duration.as_secs_f64()
            )
        })
        .collect()
}

/// Whether the run as a whole succeeded: no environment failed.
pub fn all_succeeded(reports: &[EnvReport]) -> bool {
    reports.iter().all(|report| report.status != EnvStatus::Failed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicBool;
    use std::time::Duration;
    use tempfile::tempdir;

    const PROJECT: &str = r#"
        [core]
        env_list = ["b"]

        [env_defaults]
        runner = "system"

        [env.a]
        commands = ["sh -c 'echo a >> log'"]

        [env.b]
        commands = ["sh -c 'echo b >> log'"]

        [env.broken]
        commands = ["sh -c 'echo broken output; exit 1'"]
    "#;

    fn project(dir: &Path) -> Project {
        fs::write(dir.join(PROJECT_CONFIG_FILENAME), PROJECT).unwrap();
        Project::load(None, dir).unwrap()
    }

    fn token() -> CancellationToken {
        Arc::new(AtomicBool::new(false))
    }

    #[test]
    fn test_find_config_walks_up() {
        let dir = tempdir().unwrap();
        let nested = dir.path().join("a").join("b");
        fs::create_dir_all(&nested).unwrap();
        fs::write(dir.path().join(PROJECT_CONFIG_FILENAME), "").unwrap();

        assert_eq!(find_config(&nested).unwrap(), dir.path().join(PROJECT_CONFIG_FILENAME));
        let empty = tempdir().unwrap();
        assert!(matches!(find_config(empty.path()), Err(SessionError::ConfigNotFound(_))));
    }

    #[test]
    fn test_select_order_and_validation() {
        let dir = tempdir().unwrap();
        let project = project(dir.path());

        assert_eq!(project.select(&[]).unwrap(), vec!["b"]);
        assert_eq!(
            project.select(&["a".to_string(), "b".to_string(), "a".to_string()]).unwrap(),
            vec!["a", "b"]
        );
        assert!(matches!(
            project.select(&["nope".to_string()]),
            Err(ConfigError::UnknownEnvironment(name)) if name == "nope"
        ));
    }

    #[test]
    fn test_env_defaults_apply_to_every_environment() {
        let dir = tempdir().unwrap();
        let project = project(dir.path());
        let env = project
            .environment("a", Arc::new(RunOptions::default()), None, Arc::new(LogHandler::new()))
            .unwrap();

        assert_eq!(env.kind().id(), "system");
    }

    #[cfg(unix)]
    #[test]
    fn test_sequential_run_writes_journal() {
        let dir = tempdir().unwrap();
        let project = project(dir.path());
        let result_json = dir.path().join("result.json");
        let options = RunOptions {
            envs: vec!["a".to_string(), "broken".to_string()],
            result_json: Some(result_json.clone()),
            ..RunOptions::default()
        };

        let reports = Session::new(&project, options).unwrap().run(&token()).unwrap();

        assert_eq!(reports.len(), 2);
        assert_eq!(reports[0].status, EnvStatus::Ok);
        assert_eq!(reports[1].status, EnvStatus::Failed);
        assert!(!all_succeeded(&reports));
        let journal = fs::read_to_string(result_json).unwrap();
        assert!(journal.contains("\"broken\""));
        assert!(journal.contains("broken output"));
    }

    #[cfg(unix)]
    #[test]
    fn test_parallel_run_keeps_selection_order() {
        let dir = tempdir().unwrap();
        let project = project(dir.path());
        let options = RunOptions {
            envs: vec!["b".to_string(), "a".to_string()],
            parallel: Some(2),
            ..RunOptions::default()
        };

        let reports = Session::new(&project, options).unwrap().run(&token()).unwrap();

        let names: Vec<_> = reports.iter().map(|r| r.name.as_str()).collect();
        assert_eq!(names, vec!["b", "a"]);
        assert!(all_succeeded(&reports));
        let log = fs::read_to_string(dir.path().join("log")).unwrap();
        assert_eq!(log.lines().count(), 2);
    }

    #[test]
    fn test_cancelled_session_never_sets_up() {
        let dir = tempdir().unwrap();
        let project = project(dir.path());
        let token = token();
        token.store(true, Ordering::SeqCst);

        let reports = Session::new(&project, RunOptions::default()).unwrap().run(&token).unwrap();

        assert_eq!(reports, vec![EnvReport::interrupted("b")]);
        assert!(!dir.path().join(".testbed").exists());
    }

    #[test]
    fn test_summary_lines() {
        colored::control::set_override(false);
        let reports = vec![
            EnvReport {
                name: "unit".to_string(),
                status: EnvStatus::Ok,
                reason: None,
                duration: Duration::from_millis(1234),
            },
            EnvReport {
                name: "win".to_string(),
                status: EnvStatus::Skipped,
                reason: Some("platform linux does not match win32".to_string()),
                duration: Duration::ZERO,
            },
        ];

        assert_eq!(
            summary_lines(&reports),
            vec![
                "  unit: OK in 1.23 s".to_string(),
                "  win: SKIP (platform linux does not match win32) in 0.00 s".to_string(),
            ]
        );
        assert!(all_succeeded(&reports));
    }
}
