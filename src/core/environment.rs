//! # Environment
//!
//! The lifecycle engine of a single environment: platform applicability, fingerprint-driven
//! recreation, provisioning through the runner kind, command execution with scoped
//! sessions, and interruption.
//!
//! The state machine is `Uninitialized -> Ready -> Torn-down`. A `Skip` stops setup before
//! anything changes; a `Recreate` raised while provisioning triggers at most one implicit
//! clean and retry within the same `setup` call.

use crate::constants::{ENVIRONMENT_FINGERPRINT_SECTION, PATH_VARIABLE, SHOW_OUTPUT_MIN_VERBOSITY};
use crate::core::config_set::{ConfigDefault, ConfigError, ConfigSet};
use crate::core::env_vars::{VariableCache, VariableError, process_environment, resolve_variables};
use crate::core::info::{Info, InfoError};
use crate::core::journal::EnvJournal;
use crate::core::kinds::EnvironmentKind;
use crate::core::path_set::PathSet;
use crate::core::set_env::{SetEnv, SetEnvError};
use crate::models::RunOptions;
use crate::system::executor::{ExecuteRequest, ExecuteStatus, ExecutionError, Outcome, StdinSource};
use crate::system::lock;
use crate::system::output::{ContextGuard, LogHandler, OutErr, SuspendGuard};
use indexmap::IndexMap;
use log::{debug, warn};
use regex::Regex;
use scopeguard::ScopeGuard;
use serde::Serialize;
use std::collections::HashMap;
use std::fs;
use std::ops::Deref;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use thiserror::Error;
use uuid::Uuid;

#[derive(Error, Debug)]
pub enum EnvError {
    /// The environment does not apply to this run. Not a failure.
    #[error("{0}")]
    Skip(String),
    /// The persistent state must be discarded and rebuilt.
    #[error("recreate required: {0}")]
    Recreate(String),
    /// A command was requested after the environment had been interrupted.
    #[error("environment was interrupted")]
    HardAbort,
    #[error("internal error: {0}")]
    InvariantViolation(String),
    #[error("Invalid platform pattern '{pattern}': {source}")]
    Platform {
        pattern: String,
        #[source]
        source: regex::Error,
    },
    #[error("{context}: {source}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Info(#[from] InfoError),
    #[error(transparent)]
    SetEnv(#[from] SetEnvError),
    #[error(transparent)]
    Variables(#[from] VariableError),
    #[error(transparent)]
    Execution(#[from] ExecutionError),
    #[error("Failed to encode fingerprint: {0}")]
    Encode(#[from] bincode::error::EncodeError),
}

fn io_error(context: String) -> impl FnOnce(std::io::Error) -> EnvError {
    move |source| EnvError::Io { context, source }
}

/// The three independent lifecycle flags.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RunState {
    pub setup: bool,
    pub clean: bool,
    pub teardown: bool,
}

/// What the environment records about itself in its info store.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct Fingerprint {
    pub name: String,
    #[serde(rename = "type")]
    pub kind: String,
}

#[derive(Debug, Default)]
struct InterruptState {
    interrupted: bool,
    statuses: HashMap<Uuid, Arc<dyn ExecuteStatus>>,
}

/// The part of an environment that other threads may touch: the interrupted flag and the
/// registry of in-flight execution statuses.
#[derive(Debug, Clone)]
pub struct InterruptHandle {
    name: Arc<str>,
    flag: Arc<AtomicBool>,
    state: Arc<Mutex<InterruptState>>,
}

impl InterruptHandle {
    fn new(name: &str) -> Self {
        Self {
            name: Arc::from(name),
            flag: Arc::new(AtomicBool::new(false)),
            state: Arc::new(Mutex::new(InterruptState::default())),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_interrupted(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }

    /// Marks the environment interrupted and forwards an interrupt to every live status.
    /// Safe to call from any thread.
    pub fn interrupt(&self) {
        warn!("interrupt environment: {}", self.name);
        let statuses: Vec<Arc<dyn ExecuteStatus>> = {
            let mut state = lock(&self.state);
            state.interrupted = true;
            self.flag.store(true, Ordering::SeqCst);
            state.statuses.values().cloned().collect()
        };
        // Escalation may block; the registry stays usable meanwhile.
        for status in statuses {
            status.interrupt();
        }
    }

    /// Registers a live status. Returns `false`, without registering, when the environment
    /// was interrupted in the meantime; the status then never received that interrupt.
    fn register(&self, id: Uuid, status: Arc<dyn ExecuteStatus>) -> bool {
        let mut state = lock(&self.state);
        if state.interrupted {
            return false;
        }
        state.statuses.insert(id, status);
        true
    }

    fn deregister(&self, id: &Uuid) {
        lock(&self.state).statuses.remove(id);
    }

    #[cfg(test)]
    fn registered(&self) -> usize {
        lock(&self.state).statuses.len()
    }
}

/// One configured environment and its lifecycle.
#[derive(Debug)]
pub struct Environment {
    conf: ConfigSet,
    kind: Arc<dyn EnvironmentKind>,
    options: Arc<RunOptions>,
    journal: Option<Arc<EnvJournal>>,
    log_handler: Arc<LogHandler>,
    cache: Info,
    run_state: RunState,
    paths: PathSet,
    env_vars: VariableCache,
    visible_outcomes: Vec<Outcome>,
    suspended_out_err: Option<OutErr>,
    interrupt: InterruptHandle,
}

impl Environment {
    /// Registers the lifecycle keys (then the runner's keys) on `conf` and opens the info
    /// store of the environment folder.
    pub fn new(
        mut conf: ConfigSet,
        kind: Arc<dyn EnvironmentKind>,
        options: Arc<RunOptions>,
        journal: Option<Arc<EnvJournal>>,
        log_handler: Arc<LogHandler>,
    ) -> Result<Self, EnvError> {
        register_config(&mut conf, kind.as_ref());
        kind.register_config(&mut conf);

        let env_dir = env_dir_of(&conf)?;
        let interrupt = InterruptHandle::new(conf.name());
        Ok(Self {
            cache: Info::new(&env_dir),
            conf,
            kind,
            options,
            journal,
            log_handler,
            run_state: RunState::default(),
            paths: PathSet::default(),
            env_vars: VariableCache::default(),
            visible_outcomes: Vec::new(),
            suspended_out_err: None,
            interrupt,
        })
    }

    pub fn name(&self) -> &str {
        self.conf.name()
    }

    pub fn conf(&self) -> &ConfigSet {
        &self.conf
    }

    pub fn kind(&self) -> &dyn EnvironmentKind {
        self.kind.as_ref()
    }

    pub fn options(&self) -> &RunOptions {
        &self.options
    }

    pub fn run_state(&self) -> RunState {
        self.run_state
    }

    /// The fingerprint store of this environment. Installers keep their own sections in it.
    pub fn cache_mut(&mut self) -> &mut Info {
        &mut self.cache
    }

    pub fn env_dir(&self) -> Result<PathBuf, EnvError> {
        env_dir_of(&self.conf)
    }

    pub fn env_tmp_dir(&self) -> Result<PathBuf, EnvError> {
        let dir: PathBuf = self.conf.get("env_tmp_dir")?;
        Ok(absolute(&self.conf, dir))
    }

    /// A handle that can interrupt this environment from another thread.
    pub fn interrupt_handle(&self) -> InterruptHandle {
        self.interrupt.clone()
    }

    /// Outcomes of the commands that ran with their output shown.
    pub fn visible_outcomes(&self) -> &[Outcome] {
        &self.visible_outcomes
    }

    /// Sets up the environment. A no-op once setup is done, even with `recreate` set.
    pub fn setup(&mut self, recreate: bool) -> Result<(), EnvError> {
        if self.run_state.setup {
            return Ok(());
        }
        self.platform_check()?;
        let recreate = recreate || self.conf.get::<bool>("recreate")?;
        if recreate {
            self.clean(false)?;
        }

        let kind = Arc::clone(&self.kind);
        let mut env = scopeguard::guard(self, |env| {
            env.run_state.setup = true;
            env.run_state.clean = false;
        });
        match env.provision() {
            Ok(()) => {}
            Err(EnvError::Recreate(reason)) => {
                warn!("recreate env because {}", reason);
                env.clean(true)?;
                match env.provision() {
                    Ok(()) => {}
                    Err(e @ EnvError::Recreate(_)) => {
                        // A second request is fatal and leaves the environment not set up.
                        let _ = ScopeGuard::into_inner(env);
                        return Err(e);
                    }
                    Err(e) => return Err(e),
                }
            }
            Err(e) => return Err(e),
        }
        kind.done_with_setup(&mut env)
    }

    fn provision(&mut self) -> Result<(), EnvError> {
        self.setup_env()?;
        let kind = Arc::clone(&self.kind);
        kind.setup_with_env(self)
    }

    /// Tears the environment down once. The hook's failure is returned after the
    /// environment is already marked torn down.
    pub fn teardown(&mut self) -> Result<(), EnvError> {
        if self.run_state.teardown {
            return Ok(());
        }
        let kind = Arc::clone(&self.kind);
        let mut env = scopeguard::guard(self, |env| env.run_state.teardown = true);
        kind.teardown(&mut env)
    }

    /// Removes the environment folder and its fingerprints.
    pub fn clean(&mut self, force: bool) -> Result<(), EnvError> {
        if self.run_state.clean && !force {
            return Ok(());
        }
        let env_dir = self.env_dir()?;
        if env_dir.exists() {
            warn!("remove environment folder {}", env_dir.display());
            fs::remove_dir_all(&env_dir).map_err(io_error(format!("Could not remove '{}'", env_dir.display())))?;
        }
        self.cache.reset()?;
        self.run_state.setup = false;
        self.run_state.clean = true;
        Ok(())
    }

    fn platform_check(&self) -> Result<(), EnvError> {
        let pattern: String = self.conf.get("platform")?;
        if pattern.is_empty() {
            return Ok(());
        }
        let regex = Regex::new(&format!("^(?:{pattern})$")).map_err(|source| EnvError::Platform {
            pattern: pattern.clone(),
            source,
        })?;
        let platform = self.kind.runs_on_platform();
        if regex.is_match(platform) {
            Ok(())
        } else {
            Err(EnvError::Skip(format!("platform {} does not match {}", platform, pattern)))
        }
    }

    fn setup_env(&mut self) -> Result<(), EnvError> {
        let fingerprint = Fingerprint {
            name: self.conf.name().to_string(),
            kind: self.kind.id().to_string(),
        };
        let comparison = self.cache.compare(&fingerprint, ENVIRONMENT_FINGERPRINT_SECTION)?;
        if let Some(previous) = comparison.previous.filter(|_| !comparison.matches) {
            let current = serde_json::to_value(&fingerprint).map_err(InfoError::from)?;
            return Err(EnvError::Recreate(format!("env type changed from {} to {}", previous, current)));
        }
        self.handle_env_tmp_dir()
    }

    /// Makes sure the temporary folder exists and is empty.
    fn handle_env_tmp_dir(&self) -> Result<(), EnvError> {
        let tmp_dir = self.env_tmp_dir()?;
        let has_content = fs::read_dir(&tmp_dir).is_ok_and(|mut entries| entries.next().is_some());
        if has_content {
            debug!("clear env temp folder {}", tmp_dir.display());
            if let Err(e) = fs::remove_dir_all(&tmp_dir) {
                debug!("could not fully clear {}: {}", tmp_dir.display(), e);
            }
        }
        fs::create_dir_all(&tmp_dir).map_err(io_error(format!("Could not create '{}'", tmp_dir.display())))
    }

    /// The variables visible to subprocesses, resolved on first use.
    pub fn environment_variables(&mut self) -> Result<&IndexMap<String, String>, EnvError> {
        let (conf, kind, paths) = (&self.conf, &self.kind, &self.paths);
        self.env_vars.get_or_try_resolve(|| -> Result<_, EnvError> {
            let pass_env: Vec<String> = conf.get("pass_env")?;
            let table: toml::Table = conf.get("set_env")?;
            let set_env = SetEnv::from_table(kind.default_set_env(conf), &table)?;
            Ok(resolve_variables(&pass_env, &set_env, paths, &process_environment())?)
        })
    }

    pub fn paths(&self) -> &[PathBuf] {
        self.paths.paths()
    }

    /// Replaces the directories prepended to `PATH`. Already resolved variables keep their
    /// values; only their `PATH` entry is recomputed.
    pub fn set_paths(&mut self, paths: Vec<PathBuf>) {
        self.paths.replace(paths);
        let inherited = std::env::var(PATH_VARIABLE).ok();
        self.env_vars.invalidate_path_entry(&self.paths, inherited.as_deref());
    }

    /// Runs `cmd` to completion and returns its outcome.
    pub fn execute(
        &mut self,
        cmd: Vec<String>,
        stdin: StdinSource,
        show: Option<bool>,
        cwd: Option<PathBuf>,
        run_id: &str,
    ) -> Result<Outcome, EnvError> {
        let session = self.execute_async(cmd, stdin, show, cwd, run_id)?;
        while session.exit_code().is_none() {
            session.wait(None);
        }
        let outcome = session.outcome();
        drop(session);
        outcome.ok_or_else(|| EnvError::InvariantViolation(format!("'{}' finished without an outcome", run_id)))
    }

    /// Starts `cmd` and hands back a session bound to this environment. The session stays
    /// reachable by [`InterruptHandle::interrupt`] until it is dropped.
    pub fn execute_async(
        &mut self,
        cmd: Vec<String>,
        stdin: StdinSource,
        show: Option<bool>,
        cwd: Option<PathBuf>,
        run_id: &str,
    ) -> Result<ExecuteSession<'_>, EnvError> {
        if self.interrupt.is_interrupted() {
            return Err(EnvError::HardAbort);
        }
        let cwd = cwd.unwrap_or_else(|| self.conf.core().root.clone());
        let show = show.unwrap_or(self.options.verbosity > SHOW_OUTPUT_MIN_VERBOSITY);
        let env = self.environment_variables()?.clone();
        let request = ExecuteRequest::new(cmd, cwd, env, stdin, run_id)?;
        warn!("{}{}> {}", run_id, self.cwd_hint(request.cwd()), request.shell_cmd());

        let status = self.kind.executor().call(request, show, self.log_handler.out_err())?;
        let id = Uuid::new_v4();
        if !self.interrupt.register(id, Arc::clone(&status)) {
            status.interrupt();
        }
        Ok(ExecuteSession {
            env: self,
            id,
            status,
            show,
            run_id: run_id.to_string(),
        })
    }

    fn cwd_hint(&self, cwd: &Path) -> String {
        let invocation_dir = &self.conf.core().invocation_dir;
        if cwd == invocation_dir {
            return String::new();
        }
        match cwd.strip_prefix(invocation_dir) {
            Ok(relative) => format!(" {}", relative.display()),
            Err(_) => format!(" {}", cwd.display()),
        }
    }

    /// Interrupts the environment. See [`InterruptHandle::interrupt`].
    pub fn interrupt(&self) {
        self.interrupt.interrupt();
    }

    /// Activates the log context of the environment and, with `suspend`, captures its output
    /// until the returned guard is dropped. Repeated suspensions append to the same buffers.
    pub fn display_context(&mut self, suspend: bool) -> DisplayContext {
        let context = self.log_handler.with_context(self.conf.name());
        let suspension = self
            .log_handler
            .suspend_out_err(suspend, self.suspended_out_err.clone());
        if suspend {
            self.suspended_out_err = Some(suspension.out_err().clone());
        }
        DisplayContext {
            _suspension: suspension,
            _context: context,
        }
    }

    /// Takes the captured output out of the environment, if it was ever suspended.
    pub fn close_and_read_out_err(&mut self) -> Option<(Vec<u8>, Vec<u8>)> {
        self.suspended_out_err.take().map(|out_err| out_err.contents())
    }

    pub fn has_display_suspended(&self) -> bool {
        self.suspended_out_err.is_some()
    }
}

fn register_config(conf: &mut ConfigSet, kind: &dyn EnvironmentKind) {
    let name = conf.name().to_string();
    conf.add_constant(&["env_name", "envname"], "the name of the environment", toml::Value::from(name));
    conf.add_config(
        &["env_dir", "envdir"],
        "directory assigned to the environment",
        ConfigDefault::Computed(Box::new(|c| path_value(&c.core().work_dir.join(c.name())))),
        None,
    );
    conf.add_config(
        &["env_tmp_dir", "envtmpdir"],
        "a folder that is always reset at the start of the run",
        ConfigDefault::Computed(Box::new(|c| path_value(&c.core().work_dir.join(c.name()).join("tmp")))),
        None,
    );
    conf.add_config(
        &["platform"],
        "run on platforms that match this regular expression (empty means any platform)",
        toml::Value::from(""),
        None,
    );
    let default_pass_env = kind.default_pass_env();
    conf.add_config(
        &["pass_env", "passenv"],
        "environment variables to pass on to the environment",
        toml::Value::Array(Vec::new()),
        Some(Box::new(move |value| match value.clone().try_into::<Vec<String>>() {
            Ok(mut names) => {
                names.extend(default_pass_env.iter().cloned());
                names.sort();
                names.dedup();
                toml::Value::from(names)
            }
            // Left as-is so that reading it reports the invalid value.
            Err(_) => value,
        })),
    );
    conf.add_config(
        &["parallel_show_output"],
        "if set the output is always shown when running in parallel mode",
        toml::Value::from(false),
        None,
    );
    conf.add_config(
        &["recreate"],
        "always recreate the environment if this option is true",
        toml::Value::from(false),
        None,
    );
    conf.add_config(
        &["set_env", "setenv"],
        "environment variables to set when running commands",
        toml::Value::Table(toml::Table::new()),
        None,
    );
}

fn path_value(path: &Path) -> toml::Value {
    toml::Value::from(path.display().to_string())
}

fn absolute(conf: &ConfigSet, path: PathBuf) -> PathBuf {
    if path.is_absolute() {
        path
    } else {
        conf.core().root.join(path)
    }
}

fn env_dir_of(conf: &ConfigSet) -> Result<PathBuf, EnvError> {
    let dir: PathBuf = conf.get("env_dir")?;
    Ok(absolute(conf, dir))
}

/// The log context and optional output suspension of an environment.
#[derive(Debug)]
pub struct DisplayContext {
    _suspension: SuspendGuard,
    _context: ContextGuard,
}

/// A running command of an environment.
///
/// Dereferences to its live status. Dropping the session waits for the command to finish,
/// removes it from the interrupt registry, and records its outcome.
#[derive(Debug)]
pub struct ExecuteSession<'a> {
    env: &'a mut Environment,
    id: Uuid,
    status: Arc<dyn ExecuteStatus>,
    show: bool,
    run_id: String,
}

impl Deref for ExecuteSession<'_> {
    type Target = dyn ExecuteStatus;

    fn deref(&self) -> &Self::Target {
        self.status.as_ref()
    }
}

impl Drop for ExecuteSession<'_> {
    fn drop(&mut self) {
        // Closing first keeps the status interruptible while it is being awaited.
        self.status.close();
        self.env.interrupt.deregister(&self.id);

        if let Some(outcome) = self.status.outcome() {
            if let Some(journal) = &self.env.journal {
                journal.add_execute(&outcome, &self.run_id);
            }
            if self.show {
                self.env.visible_outcomes.push(outcome);
            }
        }
    }
}
