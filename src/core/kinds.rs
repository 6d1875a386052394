//! # Runner Kinds
//!
//! An [`EnvironmentKind`] is the capability set an environment is built from: which executor
//! runs its commands, which installer provisions it, and which platform it runs on. The
//! lifecycle engine only talks to this trait; `local` and `system` are the two variants
//! selectable with the `runner` key.

use crate::core::config_set::{ConfigDefault, ConfigError, ConfigSet};
use crate::core::environment::{EnvError, Environment};
use crate::core::installer::{CommandsInstaller, Installer};
use crate::models::CoreConfig;
use crate::system::executor::{Execute, LocalSubProcessExecutor};
use lazy_static::lazy_static;
use std::fmt;
use std::io::IsTerminal;
use std::path::PathBuf;
use std::sync::Arc;

lazy_static! {
    /// Variables every environment receives from the process environment unless configured
    /// otherwise.
    static ref DEFAULT_PASS_ENV: Vec<&'static str> = {
        let mut env = vec![
            "https_proxy",     // HTTP proxy configuration
            "http_proxy",      // HTTP proxy configuration
            "no_proxy",        // HTTP proxy configuration
            "LANG",            // localization
            "LANGUAGE",        // localization
            "CURL_CA_BUNDLE",  // curl certificates
            "SSL_CERT_FILE",   // https certificates
            "LD_LIBRARY_PATH", // location of libs
        ];
        if cfg!(windows) {
            env.extend(["TEMP", "TMP", "USERPROFILE", "PATHEXT", "MSYSTEM"]);
        } else {
            env.push("TMPDIR");
        }
        env
    };
}

/// The default passthrough list, plus `TERM` when attached to a terminal.
pub fn default_pass_env() -> Vec<String> {
    let mut env: Vec<String> = DEFAULT_PASS_ENV.iter().map(|name| (*name).to_string()).collect();
    if std::io::stdout().is_terminal() {
        env.push("TERM".to_string());
    }
    env
}

/// The capability set of an environment variant.
pub trait EnvironmentKind: Send + Sync + fmt::Debug {
    /// The runner name, also recorded in the environment fingerprint.
    fn id(&self) -> &'static str;

    fn executor(&self) -> &dyn Execute;

    fn installer(&self) -> Option<&dyn Installer>;

    /// The platform identifier matched against the `platform` key.
    fn runs_on_platform(&self) -> &str {
        std::env::consts::OS
    }

    /// Registers the configuration keys this variant owns.
    fn register_config(&self, _conf: &mut ConfigSet) {}

    fn default_pass_env(&self) -> Vec<String> {
        default_pass_env()
    }

    /// Overrides placed underneath the configured `set_env`.
    fn default_set_env(&self, _conf: &ConfigSet) -> Vec<(String, String)> {
        Vec::new()
    }

    /// Provisions the environment once its folders exist.
    fn setup_with_env(&self, env: &mut Environment) -> Result<(), EnvError> {
        match self.installer() {
            Some(installer) => installer.install(env),
            None => Ok(()),
        }
    }

    fn done_with_setup(&self, _env: &mut Environment) -> Result<(), EnvError> {
        Ok(())
    }

    fn teardown(&self, _env: &mut Environment) -> Result<(), EnvError> {
        Ok(())
    }
}

/// Keys read by [`crate::core::runner::run_environment`], shared by every runner.
fn register_run_config(conf: &mut ConfigSet) {
    let empty = || toml::Value::Array(Vec::new());
    conf.add_config(&["commands_pre"], "the commands to be called before testing", empty(), None);
    conf.add_config(&["commands"], "the commands to be called for testing", empty(), None);
    conf.add_config(&["commands_post"], "the commands to be called after testing", empty(), None);
    conf.add_config(
        &["change_dir", "changedir"],
        "change to this working directory when executing the test command",
        ConfigDefault::Computed(Box::new(|c| toml::Value::from(c.core().root.display().to_string()))),
        None,
    );
    conf.add_config(
        &["ignore_errors"],
        "when executing the commands keep going even if a sub-command exits with non-zero exit code",
        toml::Value::from(false),
        None,
    );
}

/// Runs commands directly on the host, after running its `install_commands` once.
///
/// Binaries installed into `<env_dir>/bin` are put first on the `PATH` of later commands.
#[derive(Debug)]
pub struct LocalRunner {
    executor: LocalSubProcessExecutor,
    installer: CommandsInstaller,
}

impl LocalRunner {
    pub fn new(core: &CoreConfig) -> Self {
        Self {
            executor: LocalSubProcessExecutor::new(core.interrupt_timeout, core.terminate_timeout),
            installer: CommandsInstaller,
        }
    }
}

impl EnvironmentKind for LocalRunner {
    fn id(&self) -> &'static str {
        "local"
    }

    fn executor(&self) -> &dyn Execute {
        &self.executor
    }

    fn installer(&self) -> Option<&dyn Installer> {
        Some(&self.installer)
    }

    fn register_config(&self, conf: &mut ConfigSet) {
        register_run_config(conf);
        conf.add_config(
            &["install_commands"],
            "the commands that provision the environment, run once per fingerprint",
            toml::Value::Array(Vec::new()),
            None,
        );
    }

    fn default_set_env(&self, conf: &ConfigSet) -> Vec<(String, String)> {
        let mut env = vec![("TESTBED_ENV_NAME".to_string(), conf.name().to_string())];
        if let Ok(env_dir) = conf.get::<PathBuf>("env_dir") {
            env.push(("TESTBED_ENV_DIR".to_string(), env_dir.display().to_string()));
        }
        env
    }

    fn setup_with_env(&self, env: &mut Environment) -> Result<(), EnvError> {
        self.installer.install(env)?;
        let bin_dir = env.env_dir()?.join("bin");
        env.set_paths(vec![bin_dir]);
        Ok(())
    }
}

/// Runs commands directly on the host without any provisioning.
#[derive(Debug)]
pub struct SystemRunner {
    executor: LocalSubProcessExecutor,
}

impl SystemRunner {
    pub fn new(core: &CoreConfig) -> Self {
        Self {
            executor: LocalSubProcessExecutor::new(core.interrupt_timeout, core.terminate_timeout),
        }
    }
}

impl EnvironmentKind for SystemRunner {
    fn id(&self) -> &'static str {
        "system"
    }

    fn executor(&self) -> &dyn Execute {
        &self.executor
    }

    fn installer(&self) -> Option<&dyn Installer> {
        None
    }

    fn register_config(&self, conf: &mut ConfigSet) {
        register_run_config(conf);
    }
}

/// Registers the `runner` key on `conf` and builds the variant it names.
pub fn kind_of(conf: &mut ConfigSet) -> Result<Arc<dyn EnvironmentKind>, ConfigError> {
    conf.add_config(&["runner"], "the runner used for the environment", toml::Value::from("local"), None);
    let runner: String = conf.get("runner")?;
    let core = conf.core();
    match runner.as_str() {
        "local" => Ok(Arc::new(LocalRunner::new(core))),
        "system" => Ok(Arc::new(SystemRunner::new(core))),
        _ => Err(ConfigError::UnknownRunner {
            env: conf.name().to_string(),
            runner,
        }),
    }
}
