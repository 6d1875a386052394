// src/constants.rs

/// The name of the project configuration file, searched upwards from the invocation directory.
pub const PROJECT_CONFIG_FILENAME: &str = "testbed.toml";

/// The default work directory (relative to the project root) holding all environment folders.
pub const DEFAULT_WORK_DIR: &str = ".testbed";

/// The name of the fingerprint file stored inside every environment folder.
pub const ENV_INFO_FILENAME: &str = ".testbed-info.json";

/// The info-store section under which an environment records its own identity.
pub const ENVIRONMENT_FINGERPRINT_SECTION: &str = "Environment";

/// The info-store section under which the commands installer records what it installed.
pub const INSTALLER_FINGERPRINT_SECTION: &str = "installer";

/// The search-path variable managed by the path set.
pub const PATH_VARIABLE: &str = "PATH";

/// Subprocess output is shown live when the verbosity is strictly above this level.
pub const SHOW_OUTPUT_MIN_VERBOSITY: u8 = 3;

/// The verbosity used when neither `-v` nor `-q` is given.
pub const DEFAULT_VERBOSITY: u8 = 2;

/// Default seconds between SIGINT and SIGTERM when interrupting a subprocess.
pub const DEFAULT_INTERRUPT_TIMEOUT: f64 = 0.3;

/// Default seconds between SIGTERM and SIGKILL when interrupting a subprocess.
pub const DEFAULT_TERMINATE_TIMEOUT: f64 = 0.2;

/// Process exit code used when the run was interrupted (shell convention for SIGINT).
pub const INTERRUPTED_EXIT_CODE: i32 = 130;
