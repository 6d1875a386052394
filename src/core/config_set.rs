//! # Config Set
//!
//! A per-environment key-value store. Keys are *registered* by the components that own them
//! (the lifecycle engine, the runner kind) with a default, a description and an optional
//! post-processor. Values are read from the environment's own table first, then from the
//! shared `[env_defaults]` table, then from the registered default, and are memoized once
//! loaded.

use crate::models::CoreConfig;
use serde::de::DeserializeOwned;
use std::cell::RefCell;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Configuration key '{key}' is not defined for environment '{env}'.")]
    UnknownKey { env: String, key: String },
    #[error("Configuration key '{key}' of environment '{env}' has an invalid value: {source}")]
    InvalidValue {
        env: String,
        key: String,
        #[source]
        source: toml::de::Error,
    },
    #[error("Environment '{0}' is not defined in the configuration.")]
    UnknownEnvironment(String),
    #[error("Environment '{env}' uses unknown runner '{runner}' (expected 'local' or 'system').")]
    UnknownRunner { env: String, runner: String },
}

/// Computes a default value lazily, with access to the rest of the set.
pub type DefaultFn = Box<dyn Fn(&ConfigSet) -> toml::Value + Send + Sync>;

/// Transforms a loaded value before it is converted to its final type.
pub type PostProcess = Box<dyn Fn(toml::Value) -> toml::Value + Send + Sync>;

/// Where the value of a definition comes from when the configuration does not set it.
pub enum ConfigDefault {
    Value(toml::Value),
    Computed(DefaultFn),
}

impl From<toml::Value> for ConfigDefault {
    fn from(value: toml::Value) -> Self {
        Self::Value(value)
    }
}

impl fmt::Debug for ConfigDefault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Value(v) => f.debug_tuple("Value").field(v).finish(),
            Self::Computed(_) => f.write_str("Computed(..)"),
        }
    }
}

/// A registered configuration key.
pub struct ConfigDefinition {
    /// The primary key followed by its aliases.
    pub keys: Vec<String>,
    pub desc: String,
    default: ConfigDefault,
    post_process: Option<PostProcess>,
    /// Constants ignore the configuration files entirely.
    constant: bool,
}

impl ConfigDefinition {
    /// The canonical key name.
    pub fn key(&self) -> &str {
        self.keys.first().map(String::as_str).unwrap_or_default()
    }

    fn matches(&self, key: &str) -> bool {
        self.keys.iter().any(|k| k == key)
    }
}

impl fmt::Debug for ConfigDefinition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConfigDefinition")
            .field("keys", &self.keys)
            .field("desc", &self.desc)
            .field("default", &self.default)
            .field("constant", &self.constant)
            .finish_non_exhaustive()
    }
}

/// The configuration of a single environment.
#[derive(Debug)]
pub struct ConfigSet {
    name: String,
    raw: toml::Table,
    base: toml::Table,
    core: Arc<CoreConfig>,
    definitions: Vec<ConfigDefinition>,
    loaded: RefCell<HashMap<String, toml::Value>>,
}

impl ConfigSet {
    /// Creates a set for environment `name` from its raw table and the shared base table.
    pub fn new(name: impl Into<String>, raw: toml::Table, base: toml::Table, core: Arc<CoreConfig>) -> Self {
        Self {
            name: name.into(),
            raw,
            base,
            core,
            definitions: Vec::new(),
            loaded: RefCell::new(HashMap::new()),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn core(&self) -> &CoreConfig {
        &self.core
    }

    /// Registers a key. Re-registering an existing key replaces the earlier definition.
    pub fn add_config(
        &mut self,
        keys: &[&str],
        desc: &str,
        default: impl Into<ConfigDefault>,
        post_process: Option<PostProcess>,
    ) {
        self.push_definition(ConfigDefinition {
            keys: keys.iter().map(|k| (*k).to_string()).collect(),
            desc: desc.to_string(),
            default: default.into(),
            post_process,
            constant: false,
        });
    }

    /// Registers a key whose value can not be changed by configuration.
    pub fn add_constant(&mut self, keys: &[&str], desc: &str, value: toml::Value) {
        self.push_definition(ConfigDefinition {
            keys: keys.iter().map(|k| (*k).to_string()).collect(),
            desc: desc.to_string(),
            default: ConfigDefault::Value(value),
            post_process: None,
            constant: true,
        });
    }

    fn push_definition(&mut self, definition: ConfigDefinition) {
        self.definitions.retain(|d| !d.matches(definition.key()));
        self.loaded.borrow_mut().remove(definition.key());
        self.definitions.push(definition);
    }

    /// Whether `key` (or one of its aliases) has been registered.
    pub fn contains(&self, key: &str) -> bool {
        self.definition(key).is_some()
    }

    /// The canonical name of `key`, which may be an alias.
    pub fn primary_key(&self, key: &str) -> Option<&str> {
        self.definition(key).map(ConfigDefinition::key)
    }

    /// Registered definitions, in registration order.
    pub fn definitions(&self) -> impl Iterator<Item = &ConfigDefinition> {
        self.definitions.iter()
    }

    /// Keys of the environment's own table that no definition claims.
    pub fn unused(&self) -> Vec<&str> {
        self.raw
            .keys()
            .filter(|key| !self.contains(key))
            .map(String::as_str)
            .collect()
    }

    fn definition(&self, key: &str) -> Option<&ConfigDefinition> {
        self.definitions.iter().find(|d| d.matches(key))
    }

    /// Loads the value of `key` and converts it to `T`.
    pub fn get<T: DeserializeOwned>(&self, key: &str) -> Result<T, ConfigError> {
        let value = self.get_value(key)?;
        value.try_into().map_err(|source| ConfigError::InvalidValue {
            env: self.name.clone(),
            key: key.to_string(),
            source,
        })
    }

    /// Loads the raw (post-processed) value of `key`.
    pub fn get_value(&self, key: &str) -> Result<toml::Value, ConfigError> {
        let definition = self.definition(key).ok_or_else(|| ConfigError::UnknownKey {
            env: self.name.clone(),
            key: key.to_string(),
        })?;
        let canonical = definition.key().to_string();
        if let Some(value) = self.loaded.borrow().get(&canonical) {
            return Ok(value.clone());
        }

        let configured = if definition.constant {
            None
        } else {
            // Every alias in the environment's own table beats every alias in the base.
            [&self.raw, &self.base]
                .into_iter()
                .find_map(|table| definition.keys.iter().find_map(|k| table.get(k)))
                .cloned()
        };
        let value = match configured {
            Some(value) => value,
            None => match &definition.default {
                ConfigDefault::Value(value) => value.clone(),
                ConfigDefault::Computed(compute) => compute(self),
            },
        };
        let value = match &definition.post_process {
            Some(post_process) => post_process(value),
            None => value,
        };

        log::trace!("[{}] loaded {} = {}", self.name, canonical, value);
        self.loaded.borrow_mut().insert(canonical, value.clone());
        Ok(value)
    }
}

/// Renders a configuration value for humans: strings as-is, lists one item per line.
pub fn stringify(value: &toml::Value) -> String {
    match value {
        toml::Value::String(s) => s.clone(),
        toml::Value::Array(items) => {
            let lines: Vec<String> = items.iter().map(stringify).collect();
            if lines.is_empty() {
                String::new()
            } else {
                format!("\n  {}", lines.join("\n  "))
            }
        }
        toml::Value::Table(table) => {
            let lines: Vec<String> = table
                .iter()
                .map(|(k, v)| format!("{}={}", k, stringify(v)))
                .collect();
            if lines.is_empty() {
                String::new()
            } else {
                format!("\n  {}", lines.join("\n  "))
            }
        }
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::{Path, PathBuf};

    fn table(raw: &str) -> toml::Table {
        toml::from_str(raw).unwrap()
    }

    fn core() -> Arc<CoreConfig> {
        Arc::new(CoreConfig::for_root(Path::new("/project")))
    }

    #[test]
    fn test_get_prefers_own_table_then_base_then_default() {
        let mut conf = ConfigSet::new(
            "unit",
            table("platform = 'linux'"),
            table("platform = 'macos'\nrecreate = true"),
            core(),
        );
        conf.add_config(&["platform"], "platform regex", toml::Value::from(""), None);
        conf.add_config(&["recreate"], "always recreate", toml::Value::from(false), None);
        conf.add_config(&["parallel_show_output"], "show output", toml::Value::from(false), None);

        assert_eq!(conf.get::<String>("platform").unwrap(), "linux");
        assert!(conf.get::<bool>("recreate").unwrap());
        assert!(!conf.get::<bool>("parallel_show_output").unwrap());
    }

    #[test]
    fn test_aliases_and_computed_defaults() {
        let mut conf = ConfigSet::new("unit", table("envdir = '/x'"), toml::Table::new(), core());
        conf.add_config(
            &["env_dir", "envdir"],
            "environment folder",
            ConfigDefault::Computed(Box::new(|c| {
                toml::Value::from(c.core().work_dir.join(c.name()).display().to_string())
            })),
            None,
        );
        conf.add_config(
            &["env_tmp_dir"],
            "temp folder",
            ConfigDefault::Computed(Box::new(|c| {
                toml::Value::from(c.core().work_dir.join(c.name()).join("tmp").display().to_string())
            })),
            None,
        );

        assert_eq!(conf.get::<PathBuf>("envdir").unwrap(), PathBuf::from("/x"));
        assert_eq!(conf.primary_key("envdir"), Some("env_dir"));
        assert_eq!(
            conf.get::<PathBuf>("env_tmp_dir").unwrap(),
            PathBuf::from("/project/.testbed/unit/tmp")
        );
    }

    #[test]
    fn test_alias_in_own_table_beats_primary_key_in_base() {
        let mut conf = ConfigSet::new(
            "unit",
            table("envdir = 'from-env'"),
            table("env_dir = 'from-defaults'"),
            core(),
        );
        conf.add_config(&["env_dir", "envdir"], "environment folder", toml::Value::from("default"), None);

        assert_eq!(conf.get::<String>("env_dir").unwrap(), "from-env");
    }

    #[test]
    fn test_post_process_and_constants() {
        let mut conf = ConfigSet::new(
            "unit",
            table("pass_env = ['B', 'A']\nenv_name = 'spoofed'"),
            toml::Table::new(),
            core(),
        );
        conf.add_constant(&["env_name"], "name", toml::Value::from("unit"));
        conf.add_config(
            &["pass_env"],
            "passthrough",
            toml::Value::Array(Vec::new()),
            Some(Box::new(|value| {
                let mut items: Vec<String> = value.try_into().unwrap_or_default();
                items.push("A".to_string());
                items.sort();
                items.dedup();
                toml::Value::from(items)
            })),
        );

        assert_eq!(conf.get::<String>("env_name").unwrap(), "unit");
        assert_eq!(conf.get::<Vec<String>>("pass_env").unwrap(), vec!["A", "B"]);
        assert!(conf.contains("pass_env"));
        assert!(conf.unused().is_empty());
    }

    #[test]
    fn test_unused_lists_unclaimed_keys() {
        let mut conf = ConfigSet::new("unit", table("platform = 'x'\ntypo = 1"), toml::Table::new(), core());
        conf.add_config(&["platform"], "platform regex", toml::Value::from(""), None);

        assert_eq!(conf.unused(), vec!["typo"]);
    }

    #[test]
    fn test_unknown_and_invalid_keys() {
        let mut conf = ConfigSet::new("unit", table("recreate = 'yes'"), toml::Table::new(), core());
        conf.add_config(&["recreate"], "always recreate", toml::Value::from(false), None);

        assert!(matches!(conf.get::<bool>("nope"), Err(ConfigError::UnknownKey { .. })));
        assert!(matches!(conf.get::<bool>("recreate"), Err(ConfigError::InvalidValue { .. })));
    }

    #[test]
    fn test_stringify_lists() {
        let value = toml::Value::from(vec!["a", "b"]);
        assert_eq!(stringify(&value), "\n  a\n  b");
        assert_eq!(stringify(&toml::Value::from(true)), "true");
    }
}
