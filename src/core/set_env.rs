// src/core/set_env.rs

use indexmap::IndexMap;
use thiserror::Error;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum SetEnvError {
    #[error("Variable '{0}' is not part of set_env.")]
    UnknownKey(String),
    #[error("Circular reference while expanding set_env variable '{0}'.")]
    Cycle(String),
    #[error("Value of set_env variable '{key}' must be a string, found: {found}")]
    NotAString { key: String, found: String },
}

/// The explicit override mapping of an environment.
///
/// Values may reference other variables with `$NAME` or `${NAME}`. References are expanded
/// only when a value is loaded: first against the mapping resolved so far, then against the
/// other overrides (loaded on demand), then against the given process environment.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SetEnv {
    raw: IndexMap<String, String>,
}

impl SetEnv {
    /// Layers `configured` over the runner-provided `defaults`, keeping first-seen order.
    pub fn new(
        defaults: impl IntoIterator<Item = (String, String)>,
        configured: impl IntoIterator<Item = (String, String)>,
    ) -> Self {
        let mut raw: IndexMap<String, String> = defaults.into_iter().collect();
        raw.extend(configured);
        Self { raw }
    }

    /// Builds the mapping from a `set_env` TOML table. Numbers and booleans are accepted
    /// and rendered as text.
    pub fn from_table(
        defaults: impl IntoIterator<Item = (String, String)>,
        table: &toml::Table,
    ) -> Result<Self, SetEnvError> {
        let configured = table
            .iter()
            .map(|(key, value)| {
                let text = match value {
                    toml::Value::String(s) => s.clone(),
                    toml::Value::Integer(_) | toml::Value::Float(_) | toml::Value::Boolean(_) => value.to_string(),
                    other => {
                        return Err(SetEnvError::NotAString {
                            key: key.clone(),
                            found: other.type_str().to_string(),
                        });
                    }
                };
                Ok((key.clone(), text))
            })
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self::new(defaults, configured))
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.raw.keys().map(String::as_str)
    }

    pub fn is_empty(&self) -> bool {
        self.raw.is_empty()
    }

    /// Loads the expanded value of `key`, given the variables resolved so far and the
    /// process environment unknown references fall back to.
    pub fn load(
        &self,
        key: &str,
        resolved: &IndexMap<String, String>,
        process_env: &IndexMap<String, String>,
    ) -> Result<String, SetEnvError> {
        let mut stack = Vec::new();
        self.load_inner(key, resolved, process_env, &mut stack)
    }

    fn load_inner(
        &self,
        key: &str,
        resolved: &IndexMap<String, String>,
        process_env: &IndexMap<String, String>,
        stack: &mut Vec<String>,
    ) -> Result<String, SetEnvError> {
        let raw = self
            .raw
            .get(key)
            .ok_or_else(|| SetEnvError::UnknownKey(key.to_string()))?;
        if stack.iter().any(|k| k == key) {
            return Err(SetEnvError::Cycle(key.to_string()));
        }
        stack.push(key.to_string());

        let expanded = shellexpand::env_with_context(raw, |name: &str| -> Result<Option<String>, SetEnvError> {
            // A self reference (PATH=/x:$PATH) means "the value before this override".
            if let Some(value) = resolved.get(name) {
                return Ok(Some(value.clone()));
            }
            if name != key && self.raw.contains_key(name) {
                return self.load_inner(name, resolved, process_env, stack).map(Some);
            }
            Ok(process_env.get(name).cloned())
        })
        .map_err(|e| e.cause)?
        .into_owned();

        stack.pop();
        Ok(expanded)
    }
}
