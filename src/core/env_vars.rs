//! # Environment Variables
//!
//! Computes the variables visible to an environment's subprocesses, in a fixed order:
//!
//! 1. literal `pass_env` names present in the process environment,
//! 2. every process variable whose name matches a `pass_env` glob,
//! 3. the search path (`PATH`), built from the environment's [`PathSet`],
//! 4. the explicit `set_env` overrides, which see (and may replace) everything above.
//!
//! The result is memoized in a [`VariableCache`]; only the `PATH` entry is ever refreshed.

use crate::constants::PATH_VARIABLE;
use crate::core::path_set::PathSet;
use crate::core::set_env::{SetEnv, SetEnvError};
use indexmap::IndexMap;
use regex::Regex;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum VariableError {
    #[error("Invalid pass_env pattern '{pattern}': {source}")]
    Glob {
        pattern: String,
        #[source]
        source: regex::Error,
    },
    #[error(transparent)]
    SetEnv(#[from] SetEnvError),
}

/// The `pass_env` list, split into literal names and glob patterns.
#[derive(Debug, Clone)]
pub struct PassEnv {
    literal: Vec<String>,
    globs: Vec<Regex>,
}

impl PassEnv {
    /// Any entry containing `*` is a glob; `*` matches any sequence of characters.
    /// Like a prefix match, a glob only has to match from the start of the name.
    pub fn parse(patterns: &[String]) -> Result<Self, VariableError> {
        let mut literal = Vec::new();
        let mut globs = Vec::new();
        for pattern in patterns {
            if pattern.contains('*') {
                let body = pattern
                    .split('*')
                    .map(regex::escape)
                    .collect::<Vec<_>>()
                    .join(".*");
                let regex = Regex::new(&format!("^{body}")).map_err(|source| VariableError::Glob {
                    pattern: pattern.clone(),
                    source,
                })?;
                globs.push(regex);
            } else {
                literal.push(pattern.clone());
            }
        }
        Ok(Self { literal, globs })
    }

    /// Copies the selected variables out of `process_env`. Globs are matched against every
    /// process variable, not only names known in advance.
    pub fn select(&self, process_env: &IndexMap<String, String>) -> IndexMap<String, String> {
        let mut selected = IndexMap::new();
        for name in &self.literal {
            if let Some(value) = process_env.get(name) {
                selected.insert(name.clone(), value.clone());
            }
        }
        if !self.globs.is_empty() {
            for (name, value) in process_env {
                if self.globs.iter().any(|g| g.is_match(name)) {
                    selected.insert(name.clone(), value.clone());
                }
            }
        }
        selected
    }
}

/// Resolves the complete variable mapping of an environment.
pub fn resolve_variables(
    pass_env: &[String],
    set_env: &SetEnv,
    paths: &PathSet,
    process_env: &IndexMap<String, String>,
) -> Result<IndexMap<String, String>, VariableError> {
    let mut result = PassEnv::parse(pass_env)?.select(process_env);
    // PATH goes in before the overrides so that they can extend it.
    result.insert(
        PATH_VARIABLE.to_string(),
        paths.compute(process_env.get(PATH_VARIABLE).map(String::as_str)),
    );
    for key in set_env.keys() {
        let value = set_env.load(key, &result, process_env)?;
        result.insert(key.to_string(), value);
    }
    Ok(result)
}

/// The live process environment, in a form the resolver accepts.
pub fn process_environment() -> IndexMap<String, String> {
    std::env::vars().collect()
}

/// Memoized variable mapping of one environment.
#[derive(Debug, Default)]
pub struct VariableCache {
    resolved: Option<IndexMap<String, String>>,
}

impl VariableCache {
    pub fn get(&self) -> Option<&IndexMap<String, String>> {
        self.resolved.as_ref()
    }

    /// Returns the cached mapping, computing it with `resolve` on first use.
    pub fn get_or_try_resolve<E>(
        &mut self,
        resolve: impl FnOnce() -> Result<IndexMap<String, String>, E>,
    ) -> Result<&IndexMap<String, String>, E> {
        let resolved = match self.resolved.take() {
            Some(resolved) => resolved,
            None => resolve()?,
        };
        Ok(self.resolved.insert(resolved))
    }

    /// Recomputes the `PATH` entry in place after the path set changed. Nothing happens when
    /// the mapping has not been resolved yet; every other entry is left untouched.
    pub fn invalidate_path_entry(&mut self, paths: &PathSet, inherited: Option<&str>) {
        if let Some(resolved) = self.resolved.as_mut() {
            resolved.insert(PATH_VARIABLE.to_string(), paths.compute(inherited));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::path_set::PATH_SEPARATOR;
    use std::path::PathBuf;

    fn env(pairs: &[(&str, &str)]) -> IndexMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect()
    }

    fn overrides(pairs: &[(&str, &str)]) -> SetEnv {
        SetEnv::new(
            Vec::new(),
            pairs.iter().map(|(k, v)| ((*k).to_string(), (*v).to_string())),
        )
    }

    #[test]
    fn test_override_wins_over_glob_passthrough() {
        let process = env(&[("FOOBAR", "1"), ("OTHER", "x")]);
        let resolved = resolve_variables(
            &["FOO*".to_string()],
            &overrides(&[("FOOBAR", "2")]),
            &PathSet::default(),
            &process,
        )
        .unwrap();

        assert_eq!(resolved.get("FOOBAR").map(String::as_str), Some("2"));
        assert!(!resolved.contains_key("OTHER"));
    }

    #[test]
    fn test_literal_and_glob_passthrough() {
        let process = env(&[("HOME", "/home/u"), ("CI_JOB", "7"), ("CI_SHA", "abc"), ("XCI_NO", "n")]);
        let resolved = resolve_variables(
            &["HOME".to_string(), "MISSING".to_string(), "CI_*".to_string()],
            &SetEnv::default(),
            &PathSet::default(),
            &process,
        )
        .unwrap();

        let keys: Vec<_> = resolved.keys().map(String::as_str).collect();
        assert_eq!(keys, vec!["HOME", "CI_JOB", "CI_SHA", "PATH"]);
    }

    #[test]
    fn test_glob_escapes_regex_characters() {
        let pass = PassEnv::parse(&["A.B*".to_string()]).unwrap();
        let selected = pass.select(&env(&[("A.B1", "1"), ("AXB1", "2")]));

        assert!(selected.contains_key("A.B1"));
        assert!(!selected.contains_key("AXB1"));
    }

    #[test]
    fn test_path_is_computed_before_overrides() {
        let inherited = ["/usr/bin", "/bin"].join(&PATH_SEPARATOR.to_string());
        let process = env(&[("PATH", inherited.as_str())]);
        let paths = PathSet::new(vec![PathBuf::from("/env/bin")]);
        let sep = PATH_SEPARATOR;
        let resolved = resolve_variables(
            &[],
            &overrides(&[("PATH", format!("/tools{sep}${{PATH}}").as_str())]),
            &paths,
            &process,
        )
        .unwrap();

        assert_eq!(
            resolved.get("PATH").unwrap(),
            &["/tools", "/env/bin", "/usr/bin", "/bin"].join(&sep.to_string())
        );
    }

    #[test]
    fn test_cache_refreshes_only_the_path_entry() {
        let mut cache = VariableCache::default();
        cache.invalidate_path_entry(&PathSet::default(), None);
        assert!(cache.get().is_none());

        let mut calls = 0;
        cache
            .get_or_try_resolve(|| -> Result<_, VariableError> {
                calls += 1;
                Ok(env(&[("KEEP", "me"), ("PATH", "/old")]))
            })
            .unwrap();
        cache
            .get_or_try_resolve(|| -> Result<_, VariableError> {
                calls += 1;
                Ok(IndexMap::new())
            })
            .unwrap();
        assert_eq!(calls, 1);

        cache.invalidate_path_entry(&PathSet::new(vec![PathBuf::from("/new")]), Some("/usr/bin"));
        let resolved = cache.get().unwrap();
        assert_eq!(resolved.get("KEEP").map(String::as_str), Some("me"));
        assert_eq!(
            resolved.get("PATH").unwrap(),
            &["/new", "/usr/bin"].join(&PATH_SEPARATOR.to_string())
        );
    }
}
