// src/core/info.rs

use crate::constants::ENV_INFO_FILENAME;
use log::debug;
use serde::Serialize;
use serde_json::{Map, Value};
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum InfoError {
    #[error("Could not write environment info file '{path}': {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("Failed to serialize environment info: {0}")]
    Json(#[from] serde_json::Error),
}

/// Result of comparing a candidate fingerprint against the stored one.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Comparison {
    /// `true` when the stored value equals the candidate, or when nothing was stored yet.
    pub matches: bool,
    /// The stored value, if any, as it was before the comparison.
    pub previous: Option<Value>,
}

/// Persistent fingerprints of one environment, stored as JSON inside its folder.
///
/// A section that has never been written is treated as matching anything: the first
/// comparison stores the candidate as the baseline. A stored section is never replaced by a
/// comparison; only [`Info::reset`] or [`Info::remove`] discards it.
#[derive(Debug)]
pub struct Info {
    path: PathBuf,
    content: Map<String, Value>,
}

impl Info {
    /// Loads the info file of `env_dir`. A missing or unreadable file yields an empty store.
    pub fn new(env_dir: &Path) -> Self {
        let path = env_dir.join(ENV_INFO_FILENAME);
        let content = match fs::read_to_string(&path) {
            Ok(text) => match serde_json::from_str::<Map<String, Value>>(&text) {
                Ok(content) => content,
                Err(e) => {
                    debug!("Ignoring invalid info file '{}': {}", path.display(), e);
                    Map::new()
                }
            },
            Err(_) => Map::new(),
        };
        Self { path, content }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Compares `candidate` with the value stored under `section`.
    pub fn compare<T: Serialize + ?Sized>(&mut self, candidate: &T, section: &str) -> Result<Comparison, InfoError> {
        let candidate = serde_json::to_value(candidate)?;
        match self.content.get(section) {
            Some(previous) => Ok(Comparison {
                matches: *previous == candidate,
                previous: Some(previous.clone()),
            }),
            None => {
                debug!("Storing first {} fingerprint in '{}'", section, self.path.display());
                self.content.insert(section.to_string(), candidate);
                self.write()?;
                Ok(Comparison {
                    matches: true,
                    previous: None,
                })
            }
        }
    }

    /// Discards a single section.
    pub fn remove(&mut self, section: &str) -> Result<(), InfoError> {
        if self.content.remove(section).is_some() {
            self.write()?;
        }
        Ok(())
    }

    /// Discards every stored fingerprint.
    pub fn reset(&mut self) -> Result<(), InfoError> {
        self.content.clear();
        match fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(source) => Err(InfoError::Io {
                path: self.path.clone(),
                source,
            }),
        }
    }

    fn write(&self) -> Result<(), InfoError> {
        let io_error = |source| InfoError::Io {
            path: self.path.clone(),
            source,
        };
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).map_err(io_error)?;
        }
        let text = serde_json::to_string_pretty(&self.content)?;
        fs::write(&self.path, text).map_err(io_error)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::tempdir;

    #[test]
    fn test_first_compare_stores_the_baseline() {
        let dir = tempdir().unwrap();
        let env_dir = dir.path().join("unit");
        let mut info = Info::new(&env_dir);

        let first = info.compare(&json!({"name": "unit", "type": "local"}), "Environment").unwrap();
        assert_eq!(first, Comparison { matches: true, previous: None });
        assert!(info.path().exists());

        let reloaded = Info::new(&env_dir);
        assert_eq!(reloaded.content.get("Environment"), Some(&json!({"name": "unit", "type": "local"})));
    }

    #[test]
    fn test_identical_candidate_matches_without_rewrite() {
        let dir = tempdir().unwrap();
        let mut info = Info::new(dir.path());
        let fingerprint = json!({"name": "unit", "type": "local"});
        info.compare(&fingerprint, "Environment").unwrap();
        let written = fs::metadata(info.path()).unwrap().modified().unwrap();

        let again = info.compare(&fingerprint, "Environment").unwrap();
        assert!(again.matches);
        assert_eq!(again.previous, Some(fingerprint));
        assert_eq!(fs::metadata(info.path()).unwrap().modified().unwrap(), written);
    }

    #[test]
    fn test_mismatch_keeps_previous_until_reset() {
        let dir = tempdir().unwrap();
        let mut info = Info::new(dir.path());
        info.compare(&json!({"type": "local"}), "Environment").unwrap();

        for _ in 0..2 {
            let changed = info.compare(&json!({"type": "system"}), "Environment").unwrap();
            assert!(!changed.matches);
            assert_eq!(changed.previous, Some(json!({"type": "local"})));
        }

        info.reset().unwrap();
        assert!(!info.path().exists());
        let after_reset = info.compare(&json!({"type": "system"}), "Environment").unwrap();
        assert_eq!(after_reset, Comparison { matches: true, previous: None });
    }

    #[test]
    fn test_remove_only_drops_one_section() {
        let dir = tempdir().unwrap();
        let mut info = Info::new(dir.path());
        info.compare(&"abc", "installer").unwrap();
        info.compare(&"env", "Environment").unwrap();

        info.remove("installer").unwrap();
        let reloaded = Info::new(dir.path());
        assert!(reloaded.content.get("installer").is_none());
        assert!(reloaded.content.get("Environment").is_some());
    }

    #[test]
    fn test_invalid_file_is_ignored() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join(ENV_INFO_FILENAME), "not json").unwrap();

        let mut info = Info::new(dir.path());
        assert!(info.compare(&1, "Environment").unwrap().matches);
    }
}
