// src/core/journal.rs

use crate::system::executor::Outcome;
use crate::system::lock;
use indexmap::IndexMap;
use serde::Serialize;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::{Duration, UNIX_EPOCH};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum JournalError {
    #[error("Could not write result journal '{path}': {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("Failed to serialize result journal: {0}")]
    Json(#[from] serde_json::Error),
}

/// One command run, as written to the journal.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct ExecuteRecord {
    pub run_id: String,
    pub command: Vec<String>,
    pub cwd: PathBuf,
    pub exit_code: i32,
    pub output: String,
    pub err: String,
    /// Milliseconds since the Unix epoch.
    pub start: u64,
    /// Seconds.
    pub elapsed: f64,
}

impl ExecuteRecord {
    fn from_outcome(outcome: &Outcome, run_id: &str) -> Self {
        let start = outcome
            .start
            .duration_since(UNIX_EPOCH)
            .map(|d| u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
            .unwrap_or(0);
        Self {
            run_id: run_id.to_string(),
            command: outcome.cmd.clone(),
            cwd: outcome.cwd.clone(),
            exit_code: outcome.exit_code,
            output: outcome.out.clone(),
            err: outcome.err.clone(),
            start,
            elapsed: outcome.elapsed.as_secs_f64(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, PartialEq)]
pub struct EnvRecord {
    pub commands: Vec<ExecuteRecord>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<EnvResult>,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct EnvResult {
    pub status: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    pub duration: f64,
}

/// The journal of one environment. Shared with the environment's worker thread.
#[derive(Debug, Default)]
pub struct EnvJournal {
    content: Mutex<EnvRecord>,
}

impl EnvJournal {
    pub fn add_execute(&self, outcome: &Outcome, run_id: &str) {
        lock(&self.content).commands.push(ExecuteRecord::from_outcome(outcome, run_id));
    }

    pub fn set_result(&self, status: &str, reason: Option<&str>, duration: Duration) {
        lock(&self.content).result = Some(EnvResult {
            status: status.to_string(),
            reason: reason.map(str::to_string),
            duration: duration.as_secs_f64(),
        });
    }

    pub fn record(&self) -> EnvRecord {
        lock(&self.content).clone()
    }
}

#[derive(Debug, Serialize)]
struct JournalContent {
    testenvs: IndexMap<String, EnvRecord>,
}

/// Collects what every environment of a run executed, for `--result-json`.
#[derive(Debug, Default)]
pub struct Journal {
    envs: Mutex<IndexMap<String, Arc<EnvJournal>>>,
}

impl Journal {
    pub fn new() -> Self {
        Self::default()
    }

    /// The journal of environment `name`, created on first request.
    pub fn env_journal(&self, name: &str) -> Arc<EnvJournal> {
        Arc::clone(lock(&self.envs).entry(name.to_string()).or_default())
    }

    pub fn to_json(&self) -> Result<String, JournalError> {
        let content = JournalContent {
            testenvs: lock(&self.envs)
                .iter()
                .map(|(name, journal)| (name.clone(), journal.record()))
                .collect(),
        };
        Ok(serde_json::to_string_pretty(&content)?)
    }

    pub fn write(&self, path: &Path) -> Result<(), JournalError> {
        let io_error = |source| JournalError::Io {
            path: path.to_path_buf(),
            source,
        };
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).map_err(io_error)?;
        }
        fs::write(path, self.to_json()?).map_err(io_error)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::SystemTime;

    fn outcome(exit_code: i32) -> Outcome {
        Outcome {
            run_id: "commands[0]".to_string(),
            cmd: vec!["pytest".to_string()],
            cwd: PathBuf::from("/project"),
            exit_code,
            out: "1 passed".to_string(),
            err: String::new(),
            start: SystemTime::now(),
            elapsed: Duration::from_millis(1500),
        }
    }

    #[test]
    fn test_env_journals_are_shared_per_name() {
        let journal = Journal::new();
        journal.env_journal("unit").add_execute(&outcome(0), "commands[0]");
        journal.env_journal("unit").add_execute(&outcome(1), "commands[1]");
        journal.env_journal("lint");

        let record = journal.env_journal("unit").record();
        assert_eq!(record.commands.len(), 2);
        assert_eq!(record.commands[1].exit_code, 1);
        assert_eq!(record.commands[0].elapsed, 1.5);
    }

    #[test]
    fn test_write_produces_json_with_results() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out").join("result.json");
        let journal = Journal::new();
        let env = journal.env_journal("unit");
        env.add_execute(&outcome(0), "commands[0]");
        env.set_result("OK", None, Duration::from_secs(2));

        journal.write(&path).unwrap();

        let value: serde_json::Value = serde_json::from_str(&fs::read_to_string(&path).unwrap()).unwrap();
        let unit = &value["testenvs"]["unit"];
        assert_eq!(unit["commands"][0]["run_id"], "commands[0]");
        assert_eq!(unit["commands"][0]["output"], "1 passed");
        assert_eq!(unit["result"]["status"], "OK");
        assert!(unit["result"].get("reason").is_none());
    }
}
