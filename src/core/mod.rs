// src/core/mod.rs

//! The environment lifecycle engine and everything it is built from: per-environment
//! configuration, variable and `PATH` assembly, the persisted setup cache, installers,
//! runner kinds, the result journal and the session driving a run.

pub mod config_set;
pub mod env_vars;
pub mod environment;
pub mod info;
pub mod installer;
pub mod journal;
pub mod kinds;
pub mod path_set;
pub mod runner;
pub mod session;
pub mod set_env;
