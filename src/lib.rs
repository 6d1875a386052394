//! `testbed` provisions isolated test environments from a `testbed.toml` and runs commands
//! inside them, sequentially or in parallel, with clean interruption on Ctrl+C.

use std::sync::Arc;
use std::sync::atomic::AtomicBool;

/// Set once the user asked the run to stop.
pub type CancellationToken = Arc<AtomicBool>;

pub mod cli;
pub mod constants;
pub mod core;
pub mod models;
pub mod system;
