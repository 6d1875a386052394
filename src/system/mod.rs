//! # System Interaction Layer
//!
//! Abstractions over the operating system, kept apart from the lifecycle logic.
//!
//! ## Modules
//!
//! - **`executor`**: spawns subprocesses with a fully resolved environment, captures their
//!   output and escalates interrupts (SIGINT, SIGTERM, kill) to their process group.
//! - **`output`**: per-thread output routing. Environments running in parallel suspend their
//!   output into buffers and tag their log lines with their name.
//! - **`signals`**: the Ctrl+C watcher that turns a terminal interrupt into a cancellation of
//!   every running environment.

pub mod executor;
pub mod output;
pub mod signals;

use std::sync::{Mutex, MutexGuard, PoisonError};

/// Locks `mutex`, recovering the data if another thread panicked while holding it.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
