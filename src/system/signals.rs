// src/system/signals.rs

use crate::CancellationToken;
use std::io;
use std::sync::atomic::Ordering;
use std::thread;

/// Watches for Ctrl+C on a background thread for the rest of the process.
///
/// Every signal sets `token` and then calls `on_interrupt`. The subprocesses started by
/// testbed live in their own process groups, so the terminal does not signal them
/// directly; `on_interrupt` is where the run forwards the interrupt to them.
pub fn spawn_interrupt_watcher<F>(token: CancellationToken, on_interrupt: F) -> io::Result<()>
where
    F: Fn() + Send + 'static,
{
    let runtime = tokio::runtime::Builder::new_current_thread().enable_all().build()?;
    thread::Builder::new().name("testbed-signals".to_string()).spawn(move || {
        runtime.block_on(async move {
            while tokio::signal::ctrl_c().await.is_ok() {
                log::warn!("Interrupt received, stopping running environments...");
                token.store(true, Ordering::SeqCst);
                on_interrupt();
            }
            log::debug!("Could not listen for Ctrl+C anymore.");
        });
    })?;
    Ok(())
}
