// src/system/output.rs

use crate::system::lock;
use log::LevelFilter;
use std::cell::RefCell;
use std::io::{self, Write};
use std::marker::PhantomData;
use std::sync::{Arc, Mutex};

/// A destination for subprocess output and log lines.
#[derive(Debug, Clone)]
pub enum Sink {
    Stdout,
    Stderr,
    /// An in-memory buffer, shared by every clone of the sink.
    Buffer(Arc<Mutex<Vec<u8>>>),
}

impl Sink {
    pub fn buffer() -> Self {
        Self::Buffer(Arc::new(Mutex::new(Vec::new())))
    }

    /// A copy of the buffered bytes, or `None` for terminal streams.
    pub fn contents(&self) -> Option<Vec<u8>> {
        match self {
            Self::Buffer(buffer) => Some(lock(buffer).clone()),
            Self::Stdout | Self::Stderr => None,
        }
    }
}

impl Write for Sink {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self {
            Self::Stdout => io::stdout().write(buf),
            Self::Stderr => io::stderr().write(buf),
            Self::Buffer(buffer) => {
                lock(buffer).extend_from_slice(buf);
                Ok(buf.len())
            }
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self {
            Self::Stdout => io::stdout().flush(),
            Self::Stderr => io::stderr().flush(),
            Self::Buffer(_) => Ok(()),
        }
    }
}

/// A pair of output and error sinks.
#[derive(Debug, Clone)]
pub struct OutErr {
    pub out: Sink,
    pub err: Sink,
}

impl OutErr {
    pub fn terminal() -> Self {
        Self {
            out: Sink::Stdout,
            err: Sink::Stderr,
        }
    }

    pub fn buffered() -> Self {
        Self {
            out: Sink::buffer(),
            err: Sink::buffer(),
        }
    }

    /// The captured bytes of both sinks (empty for terminal streams).
    pub fn contents(&self) -> (Vec<u8>, Vec<u8>) {
        (
            self.out.contents().unwrap_or_default(),
            self.err.contents().unwrap_or_default(),
        )
    }
}

impl Default for OutErr {
    fn default() -> Self {
        Self::terminal()
    }
}

thread_local! {
    static CURRENT_OUT_ERR: RefCell<OutErr> = RefCell::new(OutErr::terminal());
    static LOG_CONTEXT: RefCell<Option<String>> = const { RefCell::new(None) };
}

/// Maps the `-v`/`-q` counter to a log level.
pub fn level_for(verbosity: u8) -> LevelFilter {
    match verbosity {
        0 | 1 => LevelFilter::Error,
        2 => LevelFilter::Warn,
        3 => LevelFilter::Info,
        4 => LevelFilter::Debug,
        _ => LevelFilter::Trace,
    }
}

/// Forwards log output to the error sink of the thread that emitted the record.
struct ThreadErrWriter;

impl Write for ThreadErrWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let mut sink = CURRENT_OUT_ERR.with(|current| current.borrow().err.clone());
        sink.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        let mut sink = CURRENT_OUT_ERR.with(|current| current.borrow().err.clone());
        sink.flush()
    }
}

/// Per-thread output routing and log context.
///
/// Every thread starts writing to the terminal. An environment worker can suspend its
/// output into buffers and tag its log lines with the environment name; neither affects
/// other threads.
#[derive(Debug, Default)]
pub struct LogHandler {
    _private: (),
}

impl LogHandler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Installs the process-wide `env_logger` backend. `RUST_LOG` overrides `verbosity`.
    pub fn install_logger(verbosity: u8) -> Result<(), log::SetLoggerError> {
        let mut builder = env_logger::Builder::new();
        builder
            .filter_level(level_for(verbosity))
            .parse_default_env()
            .format(|buf, record| {
                let context = LOG_CONTEXT.with(|c| c.borrow().clone());
                let prefix = match record.level() {
                    log::Level::Error => "ERROR ",
                    log::Level::Debug => "[debug] ",
                    log::Level::Trace => "[trace] ",
                    log::Level::Warn | log::Level::Info => "",
                };
                match context {
                    Some(name) => writeln!(buf, "{}{}: {}", prefix, name, record.args()),
                    None => writeln!(buf, "{}{}", prefix, record.args()),
                }
            })
            .target(env_logger::Target::Pipe(Box::new(ThreadErrWriter)));
        builder.try_init()
    }

    /// The sinks the current thread writes to.
    pub fn out_err(&self) -> OutErr {
        CURRENT_OUT_ERR.with(|current| current.borrow().clone())
    }

    /// Tags log records of the current thread with `name` until the guard is dropped.
    pub fn with_context(&self, name: &str) -> ContextGuard {
        let previous = LOG_CONTEXT.with(|c| c.replace(Some(name.to_string())));
        ContextGuard {
            previous,
            _thread_bound: PhantomData,
        }
    }

    /// Redirects the current thread's output into buffers (reusing `previous` when given)
    /// until the guard is dropped. With `suspend == false` nothing changes.
    pub fn suspend_out_err(&self, suspend: bool, previous: Option<OutErr>) -> SuspendGuard {
        if !suspend {
            return SuspendGuard {
                out_err: self.out_err(),
                restore: None,
                _thread_bound: PhantomData,
            };
        }
        let buffered = previous.unwrap_or_else(OutErr::buffered);
        let restore = CURRENT_OUT_ERR.with(|current| current.replace(buffered.clone()));
        SuspendGuard {
            out_err: buffered,
            restore: Some(restore),
            _thread_bound: PhantomData,
        }
    }
}

/// Restores the previous log context of the thread on drop.
#[derive(Debug)]
pub struct ContextGuard {
    previous: Option<String>,
    // Must be dropped on the thread that created it.
    _thread_bound: PhantomData<*const ()>,
}

impl Drop for ContextGuard {
    fn drop(&mut self) {
        let previous = self.previous.take();
        LOG_CONTEXT.with(|c| c.replace(previous));
    }
}

/// Restores the thread's previous sinks on drop.
#[derive(Debug)]
pub struct SuspendGuard {
    out_err: OutErr,
    restore: Option<OutErr>,
    _thread_bound: PhantomData<*const ()>,
}

impl SuspendGuard {
    /// The sinks active while the guard lives.
    pub fn out_err(&self) -> &OutErr {
        &self.out_err
    }
}

impl Drop for SuspendGuard {
    fn drop(&mut self) {
        if let Some(restore) = self.restore.take() {
            CURRENT_OUT_ERR.with(|current| current.replace(restore));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_suspension_captures_and_restores() {
        let handler = LogHandler::new();
        {
            let guard = handler.suspend_out_err(true, None);
            let mut current = handler.out_err();
            current.out.write_all(b"hello").unwrap();
            ThreadErrWriter.write_all(b"log line").unwrap();

            let (out, err) = guard.out_err().contents();
            assert_eq!(out, b"hello");
            assert_eq!(err, b"log line");
        }
        assert!(matches!(handler.out_err().out, Sink::Stdout));
    }

    #[test]
    fn test_suspension_reuses_previous_buffers() {
        let handler = LogHandler::new();
        let previous = OutErr::buffered();
        {
            let _guard = handler.suspend_out_err(true, Some(previous.clone()));
            handler.out_err().out.write_all(b"again").unwrap();
        }
        assert_eq!(previous.contents().0, b"again");
    }

    #[test]
    fn test_not_suspended_keeps_terminal() {
        let handler = LogHandler::new();
        let guard = handler.suspend_out_err(false, None);
        assert!(matches!(guard.out_err().err, Sink::Stderr));
    }

    #[test]
    fn test_context_is_per_thread_and_restored() {
        let handler = LogHandler::new();
        {
            let _outer = handler.with_context("outer");
            {
                let _inner = handler.with_context("inner");
                assert_eq!(LOG_CONTEXT.with(|c| c.borrow().clone()).as_deref(), Some("inner"));
                let other = std::thread::spawn(|| LOG_CONTEXT.with(|c| c.borrow().clone()))
                    .join()
                    .unwrap();
                assert!(other.is_none());
            }
            assert_eq!(LOG_CONTEXT.with(|c| c.borrow().clone()).as_deref(), Some("outer"));
        }
        assert!(LOG_CONTEXT.with(|c| c.borrow().clone()).is_none());
    }

    #[test]
    fn test_level_mapping() {
        assert_eq!(level_for(0), LevelFilter::Error);
        assert_eq!(level_for(2), LevelFilter::Warn);
        assert_eq!(level_for(4), LevelFilter::Debug);
        assert_eq!(level_for(9), LevelFilter::Trace);
    }
}
