// src/system/executor.rs

use crate::system::lock;
use crate::system::output::{OutErr, Sink};
use indexmap::IndexMap;
use std::fmt;
use std::io::{ErrorKind, Read, Write};
use std::path::{Path, PathBuf};
use std::process::{Child, Command as StdCommand, ExitStatus, Stdio};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant, SystemTime};
use thiserror::Error;

/// How long the wait loop sleeps between two polls of a running child.
const POLL_INTERVAL: Duration = Duration::from_millis(10);

#[derive(Error, Debug)]
pub enum ExecutionError {
    #[error("Command could not be parsed: {0}")]
    CommandParse(String),
    #[error("No command specified to run.")]
    EmptyCommand,
    #[error("Command '{0}' could not be executed: {1}")]
    CommandFailed(String, #[source] std::io::Error),
    #[error("Command '{command}' exited with code {code}.")]
    NonZeroExitStatus { command: String, code: i32 },
}

/// Splits a configured command line into its arguments.
///
/// A leading `-` marks a command whose exit code is ignored; it is stripped before parsing.
pub fn parse_command(command_line: &str) -> Result<(Vec<String>, bool), ExecutionError> {
    let trimmed = command_line.trim();
    let (line, ignore_errors) = match trimmed.strip_prefix('-') {
        Some(rest) => (rest.trim(), true),
        None => (trimmed, false),
    };
    let parts = shlex::split(line).ok_or_else(|| ExecutionError::CommandParse(line.to_string()))?;
    if parts.is_empty() {
        return Err(ExecutionError::EmptyCommand);
    }
    Ok((parts, ignore_errors))
}

/// Where a subprocess reads its standard input from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StdinSource {
    /// No input (`/dev/null`).
    #[default]
    Off,
    /// The user's terminal.
    User,
}

/// An immutable description of one subprocess run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecuteRequest {
    cmd: Vec<String>,
    cwd: PathBuf,
    env: IndexMap<String, String>,
    stdin: StdinSource,
    run_id: String,
}

impl ExecuteRequest {
    pub fn new(
        cmd: Vec<String>,
        cwd: PathBuf,
        env: IndexMap<String, String>,
        stdin: StdinSource,
        run_id: impl Into<String>,
    ) -> Result<Self, ExecutionError> {
        if cmd.is_empty() {
            return Err(ExecutionError::EmptyCommand);
        }
        Ok(Self {
            cmd,
            cwd,
            env,
            stdin,
            run_id: run_id.into(),
        })
    }

    pub fn cmd(&self) -> &[String] {
        &self.cmd
    }

    pub fn cwd(&self) -> &Path {
        &self.cwd
    }

    pub fn env(&self) -> &IndexMap<String, String> {
        &self.env
    }

    pub fn stdin(&self) -> StdinSource {
        self.stdin
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    /// The command as a shell-quoted line, for display.
    pub fn shell_cmd(&self) -> String {
        shlex::try_join(self.cmd.iter().map(String::as_str)).unwrap_or_else(|_| self.cmd.join(" "))
    }
}

/// The record of a finished subprocess.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Outcome {
    pub run_id: String,
    pub cmd: Vec<String>,
    pub cwd: PathBuf,
    pub exit_code: i32,
    pub out: String,
    pub err: String,
    pub start: SystemTime,
    pub elapsed: Duration,
}

impl Outcome {
    pub fn is_success(&self) -> bool {
        self.exit_code == 0
    }

    pub fn shell_cmd(&self) -> String {
        shlex::try_join(self.cmd.iter().map(String::as_str)).unwrap_or_else(|_| self.cmd.join(" "))
    }

    /// Turns a non-zero exit code into an error.
    pub fn assert_success(&self) -> Result<(), ExecutionError> {
        if self.is_success() {
            Ok(())
        } else {
            Err(ExecutionError::NonZeroExitStatus {
                command: self.shell_cmd(),
                code: self.exit_code,
            })
        }
    }
}

/// A live handle on a running subprocess. Safe to share across threads, so that an
/// interrupt can reach it from outside the thread waiting on it.
pub trait ExecuteStatus: Send + Sync + fmt::Debug {
    /// `None` until the subprocess has finished.
    fn exit_code(&self) -> Option<i32>;

    /// Available once the subprocess has finished.
    fn outcome(&self) -> Option<Outcome>;

    /// Waits up to `timeout` (forever with `None`) for the subprocess to finish.
    fn wait(&self, timeout: Option<Duration>) -> Option<i32>;

    /// Asks the subprocess to stop.
    fn interrupt(&self);

    /// Ends the scope of the status: blocks until the subprocess finished and its outcome
    /// was recorded.
    fn close(&self) {
        while self.exit_code().is_none() {
            self.wait(None);
        }
    }
}

/// A backend able to run an [`ExecuteRequest`].
pub trait Execute: Send + Sync + fmt::Debug {
    /// Starts the request. When `show` is set the output is also streamed to `out_err`
    /// while it is being captured.
    fn call(&self, request: ExecuteRequest, show: bool, out_err: OutErr) -> Result<Arc<dyn ExecuteStatus>, ExecutionError>;
}

/// Runs requests as local child processes.
#[derive(Debug, Clone)]
pub struct LocalSubProcessExecutor {
    interrupt_timeout: Duration,
    terminate_timeout: Duration,
}

impl LocalSubProcessExecutor {
    pub fn new(interrupt_timeout: Duration, terminate_timeout: Duration) -> Self {
        Self {
            interrupt_timeout,
            terminate_timeout,
        }
    }

    fn configure(command: &mut StdCommand, request: &ExecuteRequest) {
        let stdin = match request.stdin() {
            StdinSource::Off => Stdio::null(),
            StdinSource::User => Stdio::inherit(),
        };
        command
            .current_dir(dunce::simplified(request.cwd()))
            .env_clear()
            .envs(request.env())
            .stdin(stdin)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        // Own process group: terminal signals reach us, and we forward them on purpose.
        #[cfg(unix)]
        {
            use std::os::unix::process::CommandExt;
            command.process_group(0);
        }
    }

    fn spawn(request: &ExecuteRequest) -> Result<Child, ExecutionError> {
        let (program, args) = request.cmd().split_first().ok_or(ExecutionError::EmptyCommand)?;
        let mut command = StdCommand::new(program);
        command.args(args);
        Self::configure(&mut command, request);

        // Fallback logic for Windows built-in commands like `echo`.
        // We try to spawn directly first. If it fails with `NotFound`, we try with `cmd /C`.
        match command.spawn() {
            Ok(child) => Ok(child),
            Err(e) if e.kind() == ErrorKind::NotFound && cfg!(target_os = "windows") => {
                log::debug!("Command '{}' not found. Retrying with cmd /C.", program);
                let mut fallback = StdCommand::new("cmd");
                fallback.arg("/C").arg(request.shell_cmd());
                Self::configure(&mut fallback, request);
                fallback
                    .spawn()
                    .map_err(|e| ExecutionError::CommandFailed(request.shell_cmd(), e))
            }
            Err(e) => Err(ExecutionError::CommandFailed(request.shell_cmd(), e)),
        }
    }
}

impl Execute for LocalSubProcessExecutor {
    fn call(&self, request: ExecuteRequest, show: bool, out_err: OutErr) -> Result<Arc<dyn ExecuteStatus>, ExecutionError> {
        let start = SystemTime::now();
        let started = Instant::now();
        let mut child = Self::spawn(&request)?;
        log::trace!("Spawned '{}' as PID {}", request.shell_cmd(), child.id());

        let mut readers = Vec::with_capacity(2);
        if let Some(stdout) = child.stdout.take() {
            readers.push((StreamKind::Out, spawn_reader(stdout, out_err.out, show)));
        }
        if let Some(stderr) = child.stderr.take() {
            readers.push((StreamKind::Err, spawn_reader(stderr, out_err.err, show)));
        }

        Ok(Arc::new(LocalStatus {
            pid: child.id(),
            request,
            child: Mutex::new(child),
            exited: Mutex::new(None),
            readers: Mutex::new(readers),
            finished: Mutex::new(None),
            start,
            started,
            interrupt_timeout: self.interrupt_timeout,
            terminate_timeout: self.terminate_timeout,
        }))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StreamKind {
    Out,
    Err,
}

/// Drains `stream` on its own thread, forwarding every chunk to `sink` when `show` is set.
fn spawn_reader<R: Read + Send + 'static>(mut stream: R, mut sink: Sink, show: bool) -> JoinHandle<Vec<u8>> {
    thread::spawn(move || {
        let mut collected = Vec::new();
        let mut buffer = [0u8; 8192];
        loop {
            match stream.read(&mut buffer) {
                Ok(0) => break,
                Ok(n) => {
                    let Some(chunk) = buffer.get(..n) else { break };
                    collected.extend_from_slice(chunk);
                    if show && sink.write_all(chunk).and_then(|()| sink.flush()).is_err() {
                        log::debug!("Could not forward subprocess output, keeping it captured only.");
                    }
                }
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => {
                    log::debug!("Stopped reading subprocess output: {}", e);
                    break;
                }
            }
        }
        collected
    })
}

#[derive(Debug)]
struct LocalStatus {
    pid: u32,
    request: ExecuteRequest,
    child: Mutex<Child>,
    /// Exit code of the direct child, once reaped. Its output may still be open.
    exited: Mutex<Option<i32>>,
    readers: Mutex<Vec<(StreamKind, JoinHandle<Vec<u8>>)>>,
    finished: Mutex<Option<Outcome>>,
    start: SystemTime,
    started: Instant,
    interrupt_timeout: Duration,
    terminate_timeout: Duration,
}

impl LocalStatus {
    /// Reaps the direct child if it has exited. Never waits on its output.
    fn child_exit_code(&self) -> Option<i32> {
        let mut exited = lock(&self.exited);
        if exited.is_none() {
            *exited = match lock(&self.child).try_wait() {
                Ok(Some(status)) => Some(exit_code_of(status)),
                Ok(None) => None,
                Err(e) => {
                    log::warn!("Lost track of process {}: {}", self.pid, e);
                    Some(-1)
                }
            };
        }
        *exited
    }

    /// Checks the child once and records the outcome the first time both the child has
    /// exited and its output streams are closed. Never blocks on a running process: a
    /// background grandchild may keep the pipes open long after the child is gone.
    fn poll(&self) -> Option<i32> {
        if let Some(outcome) = lock(&self.finished).as_ref() {
            return Some(outcome.exit_code);
        }
        let exit_code = self.child_exit_code()?;

        let mut readers = lock(&self.readers);
        if !readers.iter().all(|(_, reader)| reader.is_finished()) {
            return None;
        }
        let mut finished = lock(&self.finished);
        if let Some(outcome) = finished.as_ref() {
            return Some(outcome.exit_code);
        }
        let mut out = Vec::new();
        let mut err = Vec::new();
        for (kind, reader) in std::mem::take(&mut *readers) {
            let bytes = reader.join().unwrap_or_default();
            match kind {
                StreamKind::Out => out = bytes,
                StreamKind::Err => err = bytes,
            }
        }
        *finished = Some(Outcome {
            run_id: self.request.run_id().to_string(),
            cmd: self.request.cmd().to_vec(),
            cwd: self.request.cwd().to_path_buf(),
            exit_code,
            out: String::from_utf8_lossy(&out).into_owned(),
            err: String::from_utf8_lossy(&err).into_owned(),
            start: self.start,
            elapsed: self.started.elapsed(),
        });
        Some(exit_code)
    }

    #[cfg(unix)]
    fn signal_group(&self, signal: nix::sys::signal::Signal) {
        use nix::sys::signal::killpg;
        use nix::unistd::Pid;

        match i32::try_from(self.pid) {
            Ok(pid) => {
                log::debug!("Sending {} to process group {}", signal, pid);
                if let Err(e) = killpg(Pid::from_raw(pid), signal) {
                    log::debug!("Could not signal process group {}: {}", pid, e);
                }
            }
            Err(_) => log::warn!("Process id {} is out of range for signalling.", self.pid),
        }
    }
}

impl ExecuteStatus for LocalStatus {
    fn exit_code(&self) -> Option<i32> {
        lock(&self.finished).as_ref().map(|o| o.exit_code)
    }

    fn outcome(&self) -> Option<Outcome> {
        lock(&self.finished).clone()
    }

    fn wait(&self, timeout: Option<Duration>) -> Option<i32> {
        let deadline = timeout.map(|t| Instant::now() + t);
        loop {
            if let Some(code) = self.poll() {
                return Some(code);
            }
            if deadline.is_some_and(|d| Instant::now() >= d) {
                return None;
            }
            thread::sleep(POLL_INTERVAL);
        }
    }

    /// Escalates until the command has finished. The whole process group is signalled,
    /// even when the direct child is already gone, so background grandchildren stop too.
    fn interrupt(&self) {
        if self.poll().is_some() {
            return;
        }
        #[cfg(unix)]
        {
            use nix::sys::signal::Signal;

            self.signal_group(Signal::SIGINT);
            if self.wait(Some(self.interrupt_timeout)).is_some() {
                return;
            }
            self.signal_group(Signal::SIGTERM);
            if self.wait(Some(self.terminate_timeout)).is_some() {
                return;
            }
        }
        if self.child_exit_code().is_none() {
            log::debug!("Killing process {}", self.pid);
            if let Err(e) = lock(&self.child).kill() {
                log::warn!("Failed to kill child process {}: {}", self.pid, e);
            }
        }
        #[cfg(unix)]
        self.signal_group(nix::sys::signal::Signal::SIGKILL);
        self.wait(None);
    }
}

/// The process exit code, or the negated signal number when it was killed by a signal.
fn exit_code_of(status: ExitStatus) -> i32 {
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if let Some(signal) = status.signal() {
            return -signal;
        }
    }
    status.code().unwrap_or(-1)
}
