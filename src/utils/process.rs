//! Process spawning capability and the handle type the orchestration layer works with.
//!
//! Everything that launches or signals an OS process goes through [`ProcessSpawner`]
//! and [`ProcessHandle`] so the session/adapter logic can be driven by fakes in tests.
//! Process supervision relies on POSIX signals and is Unix only.

use async_trait::async_trait;
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use std::collections::HashMap;
use std::fmt;
use std::io;
use std::os::unix::process::ExitStatusExt;
use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Command as TokioCommand;
use tokio::sync::watch;
use tokio::time::Duration;
use tracing::{debug, error, info, warn};

/// Time a process gets between SIGTERM and SIGKILL.
pub const SHUTDOWN_GRACE: Duration = Duration::from_millis(300);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StdioMode {
    Discard,
    Inherit,
    /// Captured by the parent and forwarded line by line to the debug log.
    Piped,
}

impl StdioMode {
    fn to_stdio(self) -> Stdio {
        match self {
            StdioMode::Discard => Stdio::null(),
            StdioMode::Inherit => Stdio::inherit(),
            StdioMode::Piped => Stdio::piped(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StdioConfig {
    pub stdin: StdioMode,
    pub stdout: StdioMode,
    pub stderr: StdioMode,
}

impl StdioConfig {
    /// No input, diagnostics shared with ours.
    pub fn supervised() -> Self {
        Self {
            stdin: StdioMode::Discard,
            stdout: StdioMode::Inherit,
            stderr: StdioMode::Inherit,
        }
    }

    pub fn silent() -> Self {
        Self {
            stdin: StdioMode::Discard,
            stdout: StdioMode::Discard,
            stderr: StdioMode::Discard,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SpawnOptions {
    pub stdio: StdioConfig,
    pub cwd: Option<PathBuf>,
    /// Full child environment. `None` inherits ours.
    pub env: Option<HashMap<String, String>>,
    /// Put the child in its own process group so it survives our exit.
    pub detached: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TerminationSignal {
    Term,
    Kill,
}

impl TerminationSignal {
    fn as_nix(self) -> Signal {
        match self {
            TerminationSignal::Term => Signal::SIGTERM,
            TerminationSignal::Kill => Signal::SIGKILL,
        }
    }
}

impl fmt::Display for TerminationSignal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_nix().as_str())
    }
}

/// How a process ended. Exactly one of `code` / `signal` is normally set.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessExit {
    pub code: Option<i32>,
    pub signal: Option<String>,
}

impl From<ExitStatus> for ProcessExit {
    fn from(status: ExitStatus) -> Self {
        let signal = status
            .signal()
            .map(|raw| Signal::try_from(raw).map(|s| s.as_str().to_string()).unwrap_or_else(|_| raw.to_string()));
        ProcessExit {
            code: status.code(),
            signal,
        }
    }
}

pub type ExitCallback = Box<dyn Fn(&ProcessExit) + Send + Sync>;
pub type ErrorCallback = Box<dyn Fn(&io::Error) + Send + Sync>;

/// The two passive callback slots of a process handle.
pub struct ProcessObserver {
    pub on_exit: ExitCallback,
    pub on_error: ErrorCallback,
}

impl fmt::Debug for ProcessObserver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProcessObserver")
            .field("on_exit", &"<callback>")
            .field("on_error", &"<callback>")
            .finish()
    }
}

#[async_trait]
pub trait ProcessHandle: Send + Sync + fmt::Debug {
    fn pid(&self) -> Option<u32>;

    /// True once the process is known to be gone.
    fn killed(&self) -> bool;

    fn kill(&self, signal: TerminationSignal) -> io::Result<()>;

    /// Stop tying the child's lifetime to this handle.
    fn unref(&self);

    fn observe(&self, observer: ProcessObserver);

    async fn wait(&self) -> ProcessExit;
}

pub trait ProcessSpawner: Send + Sync + fmt::Debug {
    fn spawn(
        &self,
        command: &str,
        args: &[String],
        options: &SpawnOptions,
    ) -> io::Result<Box<dyn ProcessHandle>>;
}

/// SIGTERM, wait up to [`SHUTDOWN_GRACE`], then SIGKILL if the process is still around.
///
/// Never fails: signalling errors are logged and dropped.
pub async fn terminate_with_grace(process: Option<&dyn ProcessHandle>, label: &str) {
    terminate_within(process, label, SHUTDOWN_GRACE).await
}

/// Same protocol as [`terminate_with_grace`] with a caller-chosen window. The wait ends
/// early once the process has exited.
pub async fn terminate_within(process: Option<&dyn ProcessHandle>, label: &str, grace: Duration) {
    let (process, pid) = match process.and_then(|p| p.pid().map(|pid| (p, pid))) {
        Some(found) => found,
        None => {
            info!("No active {} process to terminate.", label);
            return;
        }
    };

    info!(pid, "Attempting to terminate {} process", label);
    if process.killed() {
        info!(pid, "{} process was already marked as killed", label);
        return;
    }

    info!(pid, "Sending SIGTERM to {} process", label);
    if let Err(e) = process.kill(TerminationSignal::Term) {
        error!(pid, error = %e, details = ?e, "Error during {} process termination", label);
        return;
    }

    if tokio::time::timeout(grace, process.wait()).await.is_err() {
        debug!(pid, "{} process still running after {:?}", label, grace);
    }

    if process.killed() {
        info!(pid, "{} process exited after SIGTERM", label);
        return;
    }

    warn!(pid, "{} process did not exit after SIGTERM. Sending SIGKILL.", label);
    if let Err(e) = process.kill(TerminationSignal::Kill) {
        error!(pid, error = %e, details = ?e, "Error during {} process termination", label);
    }
}

#[derive(Debug)]
struct ChildState {
    exit_tx: watch::Sender<Option<ProcessExit>>,
    observer: Mutex<Option<ProcessObserver>>,
    pending_error: Mutex<Option<io::Error>>,
}

impl ChildState {
    fn finish(&self, exit: ProcessExit) {
        let slot = self.observer.lock().unwrap_or_else(|e| e.into_inner());
        self.exit_tx.send_replace(Some(exit.clone()));
        if let Some(observer) = slot.as_ref() {
            (observer.on_exit)(&exit);
        }
    }

    fn fail(&self, err: io::Error) {
        let slot = self.observer.lock().unwrap_or_else(|e| e.into_inner());
        // We can no longer track this child, treat it as gone.
        self.exit_tx.send_replace(Some(ProcessExit { code: None, signal: None }));
        match slot.as_ref() {
            Some(observer) => (observer.on_error)(&err),
            None => *self.pending_error.lock().unwrap_or_else(|e| e.into_inner()) = Some(err),
        }
    }

    fn attach(&self, observer: ProcessObserver) {
        let mut slot = self.observer.lock().unwrap_or_else(|e| e.into_inner());
        let pending = self.pending_error.lock().unwrap_or_else(|e| e.into_inner()).take();
        if let Some(err) = pending {
            (observer.on_error)(&err);
        } else if let Some(exit) = self.exit_tx.borrow().as_ref() {
            (observer.on_exit)(exit);
        }
        *slot = Some(observer);
    }
}

/// Handle to a real child process. A background task reaps the child and feeds the
/// observer; dropping a handle that was never `unref`'d sends SIGKILL.
#[derive(Debug)]
pub struct OsProcessHandle {
    pid: Option<u32>,
    state: Arc<ChildState>,
    referenced: AtomicBool,
}

#[async_trait]
impl ProcessHandle for OsProcessHandle {
    fn pid(&self) -> Option<u32> {
        self.pid
    }

    fn killed(&self) -> bool {
        self.state.exit_tx.borrow().is_some()
    }

    fn kill(&self, signal: TerminationSignal) -> io::Result<()> {
        let pid = self
            .pid
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, "process has no pid"))?;
        kill(Pid::from_raw(pid as i32), signal.as_nix()).map_err(io::Error::from)
    }

    fn unref(&self) {
        self.referenced.store(false, Ordering::SeqCst);
    }

    fn observe(&self, observer: ProcessObserver) {
        self.state.attach(observer);
    }

    async fn wait(&self) -> ProcessExit {
        let mut rx = self.state.exit_tx.subscribe();
        let exit = rx.wait_for(Option::is_some).await.ok().and_then(|exit| exit.clone());
        exit.unwrap_or(ProcessExit { code: None, signal: None })
    }
}

impl Drop for OsProcessHandle {
    fn drop(&mut self) {
        if self.referenced.load(Ordering::SeqCst) && !self.killed() {
            if let Some(pid) = self.pid {
                let _ = kill(Pid::from_raw(pid as i32), Signal::SIGKILL);
            }
        }
    }
}

fn forward_lines<R>(reader: R, pid: Option<u32>, stream: &'static str)
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut lines = BufReader::new(reader).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            debug!(pid = ?pid, stream, "{}", line);
        }
    });
}

/// Spawns real processes with tokio. Must be called inside a runtime.
#[derive(Debug, Default, Clone)]
pub struct OsProcessSpawner;

impl ProcessSpawner for OsProcessSpawner {
    fn spawn(
        &self,
        command: &str,
        args: &[String],
        options: &SpawnOptions,
    ) -> io::Result<Box<dyn ProcessHandle>> {
        let mut cmd = TokioCommand::new(command);
        cmd.args(args);
        if let Some(cwd) = &options.cwd {
            cmd.current_dir(cwd);
        }
        if let Some(env) = &options.env {
            cmd.env_clear();
            cmd.envs(env);
        }
        cmd.stdin(options.stdio.stdin.to_stdio());
        cmd.stdout(options.stdio.stdout.to_stdio());
        cmd.stderr(options.stdio.stderr.to_stdio());
        if options.detached {
            cmd.process_group(0);
        }

        let mut child = cmd.spawn()?;
        let pid = child.id();

        if let Some(stdout) = child.stdout.take() {
            forward_lines(stdout, pid, "stdout");
        }
        if let Some(stderr) = child.stderr.take() {
            forward_lines(stderr, pid, "stderr");
        }

        let (exit_tx, _) = watch::channel(None);
        let state = Arc::new(ChildState {
            exit_tx,
            observer: Mutex::new(None),
            pending_error: Mutex::new(None),
        });

        let monitor_state = state.clone();
        tokio::spawn(async move {
            match child.wait().await {
                Ok(status) => monitor_state.finish(ProcessExit::from(status)),
                Err(e) => monitor_state.fail(e),
            }
        });

        Ok(Box::new(OsProcessHandle {
            pid,
            state,
            referenced: AtomicBool::new(true),
        }))
    }
}
