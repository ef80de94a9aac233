//! First code to run in a freshly spawned proxy worker.
//!
//! Nothing else is set up yet (no tracing subscriber, no runtime), so progress goes to
//! stderr and to an append-only proof file under `logs/`. The proof file's name tells
//! which working-directory branch was taken:
//!
//! | `MCP_SERVER_CWD` | chdir  | proof file                              |
//! |------------------|--------|-----------------------------------------|
//! | set              | ok     | `proxy_bootstrap_proof.txt`             |
//! | set              | failed | `proxy_bootstrap_proof_fallback.txt`    |
//! | unset            | -      | `proxy_bootstrap_proof_no_mcp_cwd.txt`  |

use crate::config::SERVER_CWD_ENV;
use chrono::Utc;
use std::ffi::OsString;
use std::fs::OpenOptions;
use std::future::Future;
use std::io::Write;
use std::path::{Path, PathBuf};

/// Set to `true` in a process that runs as a dedicated proxy worker.
pub const PROXY_WORKER_ENV: &str = "DAP_PROXY_WORKER";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CwdOutcome {
    Changed,
    ChangeFailed,
    NotRequested,
}

impl CwdOutcome {
    pub fn proof_file_name(self) -> &'static str {
        match self {
            CwdOutcome::Changed => "proxy_bootstrap_proof.txt",
            CwdOutcome::ChangeFailed => "proxy_bootstrap_proof_fallback.txt",
            CwdOutcome::NotRequested => "proxy_bootstrap_proof_no_mcp_cwd.txt",
        }
    }
}

#[derive(Debug, Clone)]
pub struct BootstrapLog {
    prefix: String,
    proof_file: Option<PathBuf>,
}

impl BootstrapLog {
    fn new() -> Self {
        Self {
            prefix: format!("[Bootstrap {}]", Utc::now().to_rfc3339()),
            proof_file: None,
        }
    }

    pub fn proof_file(&self) -> Option<&Path> {
        self.proof_file.as_deref()
    }

    pub fn line(&self, message: &str) {
        eprintln!("{} {}", self.prefix, message);
        if let Some(path) = &self.proof_file {
            let appended = OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .and_then(|mut file| writeln!(file, "{} {}", self.prefix, message));
            if let Err(e) = appended {
                eprintln!(
                    "{} FAILED TO WRITE TO PROOF FILE ({}): {}.",
                    self.prefix,
                    path.display(),
                    e
                );
            }
        }
    }

    /// Points the log at `<cwd>/logs/<file_name>`, or disables the proof file if the
    /// directory cannot be created.
    fn use_proof_file(&mut self, cwd: &Path, file_name: &str) {
        let logs_dir = cwd.join("logs");
        match std::fs::create_dir_all(&logs_dir) {
            Ok(()) => self.proof_file = Some(logs_dir.join(file_name)),
            Err(e) => {
                self.proof_file = None;
                self.line(&format!(
                    "Could not create logs directory for {}: {}",
                    file_name, e
                ));
            }
        }
    }
}

/// Immutable record of how bootstrap went, handed to the proxy entry logic.
#[derive(Debug, Clone)]
pub struct BootstrapContext {
    pub working_dir: PathBuf,
    pub cwd_outcome: CwdOutcome,
    pub proxy_worker: bool,
    pub log: BootstrapLog,
}

fn current_dir_or_dot() -> PathBuf {
    std::env::current_dir().unwrap_or_else(|_| PathBuf::from("."))
}

/// Runs the working-directory switch and marks the process as a proxy worker.
///
/// Mutates process-wide state (cwd, environment); call it before starting threads.
pub fn prepare(cwd_override: Option<OsString>) -> BootstrapContext {
    let mut log = BootstrapLog::new();
    log.line(&format!(
        "Bootstrap script initially started. Initial CWD: {}",
        current_dir_or_dot().display()
    ));

    let cwd_outcome = match cwd_override.filter(|v| !v.is_empty()) {
        Some(target) => {
            let target = PathBuf::from(target);
            log.line(&format!("{} is set to: {}", SERVER_CWD_ENV, target.display()));
            match std::env::set_current_dir(&target) {
                Ok(()) => {
                    log.line(&format!("Successfully changed CWD to: {}", current_dir_or_dot().display()));
                    CwdOutcome::Changed
                }
                Err(e) => {
                    log.line(&format!(
                        "Failed to change CWD to {}: {}. Remaining in {}",
                        target.display(),
                        e,
                        current_dir_or_dot().display()
                    ));
                    CwdOutcome::ChangeFailed
                }
            }
        }
        None => {
            log.line(&format!("{} environment variable not set. Remaining in initial CWD.", SERVER_CWD_ENV));
            CwdOutcome::NotRequested
        }
    };

    let working_dir = current_dir_or_dot();
    log.use_proof_file(&working_dir, cwd_outcome.proof_file_name());

    std::env::set_var(PROXY_WORKER_ENV, "true");
    log.line(&format!("Setting {} environment variable to indicate proxy mode.", PROXY_WORKER_ENV));

    BootstrapContext {
        working_dir,
        cwd_outcome,
        proxy_worker: true,
        log,
    }
}

pub fn prepare_from_env() -> BootstrapContext {
    prepare(std::env::var_os(SERVER_CWD_ENV))
}

fn describe_error(err: &anyhow::Error) -> String {
    format!("{:#}\n{:?}", err, err)
}

fn describe_panic(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        format!("panic: {}", message)
    } else if let Some(message) = payload.downcast_ref::<String>() {
        format!("panic: {}", message)
    } else {
        "panic: <non-string payload>".to_string()
    }
}

/// Runs the proxy entry logic and returns the process exit status: 0 on success,
/// 1 if the entry failed or panicked.
pub async fn hand_off<F, Fut>(ctx: BootstrapContext, entry: F) -> i32
where
    F: FnOnce(BootstrapContext) -> Fut,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    let log = ctx.log.clone();
    log.line("Handing off to proxy entry logic...");

    match tokio::spawn(entry(ctx)).await {
        Ok(Ok(())) => {
            log.line("Proxy entry logic completed.");
            0
        }
        Ok(Err(e)) => {
            log.line(&format!("ERROR during proxy entry: {}", describe_error(&e)));
            1
        }
        Err(join_err) => {
            let detail = if join_err.is_panic() {
                describe_panic(join_err.into_panic().as_ref())
            } else {
                join_err.to_string()
            };
            log.line(&format!("ERROR during proxy entry: {}", detail));
            1
        }
    }
}
