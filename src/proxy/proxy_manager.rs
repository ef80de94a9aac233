use crate::error::AppError;
use crate::proxy::worker::WorkerConfig;
use crate::utils::process::{
    terminate_within, ProcessHandle, ProcessObserver, ProcessSpawner, SpawnOptions, StdioConfig,
    StdioMode, SHUTDOWN_GRACE,
};
use async_trait::async_trait;
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::time::Duration;
use tracing::{error, info, instrument};

/// Argument that switches the executable into proxy worker mode.
pub const PROXY_MODE_ARG: &str = "proxy";

/// How long a worker gets to exit after SIGTERM. Longer than [`SHUTDOWN_GRACE`] so the
/// worker can finish escalating against its own adapter first.
pub const WORKER_STOP_GRACE: Duration = SHUTDOWN_GRACE.saturating_add(Duration::from_millis(700));

/// Controller for the proxy worker behind one session.
///
/// The orchestration layer only starts, attaches and stops it. Driving DAP traffic
/// through it is the worker's business.
#[async_trait]
pub trait ProxyManager: Send + Sync + fmt::Debug {
    /// Launches the worker and returns its pid.
    async fn start(&mut self, config: &WorkerConfig) -> Result<u32, AppError>;

    /// Best-effort stop. Never fails.
    async fn stop(&mut self);

    fn is_running(&self) -> bool;

    fn pid(&self) -> Option<u32>;
}

/// Runs the worker as a child copy of the current executable.
pub struct WorkerProxyManager {
    spawner: Arc<dyn ProcessSpawner>,
    executable: PathBuf,
    process: Option<Box<dyn ProcessHandle>>,
}

impl fmt::Debug for WorkerProxyManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkerProxyManager")
            .field("executable", &self.executable)
            .field("pid", &self.pid())
            .finish()
    }
}

impl WorkerProxyManager {
    pub fn new(spawner: Arc<dyn ProcessSpawner>, executable: PathBuf) -> Self {
        Self {
            spawner,
            executable,
            process: None,
        }
    }
}

#[async_trait]
impl ProxyManager for WorkerProxyManager {
    #[instrument(skip(self, config), fields(session_id = %config.session_id))]
    async fn start(&mut self, config: &WorkerConfig) -> Result<u32, AppError> {
        if self.is_running() {
            return Err(AppError::ProxyError(format!(
                "Proxy worker for session {} is already running",
                config.session_id
            )));
        }

        let mut env: std::collections::HashMap<String, String> = std::env::vars().collect();
        env.extend(config.to_env());

        // Our stdout may carry the MCP stream, so the worker's goes to the log instead.
        let options = SpawnOptions {
            stdio: StdioConfig {
                stdout: StdioMode::Piped,
                ..StdioConfig::supervised()
            },
            cwd: config.cwd.clone(),
            env: Some(env),
            detached: true,
        };

        let command = self.executable.to_string_lossy().into_owned();
        let process = self
            .spawner
            .spawn(&command, &[PROXY_MODE_ARG.to_string()], &options)
            .map_err(|e| AppError::ProxyError(format!("Failed to spawn proxy worker: {}", e)))?;
        let pid = process
            .pid()
            .ok_or_else(|| AppError::ProxyError("Proxy worker has no PID".to_string()))?;

        // Only `stop` tears the worker down; dropping the controller leaves it running.
        process.unref();

        let session_id = config.session_id.clone();
        let error_session_id = session_id.clone();
        process.observe(ProcessObserver {
            on_error: Box::new(move |err| {
                error!(session_id = %error_session_id, pid, error = ?err, "Proxy worker error");
            }),
            on_exit: Box::new(move |exit| {
                info!(session_id = %session_id, pid, code = ?exit.code, signal = ?exit.signal, "Proxy worker exited");
            }),
        });

        info!(pid, "Proxy worker started");
        self.process = Some(process);
        Ok(pid)
    }

    async fn stop(&mut self) {
        terminate_within(self.process.as_deref(), "proxy worker", WORKER_STOP_GRACE).await;
        self.process = None;
    }

    fn is_running(&self) -> bool {
        self.process.as_ref().map(|p| !p.killed()).unwrap_or(false)
    }

    fn pid(&self) -> Option<u32> {
        self.process.as_ref().and_then(|p| p.pid())
    }
}

#[cfg(test)]
pub mod mock {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Debug, Default)]
    pub struct MockProxyManager {
        pub starts: Arc<AtomicUsize>,
        pub stops: Arc<AtomicUsize>,
        pub running: bool,
    }

    impl MockProxyManager {
        pub fn stop_counter(&self) -> Arc<AtomicUsize> {
            self.stops.clone()
        }
    }

    #[async_trait]
    impl ProxyManager for MockProxyManager {
        async fn start(&mut self, _config: &WorkerConfig) -> Result<u32, AppError> {
            self.starts.fetch_add(1, Ordering::SeqCst);
            self.running = true;
            Ok(4242)
        }

        async fn stop(&mut self) {
            self.stops.fetch_add(1, Ordering::SeqCst);
            self.running = false;
        }

        fn is_running(&self) -> bool {
            self.running
        }

        fn pid(&self) -> Option<u32> {
            self.running.then_some(4242)
        }
    }
}
