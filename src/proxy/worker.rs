//! What a proxy worker does once bootstrap hands over: own one debugpy adapter
//! until told to stop.

use crate::config::SERVER_CWD_ENV;
use crate::proxy::adapter_manager::{AdapterConfig, DebugpyAdapterManager};
use crate::proxy::bootstrap::BootstrapContext;
use crate::utils::filesystem::TokioFileSystem;
use crate::utils::process::OsProcessSpawner;
use anyhow::{Context, Result};
use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::signal::unix::{signal, SignalKind};
use tracing::{info, warn};

pub const SESSION_ID_ENV: &str = "DAP_PROXY_SESSION_ID";
pub const ADAPTER_PYTHON_ENV: &str = "DAP_ADAPTER_PYTHON";
pub const ADAPTER_HOST_ENV: &str = "DAP_ADAPTER_HOST";
pub const ADAPTER_PORT_ENV: &str = "DAP_ADAPTER_PORT";
pub const ADAPTER_LOG_DIR_ENV: &str = "DAP_ADAPTER_LOG_DIR";

/// Parameters passed from the server to a worker through its environment.
#[derive(Debug, Clone, PartialEq)]
pub struct WorkerConfig {
    pub session_id: String,
    pub python_path: String,
    pub adapter_host: String,
    pub adapter_port: u16,
    pub log_dir: PathBuf,
    pub cwd: Option<PathBuf>,
}

impl WorkerConfig {
    pub fn to_env(&self) -> Vec<(String, String)> {
        let mut vars = vec![
            (SESSION_ID_ENV.to_string(), self.session_id.clone()),
            (ADAPTER_PYTHON_ENV.to_string(), self.python_path.clone()),
            (ADAPTER_HOST_ENV.to_string(), self.adapter_host.clone()),
            (ADAPTER_PORT_ENV.to_string(), self.adapter_port.to_string()),
            (ADAPTER_LOG_DIR_ENV.to_string(), self.log_dir.to_string_lossy().into_owned()),
        ];
        if let Some(cwd) = &self.cwd {
            vars.push((SERVER_CWD_ENV.to_string(), cwd.to_string_lossy().into_owned()));
        }
        vars
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let require = |key: &str| lookup(key).with_context(|| format!("{} must be set for a proxy worker", key));

        let adapter_port = require(ADAPTER_PORT_ENV)?
            .parse::<u16>()
            .with_context(|| format!("Invalid {}", ADAPTER_PORT_ENV))?;

        Ok(WorkerConfig {
            session_id: require(SESSION_ID_ENV)?,
            python_path: require(ADAPTER_PYTHON_ENV)?,
            adapter_host: require(ADAPTER_HOST_ENV)?,
            adapter_port,
            log_dir: PathBuf::from(require(ADAPTER_LOG_DIR_ENV)?),
            cwd: lookup(SERVER_CWD_ENV).filter(|s| !s.is_empty()).map(PathBuf::from),
        })
    }

    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }
}

/// Worker entry point handed to the bootstrap.
pub async fn run(ctx: BootstrapContext) -> Result<()> {
    anyhow::ensure!(ctx.proxy_worker, "proxy worker entry invoked outside proxy mode");
    let config = WorkerConfig::from_env()?;
    info!(session_id = %config.session_id, cwd = %ctx.working_dir.display(), "Proxy worker starting");

    // Listen before spawning so an early stop request is not lost.
    let mut terminate = signal(SignalKind::terminate()).context("Failed to install SIGTERM handler")?;
    let mut interrupt = signal(SignalKind::interrupt()).context("Failed to install SIGINT handler")?;
    let stop_requested = async move {
        tokio::select! {
            _ = terminate.recv() => "SIGTERM",
            _ = interrupt.recv() => "SIGINT",
        }
    };

    let manager = DebugpyAdapterManager::new(Arc::new(OsProcessSpawner), Arc::new(TokioFileSystem));
    supervise(&manager, &config, stop_requested).await
}

/// Spawns the adapter and holds it until it exits on its own or `stop_requested`
/// resolves, in which case the adapter is shut down.
pub async fn supervise<S>(manager: &DebugpyAdapterManager, config: &WorkerConfig, stop_requested: S) -> Result<()>
where
    S: Future<Output = &'static str>,
{
    let adapter = manager
        .spawn(&AdapterConfig {
            python_path: config.python_path.clone(),
            host: config.adapter_host.clone(),
            port: config.adapter_port,
            log_dir: config.log_dir.clone(),
            cwd: None,
            env: None,
        })
        .await?;
    info!(session_id = %config.session_id, adapter_pid = adapter.pid, "Adapter running");

    tokio::select! {
        exit = adapter.process.wait() => {
            if exit.code == Some(0) {
                info!(session_id = %config.session_id, "Adapter finished");
                Ok(())
            } else {
                warn!(session_id = %config.session_id, code = ?exit.code, signal = ?exit.signal, "Adapter exited unexpectedly");
                anyhow::bail!("debugpy adapter exited unexpectedly (code: {:?}, signal: {:?})", exit.code, exit.signal)
            }
        }
        reason = stop_requested => {
            info!(session_id = %config.session_id, "{} received, shutting down adapter", reason);
            manager.shutdown(Some(adapter.process.as_ref())).await;
            Ok(())
        }
    }
}
