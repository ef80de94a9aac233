use crate::config::Config;
use crate::error::AppError;
use crate::proxy::adapter_manager::DebugpyAdapterManager;
use crate::proxy::proxy_manager::{ProxyManager, WorkerProxyManager};
use crate::proxy::worker::WorkerConfig;
use crate::session::models::{
    Breakpoint, CreateSessionParams, DebugSessionInfo, SessionState, SessionUpdate,
};
use crate::session::store::SessionStore;
use crate::utils::filesystem::{FileSystem, TokioFileSystem};
use crate::utils::net::find_free_port;
use crate::utils::process::{OsProcessSpawner, ProcessSpawner};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::{Arc, Mutex as StdMutex, MutexGuard};
use tracing::{info, instrument, warn};
use uuid::Uuid;

pub type ProxyFactory = Arc<dyn Fn() -> Box<dyn ProxyManager> + Send + Sync>;

#[derive(Debug, Deserialize)]
pub struct SessionIdParams {
    pub session_id: String,
}

#[derive(Debug, Deserialize)]
pub struct SetBreakpointParams {
    pub session_id: String,
    pub file: String,
    pub line: u32,
    pub condition: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct RemoveBreakpointParams {
    pub session_id: String,
    pub breakpoint_id: String,
}

#[derive(Debug, Serialize)]
pub struct StartDebuggingResult {
    pub session_id: String,
    pub proxy_pid: u32,
    pub adapter_host: String,
    pub adapter_port: u16,
    pub state: SessionState,
}

#[derive(Debug, Serialize)]
pub struct BreakpointResult {
    pub session_id: String,
    pub breakpoint: Breakpoint,
}

#[derive(Debug, Serialize)]
pub struct OperationResult {
    pub session_id: String,
    pub success: bool,
    pub message: String,
}

/// Owns the session store and the proxy controller of every session.
pub struct DebugSessionManager {
    config: Arc<Config>,
    store: Arc<StdMutex<SessionStore>>,
    adapter_manager: DebugpyAdapterManager,
    proxy_factory: ProxyFactory,
}

impl fmt::Debug for DebugSessionManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DebugSessionManager")
            .field("config", &self.config)
            .field("adapter_manager", &self.adapter_manager)
            .finish()
    }
}

impl DebugSessionManager {
    pub fn new(config: Arc<Config>) -> anyhow::Result<Self> {
        let spawner: Arc<dyn ProcessSpawner> = Arc::new(OsProcessSpawner);
        let executable = std::env::current_exe()?;
        let worker_spawner = spawner.clone();
        let proxy_factory: ProxyFactory = Arc::new(move || {
            Box::new(WorkerProxyManager::new(worker_spawner.clone(), executable.clone())) as Box<dyn ProxyManager>
        });
        Ok(Self::with_parts(config, spawner, Arc::new(TokioFileSystem), proxy_factory))
    }

    pub fn with_parts(
        config: Arc<Config>,
        spawner: Arc<dyn ProcessSpawner>,
        file_system: Arc<dyn FileSystem>,
        proxy_factory: ProxyFactory,
    ) -> Self {
        let adapter_manager =
            DebugpyAdapterManager::with_cwd_override(spawner, file_system, config.server_cwd.clone());
        Self {
            store: Arc::new(StdMutex::new(SessionStore::new(config.python_path_override.clone()))),
            config,
            adapter_manager,
            proxy_factory,
        }
    }

    // Held for one store call at a time, never across an await.
    fn store(&self) -> MutexGuard<'_, SessionStore> {
        self.store.lock().unwrap_or_else(|e| e.into_inner())
    }

    #[instrument(skip(self, params), fields(language = %params.language))]
    pub async fn create_session(&self, params: &CreateSessionParams) -> Result<DebugSessionInfo, AppError> {
        let info = self.store().create_session(params.clone())?;
        info!(session_id = %info.id, name = %info.name, "Debug session created");
        Ok(info)
    }

    #[instrument(skip(self))]
    pub async fn list_sessions(&self) -> Result<Vec<DebugSessionInfo>, AppError> {
        Ok(self.store().get_all())
    }

    #[instrument(skip(self, params), fields(session_id = %params.session_id))]
    pub async fn start_debugging(&self, params: &SessionIdParams) -> Result<StartDebuggingResult, AppError> {
        let session_id = params.session_id.as_str();
        let python_path = {
            let mut store = self.store();
            let session = store.get_or_throw(session_id)?;
            if session.state == SessionState::INITIALIZING {
                return Err(AppError::InvalidInputArgument(format!(
                    "Session {} is already starting",
                    session_id
                )));
            }
            if session.proxy_manager.is_some() {
                return Err(AppError::InvalidInputArgument(format!(
                    "Session {} already has a proxy attached; close it first",
                    session_id
                )));
            }
            let python_path = session.python_path.clone();
            store.update_state(session_id, SessionState::INITIALIZING)?;
            python_path
        };

        if !self.adapter_manager.validate_python_path(&python_path).await {
            self.mark_failed(session_id);
            return Err(AppError::InvalidInputArgument(format!(
                "Python interpreter '{}' could not be run",
                python_path
            )));
        }
        if !self.adapter_manager.check_debugpy_installed(&python_path).await {
            self.mark_failed(session_id);
            return Err(AppError::InvalidInputArgument(format!(
                "debugpy is not installed for '{}'",
                python_path
            )));
        }

        let adapter_port = match find_free_port(&self.config.adapter_host) {
            Ok(port) => port,
            Err(e) => {
                self.mark_failed(session_id);
                return Err(e.into());
            }
        };

        let worker_config = WorkerConfig {
            session_id: session_id.to_string(),
            python_path,
            adapter_host: self.config.adapter_host.clone(),
            adapter_port,
            log_dir: self.config.log_dir.join(format!("debugpy-{}", session_id)),
            cwd: self.config.server_cwd.clone(),
        };

        let mut proxy = (self.proxy_factory)();
        let proxy_pid = match proxy.start(&worker_config).await {
            Ok(pid) => pid,
            Err(e) => {
                self.mark_failed(session_id);
                return Err(e);
            }
        };

        let rejected = {
            let mut store = self.store();
            match store.get(session_id).map(|s| s.proxy_manager.is_none()) {
                Some(true) => {
                    store.update(
                        session_id,
                        SessionUpdate {
                            state: Some(SessionState::READY),
                            proxy_manager: Some(proxy),
                            ..Default::default()
                        },
                    )?;
                    None
                }
                Some(false) => Some((
                    proxy,
                    AppError::ProxyError(format!("Session {} already has a proxy attached", session_id)),
                )),
                None => Some((proxy, AppError::SessionNotFound(session_id.to_string()))),
            }
        };
        if let Some((mut orphan, err)) = rejected {
            warn!(session_id, error = %err, "Discarding proxy started for an unavailable session");
            orphan.stop().await;
            return Err(err);
        }

        Ok(StartDebuggingResult {
            session_id: session_id.to_string(),
            proxy_pid,
            adapter_host: self.config.adapter_host.clone(),
            adapter_port,
            state: SessionState::READY,
        })
    }

    fn mark_failed(&self, session_id: &str) {
        if let Err(e) = self.store().update_state(session_id, SessionState::ERROR) {
            warn!(session_id, error = %e, "Could not record failed start");
        }
    }

    #[instrument(skip(self, params), fields(session_id = %params.session_id, file = %params.file, line = params.line))]
    pub async fn set_breakpoint(&self, params: &SetBreakpointParams) -> Result<BreakpointResult, AppError> {
        if params.line == 0 {
            return Err(AppError::InvalidInputArgument("Breakpoint line numbers start at 1".to_string()));
        }
        let breakpoint = Breakpoint {
            id: Uuid::new_v4().to_string(),
            file: params.file.clone(),
            line: params.line,
            condition: params.condition.clone().filter(|c| !c.is_empty()),
            verified: false,
        };
        self.store().add_breakpoint(&params.session_id, breakpoint.clone())?;
        Ok(BreakpointResult {
            session_id: params.session_id.clone(),
            breakpoint,
        })
    }

    #[instrument(skip(self, params), fields(session_id = %params.session_id))]
    pub async fn remove_breakpoint(&self, params: &RemoveBreakpointParams) -> Result<OperationResult, AppError> {
        let removed = self
            .store()
            .remove_breakpoint(&params.session_id, &params.breakpoint_id)?;
        Ok(OperationResult {
            session_id: params.session_id.clone(),
            success: removed,
            message: if removed {
                format!("Breakpoint {} removed.", params.breakpoint_id)
            } else {
                format!("Breakpoint {} not found.", params.breakpoint_id)
            },
        })
    }

    /// Stops the session's proxy (if any), then forgets the session.
    #[instrument(skip(self, params), fields(session_id = %params.session_id))]
    pub async fn close_session(&self, params: &SessionIdParams) -> Result<OperationResult, AppError> {
        let session_id = params.session_id.as_str();
        let proxy = self.store().detach_proxy(session_id)?;
        let had_proxy = proxy.is_some();
        if let Some(mut proxy) = proxy {
            proxy.stop().await;
        }

        {
            let mut store = self.store();
            if store.has(session_id) {
                store.update_state(session_id, SessionState::STOPPED)?;
            }
            store.remove(session_id);
        }
        info!(session_id, had_proxy, "Debug session closed");

        Ok(OperationResult {
            session_id: session_id.to_string(),
            success: true,
            message: if had_proxy {
                "Proxy stopped and session closed.".to_string()
            } else {
                "Session closed.".to_string()
            },
        })
    }

    /// Stops every attached proxy. Sessions stay registered.
    pub async fn shutdown_all(&self) {
        let ids: Vec<String> = self
            .store()
            .get_all_managed()
            .into_iter()
            .filter(|s| s.proxy_manager.is_some())
            .map(|s| s.id.clone())
            .collect();

        for session_id in ids {
            let proxy = match self.store().detach_proxy(&session_id) {
                Ok(proxy) => proxy,
                Err(_) => continue,
            };
            if let Some(mut proxy) = proxy {
                info!(session_id = %session_id, "Stopping proxy during shutdown");
                proxy.stop().await;
                let _ = self.store().update_state(&session_id, SessionState::STOPPED);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TransportMode;
    use crate::proxy::proxy_manager::mock::MockProxyManager;
    use crate::session::models::DebugLanguage;
    use crate::utils::filesystem::mock::MockFileSystem;
    use crate::utils::process::mock::{MockProcessHandle, MockSpawner};
    use std::path::PathBuf;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn test_config() -> Arc<Config> {
        Arc::new(Config {
            log_level: "error".to_string(),
            transport_mode: TransportMode::Stdio,
            sse_host: "127.0.0.1".to_string(),
            sse_port: 3000,
            server_cwd: None,
            python_path_override: None,
            adapter_host: "127.0.0.1".to_string(),
            log_dir: PathBuf::from("/tmp/mcp-debugger-logs"),
        })
    }

    struct Harness {
        manager: DebugSessionManager,
        starts: Arc<AtomicUsize>,
        stops: Arc<AtomicUsize>,
    }

    fn harness(probe_exit_code: i32) -> Harness {
        let probe = MockProcessHandle::new(Some(10));
        probe.exit_with(Some(probe_exit_code), None);
        let starts = Arc::new(AtomicUsize::new(0));
        let stops = Arc::new(AtomicUsize::new(0));
        let (factory_starts, factory_stops) = (starts.clone(), stops.clone());
        let factory: ProxyFactory = Arc::new(move || {
            Box::new(MockProxyManager {
                starts: factory_starts.clone(),
                stops: factory_stops.clone(),
                running: false,
            }) as Box<dyn ProxyManager>
        });
        Harness {
            manager: DebugSessionManager::with_parts(
                test_config(),
                Arc::new(MockSpawner::returning(probe)),
                Arc::new(MockFileSystem::default()),
                factory,
            ),
            starts,
            stops,
        }
    }

    fn python() -> CreateSessionParams {
        CreateSessionParams {
            language: DebugLanguage::Python,
            name: None,
            python_path: None,
        }
    }

    #[tokio::test]
    async fn full_session_lifecycle() {
        let h = harness(0);
        let info = h.manager.create_session(&python()).await.unwrap();
        let id = SessionIdParams { session_id: info.id.clone() };

        let started = h.manager.start_debugging(&id).await.unwrap();
        assert_eq!(started.proxy_pid, 4242);
        assert_ne!(started.adapter_port, 0);
        assert_eq!(h.starts.load(Ordering::SeqCst), 1);

        let listed = h.manager.list_sessions().await.unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].state, SessionState::READY);

        let err = h.manager.start_debugging(&id).await.unwrap_err();
        assert!(matches!(err, AppError::InvalidInputArgument(_)));

        let bp = h
            .manager
            .set_breakpoint(&SetBreakpointParams {
                session_id: info.id.clone(),
                file: "/src/main.py".to_string(),
                line: 3,
                condition: Some("x > 1".to_string()),
            })
            .await
            .unwrap();
        assert!(!bp.breakpoint.verified);

        let removed = h
            .manager
            .remove_breakpoint(&RemoveBreakpointParams {
                session_id: info.id.clone(),
                breakpoint_id: bp.breakpoint.id.clone(),
            })
            .await
            .unwrap();
        assert!(removed.success);

        let closed = h.manager.close_session(&id).await.unwrap();
        assert!(closed.success);
        assert_eq!(h.stops.load(Ordering::SeqCst), 1);
        assert!(h.manager.list_sessions().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn concurrent_starts_launch_one_proxy() {
        let h = harness(0);
        let info = h.manager.create_session(&python()).await.unwrap();
        let id = SessionIdParams { session_id: info.id.clone() };

        let (first, second) = tokio::join!(h.manager.start_debugging(&id), h.manager.start_debugging(&id));
        assert_eq!([first.is_ok(), second.is_ok()].iter().filter(|ok| **ok).count(), 1);
        assert_eq!(h.starts.load(Ordering::SeqCst), 1);
        assert_eq!(h.stops.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn start_is_rejected_while_initializing() {
        let h = harness(0);
        let info = h.manager.create_session(&python()).await.unwrap();
        h.manager
            .store()
            .update_state(&info.id, SessionState::INITIALIZING)
            .unwrap();

        let err = h
            .manager
            .start_debugging(&SessionIdParams { session_id: info.id.clone() })
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::InvalidInputArgument(_)));
        assert_eq!(h.starts.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn start_after_worker_exit_requires_close() {
        let h = harness(0);
        let info = h.manager.create_session(&python()).await.unwrap();
        h.manager
            .store()
            .update(
                &info.id,
                SessionUpdate {
                    proxy_manager: Some(Box::new(MockProxyManager::default())),
                    ..Default::default()
                },
            )
            .unwrap();

        let err = h
            .manager
            .start_debugging(&SessionIdParams { session_id: info.id.clone() })
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::InvalidInputArgument(_)));
        assert_eq!(h.starts.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn unusable_python_marks_session_failed() {
        let h = harness(1);
        let info = h.manager.create_session(&python()).await.unwrap();
        let err = h
            .manager
            .start_debugging(&SessionIdParams { session_id: info.id.clone() })
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::InvalidInputArgument(_)));
        assert_eq!(h.starts.load(Ordering::SeqCst), 0);
        assert_eq!(h.manager.list_sessions().await.unwrap()[0].state, SessionState::ERROR);
    }

    #[tokio::test]
    async fn unknown_session_errors() {
        let h = harness(0);
        let id = SessionIdParams { session_id: "missing".to_string() };
        assert!(matches!(
            h.manager.start_debugging(&id).await,
            Err(AppError::SessionNotFound(_))
        ));
        assert!(matches!(
            h.manager.close_session(&id).await,
            Err(AppError::SessionNotFound(_))
        ));
    }

    #[tokio::test]
    async fn rejects_line_zero() {
        let h = harness(0);
        let info = h.manager.create_session(&python()).await.unwrap();
        let err = h
            .manager
            .set_breakpoint(&SetBreakpointParams {
                session_id: info.id,
                file: "a.py".to_string(),
                line: 0,
                condition: None,
            })
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::InvalidInputArgument(_)));
    }

    #[tokio::test]
    async fn shutdown_all_stops_attached_proxies() {
        let h = harness(0);
        let a = h.manager.create_session(&python()).await.unwrap();
        let _b = h.manager.create_session(&python()).await.unwrap();
        h.manager
            .start_debugging(&SessionIdParams { session_id: a.id.clone() })
            .await
            .unwrap();

        h.manager.shutdown_all().await;
        assert_eq!(h.stops.load(Ordering::SeqCst), 1);
        let sessions = h.manager.list_sessions().await.unwrap();
        assert_eq!(sessions.len(), 2);
        let a_state = sessions.iter().find(|s| s.id == a.id).unwrap().state.clone();
        assert_eq!(a_state, SessionState::STOPPED);
    }

    #[tokio::test]
    async fn unsupported_language_is_rejected() {
        let h = harness(0);
        let err = h
            .manager
            .create_session(&CreateSessionParams {
                language: DebugLanguage::Go,
                name: None,
                python_path: None,
            })
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::UnsupportedLanguage(_)));
        assert!(h.manager.list_sessions().await.unwrap().is_empty());
    }
}
