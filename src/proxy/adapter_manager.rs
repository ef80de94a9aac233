//! Lifecycle of the `debugpy.adapter` process: spawn, observe, shut down.

use crate::config::SERVER_CWD_ENV;
use crate::error::AppError;
use crate::utils::filesystem::FileSystem;
use crate::utils::process::{
    terminate_with_grace, ProcessHandle, ProcessObserver, ProcessSpawner, SpawnOptions,
    StdioConfig, TerminationSignal,
};
use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::time::Duration;
use tracing::{error, info, instrument, warn};

/// Upper bound for an interpreter check (`--version`, `import debugpy`).
pub const PROBE_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, PartialEq)]
pub struct AdapterConfig {
    pub python_path: String,
    pub host: String,
    pub port: u16,
    pub log_dir: PathBuf,
    pub cwd: Option<PathBuf>,
    pub env: Option<HashMap<String, String>>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SpawnCommand {
    pub command: String,
    pub args: Vec<String>,
}

/// A running adapter. The caller owns it until it is handed to `shutdown`.
#[derive(Debug)]
pub struct AdapterSpawnResult {
    pub process: Box<dyn ProcessHandle>,
    pub pid: u32,
}

pub struct DebugpyAdapterManager {
    spawner: Arc<dyn ProcessSpawner>,
    file_system: Arc<dyn FileSystem>,
    cwd_override: Option<PathBuf>,
}

impl fmt::Debug for DebugpyAdapterManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DebugpyAdapterManager")
            .field("cwd_override", &self.cwd_override)
            .finish()
    }
}

fn display_or_null<T: fmt::Display>(value: &Option<T>) -> String {
    value
        .as_ref()
        .map(|v| v.to_string())
        .unwrap_or_else(|| "null".to_string())
}

impl DebugpyAdapterManager {
    /// Reads the working directory override from `MCP_SERVER_CWD`.
    pub fn new(spawner: Arc<dyn ProcessSpawner>, file_system: Arc<dyn FileSystem>) -> Self {
        let cwd_override = std::env::var_os(SERVER_CWD_ENV)
            .filter(|v| !v.is_empty())
            .map(PathBuf::from);
        Self::with_cwd_override(spawner, file_system, cwd_override)
    }

    pub fn with_cwd_override(
        spawner: Arc<dyn ProcessSpawner>,
        file_system: Arc<dyn FileSystem>,
        cwd_override: Option<PathBuf>,
    ) -> Self {
        Self {
            spawner,
            file_system,
            cwd_override,
        }
    }

    pub fn build_spawn_command(&self, python_path: &str, host: &str, port: u16, log_dir: &Path) -> SpawnCommand {
        SpawnCommand {
            command: python_path.to_string(),
            args: vec![
                "-m".to_string(),
                "debugpy.adapter".to_string(),
                "--host".to_string(),
                host.to_string(),
                "--port".to_string(),
                port.to_string(),
                "--log-dir".to_string(),
                log_dir.to_string_lossy().into_owned(),
            ],
        }
    }

    pub async fn ensure_log_directory(&self, log_dir: &Path) -> Result<(), AppError> {
        match self.file_system.ensure_dir(log_dir).await {
            Ok(()) => {
                info!(log_dir = %log_dir.display(), "Ensured adapter log directory exists");
                Ok(())
            }
            Err(e) => {
                error!(log_dir = %log_dir.display(), error = ?e, "Failed to ensure adapter log directory");
                Err(AppError::AdapterLogDirCreationFailed(e.to_string()))
            }
        }
    }

    #[instrument(skip(self, config), fields(host = %config.host, port = config.port))]
    pub async fn spawn(&self, config: &AdapterConfig) -> Result<AdapterSpawnResult, AppError> {
        self.ensure_log_directory(&config.log_dir).await?;

        let SpawnCommand { command, args } =
            self.build_spawn_command(&config.python_path, &config.host, config.port, &config.log_dir);
        info!("Spawning debugpy.adapter: {} {}", command, args.join(" "));

        let cwd = match (&config.cwd, &self.cwd_override) {
            (Some(cwd), _) => cwd.clone(),
            (None, Some(cwd)) => cwd.clone(),
            (None, None) => std::env::current_dir()?,
        };

        let options = SpawnOptions {
            stdio: StdioConfig::supervised(),
            cwd: Some(cwd),
            env: config.env.clone(),
            detached: true,
        };
        info!(
            exec_path = %command,
            args = ?args,
            cwd = ?options.cwd,
            env_vars = config.env.as_ref().map(HashMap::len).unwrap_or_else(|| std::env::vars_os().count()),
            "Adapter spawn configuration"
        );

        let process = self
            .spawner
            .spawn(&command, &args, &options)
            .map_err(|e| AppError::AdapterSpawnFailed(e.to_string()))?;
        let pid = process
            .pid()
            .ok_or_else(|| AppError::AdapterSpawnFailed("process has no PID".to_string()))?;

        process.unref();
        info!(pid, "Called unref() on adapter process");

        Self::attach_observers(process.as_ref());

        Ok(AdapterSpawnResult { process, pid })
    }

    fn attach_observers(process: &dyn ProcessHandle) {
        let pid = process.pid();
        process.observe(ProcessObserver {
            on_error: Box::new(move |err| {
                error!(pid = ?pid, error = ?err, "Adapter process spawn error");
            }),
            on_exit: Box::new(move |exit| {
                info!(
                    pid = ?pid,
                    "Adapter process exited. Code: {}, Signal: {}",
                    display_or_null(&exit.code),
                    display_or_null(&exit.signal)
                );
            }),
        });
    }

    /// Best-effort termination, see [`terminate_with_grace`]. Never fails.
    pub async fn shutdown(&self, process: Option<&dyn ProcessHandle>) {
        terminate_with_grace(process, "adapter").await;
    }

    /// Checks that `python_path` runs at all (`--version` exits 0).
    pub async fn validate_python_path(&self, python_path: &str) -> bool {
        self.probe(python_path, &["--version".to_string()]).await
    }

    pub async fn check_debugpy_installed(&self, python_path: &str) -> bool {
        self.probe(python_path, &["-c".to_string(), "import debugpy".to_string()]).await
    }

    async fn probe(&self, python_path: &str, args: &[String]) -> bool {
        let options = SpawnOptions {
            stdio: StdioConfig::silent(),
            cwd: None,
            env: None,
            detached: false,
        };
        match self.spawner.spawn(python_path, args, &options) {
            Ok(process) => match tokio::time::timeout(PROBE_TIMEOUT, process.wait()).await {
                Ok(exit) => exit.code == Some(0),
                Err(_) => {
                    warn!(python_path, timeout = ?PROBE_TIMEOUT, "Python probe timed out");
                    if let Err(e) = process.kill(TerminationSignal::Kill) {
                        error!(python_path, error = %e, "Failed to kill timed out Python probe");
                    }
                    false
                }
            },
            Err(e) => {
                info!(python_path, error = %e, "Python probe could not be started");
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::utils::filesystem::mock::MockFileSystem;
    use crate::utils::process::mock::{KillBehavior, MockProcessHandle, MockSpawner, SpawnOutcome};
    use crate::utils::process::{StdioMode, TerminationSignal, SHUTDOWN_GRACE};
    use serial_test::serial;

    fn manager_with(
        spawner: Arc<MockSpawner>,
        fs: Arc<MockFileSystem>,
    ) -> DebugpyAdapterManager {
        DebugpyAdapterManager::with_cwd_override(spawner, fs, None)
    }

    fn default_config() -> AdapterConfig {
        AdapterConfig {
            python_path: "/usr/bin/python3".to_string(),
            host: "localhost".to_string(),
            port: 5678,
            log_dir: PathBuf::from("/var/log/x"),
            cwd: None,
            env: None,
        }
    }

    #[test]
    fn build_spawn_command_shape() {
        let manager = manager_with(
            Arc::new(MockSpawner::failing("unused")),
            Arc::new(MockFileSystem::default()),
        );
        let cmd = manager.build_spawn_command("/usr/bin/python3", "localhost", 5678, Path::new("/var/log/debugpy"));
        assert_eq!(cmd.command, "/usr/bin/python3");
        assert_eq!(
            cmd.args,
            vec!["-m", "debugpy.adapter", "--host", "localhost", "--port", "5678", "--log-dir", "/var/log/debugpy"]
        );
        assert_eq!(
            cmd,
            manager.build_spawn_command("/usr/bin/python3", "localhost", 5678, Path::new("/var/log/debugpy"))
        );
    }

    #[test]
    fn build_spawn_command_port_boundaries() {
        let manager = manager_with(
            Arc::new(MockSpawner::failing("unused")),
            Arc::new(MockFileSystem::default()),
        );
        for port in [1u16, 8080, 65535] {
            let cmd = manager.build_spawn_command("python", "0.0.0.0", port, Path::new("/logs"));
            assert_eq!(cmd.args[5], port.to_string());
            assert_eq!(cmd.args.len(), 8);
        }
    }

    #[tokio::test]
    async fn ensure_log_directory_success() {
        let fs = Arc::new(MockFileSystem::default());
        let manager = manager_with(Arc::new(MockSpawner::failing("unused")), fs.clone());
        manager.ensure_log_directory(Path::new("/test/logs")).await.unwrap();
        assert_eq!(fs.created(), vec![PathBuf::from("/test/logs")]);
    }

    #[tokio::test]
    async fn ensure_log_directory_wraps_failures() {
        for message in ["EACCES: permission denied", "ENOSPC: no space left on device", "string error"] {
            let manager = manager_with(
                Arc::new(MockSpawner::failing("unused")),
                Arc::new(MockFileSystem::failing(message)),
            );
            let err = manager
                .ensure_log_directory(Path::new("/protected/logs"))
                .await
                .unwrap_err();
            assert!(matches!(err, AppError::AdapterLogDirCreationFailed(_)));
            assert_eq!(
                err.to_string(),
                format!("Failed to create adapter log directory: {}", message)
            );
        }
    }

    #[tokio::test]
    #[serial]
    async fn spawn_with_valid_config() {
        let handle = MockProcessHandle::new(Some(12345));
        let spawner = Arc::new(MockSpawner::returning(handle.clone()));
        let fs = Arc::new(MockFileSystem::default());
        let manager = manager_with(spawner.clone(), fs.clone());

        let result = manager.spawn(&default_config()).await.unwrap();

        assert_eq!(result.pid, 12345);
        assert_eq!(result.process.pid(), Some(12345));
        assert_eq!(fs.created(), vec![PathBuf::from("/var/log/x")]);

        let calls = spawner.calls();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].command, "/usr/bin/python3");
        assert_eq!(
            calls[0].args,
            vec!["-m", "debugpy.adapter", "--host", "localhost", "--port", "5678", "--log-dir", "/var/log/x"]
        );
        let options = &calls[0].options;
        assert_eq!(options.stdio.stdin, StdioMode::Discard);
        assert_eq!(options.stdio.stdout, StdioMode::Inherit);
        assert_eq!(options.stdio.stderr, StdioMode::Inherit);
        assert!(options.detached);
        assert!(options.env.is_none());
        assert_eq!(options.cwd, Some(std::env::current_dir().unwrap()));

        assert_eq!(handle.0.unref_calls.load(std::sync::atomic::Ordering::SeqCst), 1);
        assert_eq!(handle.observer_count(), 1);
    }

    #[tokio::test]
    async fn spawn_cwd_precedence() {
        let handle = MockProcessHandle::new(Some(1));
        let spawner = Arc::new(MockSpawner::returning(handle));
        let manager = DebugpyAdapterManager::with_cwd_override(
            spawner.clone(),
            Arc::new(MockFileSystem::default()),
            Some(PathBuf::from("/srv/server-cwd")),
        );

        manager.spawn(&default_config()).await.unwrap();
        manager
            .spawn(&AdapterConfig {
                cwd: Some(PathBuf::from("/explicit")),
                ..default_config()
            })
            .await
            .unwrap();

        let calls = spawner.calls();
        assert_eq!(calls[0].options.cwd, Some(PathBuf::from("/srv/server-cwd")));
        assert_eq!(calls[1].options.cwd, Some(PathBuf::from("/explicit")));
    }

    #[tokio::test]
    async fn spawn_passes_custom_env() {
        let spawner = Arc::new(MockSpawner::returning(MockProcessHandle::new(Some(7))));
        let manager = manager_with(spawner.clone(), Arc::new(MockFileSystem::default()));
        let env = HashMap::from([("CUSTOM_VAR".to_string(), "value".to_string())]);

        manager
            .spawn(&AdapterConfig {
                env: Some(env.clone()),
                ..default_config()
            })
            .await
            .unwrap();
        assert_eq!(spawner.calls()[0].options.env, Some(env));
    }

    #[tokio::test]
    async fn spawn_log_dir_failure_prevents_spawn() {
        let spawner = Arc::new(MockSpawner::returning(MockProcessHandle::new(Some(7))));
        let manager = manager_with(spawner.clone(), Arc::new(MockFileSystem::failing("EACCES")));

        let err = manager.spawn(&default_config()).await.unwrap_err();
        assert!(matches!(err, AppError::AdapterLogDirCreationFailed(_)));
        assert!(spawner.calls().is_empty());
    }

    #[tokio::test]
    async fn spawn_without_pid_is_a_hard_failure() {
        let handle = MockProcessHandle::new(None);
        let manager = manager_with(
            Arc::new(MockSpawner::returning(handle.clone())),
            Arc::new(MockFileSystem::default()),
        );
        let err = manager.spawn(&default_config()).await.unwrap_err();
        assert!(matches!(err, AppError::AdapterSpawnFailed(_)));
        assert_eq!(handle.observer_count(), 0);
    }

    #[tokio::test]
    async fn spawn_error_from_spawner() {
        let manager = manager_with(
            Arc::new(MockSpawner::failing("Spawn failed")),
            Arc::new(MockFileSystem::default()),
        );
        let err = manager.spawn(&default_config()).await.unwrap_err();
        assert!(matches!(err, AppError::AdapterSpawnFailed(_)));
        assert!(err.to_string().contains("Spawn failed"));
    }

    #[tokio::test]
    async fn observers_only_log() {
        let handle = MockProcessHandle::new(Some(12345));
        let manager = manager_with(
            Arc::new(MockSpawner::returning(handle.clone())),
            Arc::new(MockFileSystem::default()),
        );
        manager.spawn(&default_config()).await.unwrap();

        handle.emit_error(std::io::Error::new(std::io::ErrorKind::Other, "Process crashed"));
        handle.exit_with(Some(0), None);
        handle.exit_with(None, Some("SIGTERM"));
        assert!(handle.signals().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn full_lifecycle_spawn_then_shutdown() {
        let handle = MockProcessHandle::new(Some(12345)).with_behavior(KillBehavior::DieOnTerm);
        let spawner = Arc::new(MockSpawner::returning(handle.clone()));
        let manager = manager_with(spawner.clone(), Arc::new(MockFileSystem::default()));

        let first = manager.spawn(&default_config()).await.unwrap();
        manager.shutdown(Some(first.process.as_ref())).await;
        assert_eq!(handle.signals(), vec![TerminationSignal::Term]);

        spawner.set_outcome(SpawnOutcome::Handle(MockProcessHandle::new(Some(54321))));
        let second = manager
            .spawn(&AdapterConfig {
                port: 5679,
                ..default_config()
            })
            .await
            .unwrap();
        assert_eq!(first.pid, 12345);
        assert_eq!(second.pid, 54321);
        assert_eq!(spawner.calls().len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_escalates_for_hung_adapter() {
        let handle = MockProcessHandle::new(Some(12345)).with_behavior(KillBehavior::Ignore);
        let manager = manager_with(
            Arc::new(MockSpawner::returning(handle.clone())),
            Arc::new(MockFileSystem::default()),
        );
        let started = tokio::time::Instant::now();
        manager.shutdown(Some(&handle)).await;
        assert_eq!(
            handle.signals(),
            vec![TerminationSignal::Term, TerminationSignal::Kill]
        );
        assert!(started.elapsed() >= SHUTDOWN_GRACE);
    }

    #[tokio::test]
    async fn shutdown_none_is_a_no_op() {
        let manager = manager_with(
            Arc::new(MockSpawner::failing("unused")),
            Arc::new(MockFileSystem::default()),
        );
        manager.shutdown(None).await;
    }

    #[tokio::test]
    async fn python_probes() {
        let handle = MockProcessHandle::new(Some(99));
        handle.exit_with(Some(0), None);
        let spawner = Arc::new(MockSpawner::returning(handle));
        let manager = manager_with(spawner.clone(), Arc::new(MockFileSystem::default()));

        assert!(manager.validate_python_path("python3").await);
        assert_eq!(spawner.calls()[0].args, vec!["--version"]);
        assert!(manager.check_debugpy_installed("python3").await);
        assert_eq!(spawner.calls()[1].args, vec!["-c", "import debugpy"]);

        let failing = MockProcessHandle::new(Some(100));
        failing.exit_with(Some(1), None);
        spawner.set_outcome(SpawnOutcome::Handle(failing));
        assert!(!manager.check_debugpy_installed("python3").await);

        spawner.set_outcome(SpawnOutcome::Fail("No such file or directory".to_string()));
        assert!(!manager.validate_python_path("/nope/python").await);
    }

    #[tokio::test(start_paused = true)]
    async fn hung_probe_times_out_and_is_killed() {
        let hung = MockProcessHandle::new(Some(101)).with_behavior(KillBehavior::Ignore);
        let spawner = Arc::new(MockSpawner::returning(hung.clone()));
        let manager = manager_with(spawner, Arc::new(MockFileSystem::default()));

        let started = tokio::time::Instant::now();
        assert!(!manager.validate_python_path("python3").await);
        assert!(started.elapsed() >= PROBE_TIMEOUT);
        assert_eq!(hung.signals(), vec![TerminationSignal::Kill]);
    }
}
