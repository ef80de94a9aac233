use anyhow::{Context, Result};
use serde::Serialize;
use std::path::PathBuf;
use std::str::FromStr;
use tracing::warn;

pub const SERVER_CWD_ENV: &str = "MCP_SERVER_CWD";
pub const PYTHON_PATH_ENV: &str = "PYTHON_PATH";

#[derive(Debug, Clone, Serialize)]
pub struct Config {
    pub log_level: String,
    pub transport_mode: TransportMode,
    pub sse_host: String,
    pub sse_port: u16,
    /// Working directory handed to proxy workers and adapters.
    pub server_cwd: Option<PathBuf>,
    pub python_path_override: Option<String>,
    pub adapter_host: String,
    pub log_dir: PathBuf,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportMode {
    Stdio,
    Sse,
}

impl FromStr for TransportMode {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "stdio" => Ok(TransportMode::Stdio),
            "sse" => Ok(TransportMode::Sse),
            _ => Err(anyhow::anyhow!("Invalid transport mode: {}", s)),
        }
    }
}

pub fn expand_tilde(path_str: &str) -> Result<PathBuf, anyhow::Error> {
    Ok(PathBuf::from(shellexpand::tilde(path_str).as_ref()))
}

/// Platform default interpreter used when neither a session nor the environment names one.
pub fn default_python() -> &'static str {
    if cfg!(windows) {
        "python"
    } else {
        "python3"
    }
}

impl Config {
    pub fn load() -> Result<Self> {
        dotenvy::dotenv().ok(); // Load .env file if present

        let log_level = std::env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string());

        let transport_mode_str = std::env::var("MCP_TRANSPORT").unwrap_or_else(|_| "stdio".to_string());
        let transport_mode = TransportMode::from_str(&transport_mode_str)?;

        let sse_host = std::env::var("MCP_SSE_HOST").unwrap_or_else(|_| "127.0.0.1".to_string());
        let sse_port = std::env::var("MCP_SSE_PORT")
            .unwrap_or_else(|_| "3000".to_string())
            .parse::<u16>()
            .context("Invalid MCP_SSE_PORT")?;

        let server_cwd = match std::env::var(SERVER_CWD_ENV).ok().filter(|s| !s.is_empty()) {
            Some(raw) => {
                let expanded = expand_tilde(&raw)?;
                match dunce::canonicalize(&expanded) {
                    Ok(path) => Some(path),
                    Err(e) => {
                        // Workers fall back on their own cwd, so keep the raw value.
                        warn!(path = %expanded.display(), error = %e, "MCP_SERVER_CWD could not be canonicalized");
                        Some(expanded)
                    }
                }
            }
            None => None,
        };

        let python_path_override = std::env::var(PYTHON_PATH_ENV).ok().filter(|s| !s.is_empty());

        let adapter_host = std::env::var("DAP_ADAPTER_HOST").unwrap_or_else(|_| "127.0.0.1".to_string());

        let log_dir = match std::env::var("MCP_LOG_DIR").ok() {
            Some(raw) => expand_tilde(&raw)?,
            None => {
                let base = match &server_cwd {
                    Some(dir) => dir.clone(),
                    None => std::env::current_dir().context("Failed to read current directory")?,
                };
                base.join("logs")
            }
        };

        Ok(Config {
            log_level,
            transport_mode,
            sse_host,
            sse_port,
            server_cwd,
            python_path_override,
            adapter_host,
            log_dir,
        })
    }
}
