mod config;
mod error;
mod mcp;
mod proxy;
mod session;
mod tools;
mod utils;

use crate::config::{default_python, Config, TransportMode, PYTHON_PATH_ENV};
use crate::mcp::handler::{AppManagers, EnhancedServerHandler};
use crate::proxy::{bootstrap, proxy_manager::PROXY_MODE_ARG, worker};
use anyhow::{Context, Result};
use rust_mcp_schema::{InitializeResult, Implementation, ServerCapabilities, ServerCapabilitiesTools, LATEST_PROTOCOL_VERSION};
use rust_mcp_sdk::error::McpSdkError;
use std::sync::Arc;
use tokio::signal::unix::{signal, SignalKind};
use tracing::Level;
use tracing_subscriber::{filter::EnvFilter, fmt::format::FmtSpan, FmtSubscriber};

#[cfg(feature = "sse")]
use rust_mcp_sdk::mcp_server::{hyper_server::create_server as create_sse_server, HyperServer, HyperServerOptions};
#[cfg(feature = "stdio")]
use rust_mcp_sdk::mcp_server::{server_runtime::create_server as create_stdio_server, ServerRuntime};
#[cfg(feature = "stdio")]
use rust_mcp_sdk::McpServer;
#[cfg(feature = "stdio")]
use rust_mcp_transport::{StdioTransport, TransportOptions};

fn setup_logging(log_level_str: &str) {
    let level = match log_level_str.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("mcp_debugger={}", level)));

    let subscriber = FmtSubscriber::builder()
        .with_env_filter(env_filter)
        .with_target(true)
        .with_ansi(false)
        .with_writer(std::io::stderr)
        .with_level(true)
        .with_span_events(FmtSpan::CLOSE)
        .json()
        .finish();

    if let Err(e) = tracing::subscriber::set_global_default(subscriber) {
        eprintln!("Failed to set tracing subscriber: {}", e);
    }
}

fn get_server_details() -> InitializeResult {
    InitializeResult {
        server_info: Implementation {
            name: "mcp-debugger".to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
        },
        capabilities: ServerCapabilities {
            tools: Some(ServerCapabilitiesTools { list_changed: None }),
            ..Default::default()
        },
        meta: None,
        instructions: Some(
            "MCP debugger server. Create a session with `create_debug_session` (language 'python'), \
            then `start_debugging` to launch its proxy worker and debugpy adapter. \
            Breakpoints are recorded per session. Always `close_debug_session` when done so the \
            worker and adapter processes are stopped. Use `get_config` to inspect server settings."
                .to_string(),
        ),
        protocol_version: LATEST_PROTOCOL_VERSION.to_string(),
    }
}

fn map_mcp_sdk_error(err: McpSdkError) -> anyhow::Error {
    anyhow::anyhow!("MCP SDK Error: {:?}", err)
}

/// Resolves on SIGINT or SIGTERM so proxies are stopped before the server exits.
async fn shutdown_signal() -> Result<()> {
    let mut terminate = signal(SignalKind::terminate()).context("Failed to install SIGTERM handler")?;
    tokio::select! {
        res = tokio::signal::ctrl_c() => {
            res.context("Failed to listen for ctrl-c")?;
            tracing::info!("Interrupt received.");
        }
        _ = terminate.recv() => tracing::info!("SIGTERM received."),
    }
    Ok(())
}

fn main() -> Result<()> {
    if std::env::args().nth(1).as_deref() == Some(PROXY_MODE_ARG) {
        // The cwd switch has to happen before the runtime starts its threads.
        let ctx = bootstrap::prepare_from_env();
        let runtime = tokio::runtime::Builder::new_multi_thread().enable_all().build()?;
        let code = runtime.block_on(async {
            setup_logging(&std::env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string()));
            bootstrap::hand_off(ctx, worker::run).await
        });
        drop(runtime);
        std::process::exit(code);
    }

    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?
        .block_on(run_server())
}

async fn run_server() -> Result<()> {
    let initial_config = Arc::new(Config::load()?);
    setup_logging(&initial_config.log_level);

    tracing::info!(version = %env!("CARGO_PKG_VERSION"), "Starting mcp-debugger server");
    tracing::debug!("Loaded initial configuration: {:?}", initial_config);

    let python = initial_config
        .python_path_override
        .clone()
        .unwrap_or_else(|| default_python().to_string());
    if which::which(&python).is_err() {
        tracing::warn!(
            python = %python,
            "Python interpreter not found in PATH. Set {} or pass python_path when creating sessions.",
            PYTHON_PATH_ENV
        );
    }

    let server_details = get_server_details();
    let managers = Arc::new(AppManagers::new(initial_config.clone())?);
    let handler = EnhancedServerHandler::new(managers.clone());

    let served: Result<()> = match initial_config.transport_mode {
        #[cfg(feature = "stdio")]
        TransportMode::Stdio => {
            tracing::info!("Using STDIO transport mode.");
            let transport = StdioTransport::new(TransportOptions::default())
                .map_err(|e| anyhow::anyhow!("Failed to create StdioTransport: {}", e))?;
            let server_runtime: ServerRuntime = create_stdio_server(server_details, transport, handler);
            tokio::select! {
                res = server_runtime.start() => res.map_err(map_mcp_sdk_error),
                res = shutdown_signal() => res,
            }
        }
        #[cfg(feature = "sse")]
        TransportMode::Sse => {
            tracing::info!(host = %initial_config.sse_host, port = %initial_config.sse_port, "Using SSE transport mode.");
            let sse_options = HyperServerOptions {
                host: initial_config.sse_host.clone(),
                port: initial_config.sse_port,
                ..Default::default()
            };
            let sse_server_runtime: HyperServer = create_sse_server(server_details, handler, sse_options);
            tokio::select! {
                res = sse_server_runtime.start() => res.map_err(|e| map_mcp_sdk_error(e.into())),
                res = shutdown_signal() => res,
            }
        }
        #[cfg(not(all(feature = "stdio", feature = "sse")))]
        #[allow(unreachable_patterns)]
        _ => {
            let available_feature = if cfg!(feature = "stdio") {
                "stdio"
            } else if cfg!(feature = "sse") {
                "sse"
            } else {
                "none"
            };
            tracing::error!(
                selected_transport = ?initial_config.transport_mode,
                available_feature = %available_feature,
                "Selected transport mode is not available due to compiled features."
            );
            Err(anyhow::anyhow!(
                "Selected transport mode {:?} is not available. Compiled with {} support only.",
                initial_config.transport_mode,
                available_feature
            ))
        }
    };

    managers.debug_session_manager.shutdown_all().await;
    tracing::info!("Server shutdown.");
    served
}
