use crate::config::Config;
use crate::mcp::schemas::*;
use crate::session::models::CreateSessionParams;
use crate::tools::debug_session_tool::{
    DebugSessionManager, RemoveBreakpointParams, SessionIdParams, SetBreakpointParams,
};

use async_trait::async_trait;
use rust_mcp_sdk::{mcp_server::ServerHandler, McpServer};
use rust_mcp_schema::{
    schema_utils::CallToolError, CallToolRequest, RpcError, CallToolResult, ListToolsRequest, ListToolsResult, Tool,
};
use serde_json::Value;
use std::sync::Arc;
use tracing::{error, info, instrument};

// Holds all managers, initialized with the config
#[derive(Debug)]
pub struct AppManagers {
    config: Arc<Config>,
    pub debug_session_manager: Arc<DebugSessionManager>,
}

impl AppManagers {
    pub fn new(config: Arc<Config>) -> anyhow::Result<Self> {
        let debug_session_manager = Arc::new(DebugSessionManager::new(config.clone())?);
        Ok(Self {
            config,
            debug_session_manager,
        })
    }
}

#[derive(Debug)]
pub struct EnhancedServerHandler {
    managers: Arc<AppManagers>,
}

impl EnhancedServerHandler {
    pub fn new(managers: Arc<AppManagers>) -> Self {
        Self { managers }
    }
}

pub fn tool_definitions() -> Vec<Tool> {
    vec![
        // Config
        Tool {
            name: "get_config".to_string(),
            description: Some("Get current server configuration.".to_string()),
            input_schema: get_config_schema(),
        },
        // Sessions
        Tool {
            name: "create_debug_session".to_string(),
            description: Some("Create a new debug session. Only Python is currently supported.".to_string()),
            input_schema: create_debug_session_schema(),
        },
        Tool {
            name: "list_debug_sessions".to_string(),
            description: Some("List all debug sessions and their states.".to_string()),
            input_schema: list_debug_sessions_schema(),
        },
        Tool {
            name: "start_debugging".to_string(),
            description: Some("Launch the proxy worker and debugpy adapter for a session.".to_string()),
            input_schema: start_debugging_schema(),
        },
        Tool {
            name: "close_debug_session".to_string(),
            description: Some("Stop a session's proxy and remove the session.".to_string()),
            input_schema: close_debug_session_schema(),
        },
        // Breakpoints
        Tool {
            name: "set_breakpoint".to_string(),
            description: Some("Record a breakpoint for a session.".to_string()),
            input_schema: set_breakpoint_schema(),
        },
        Tool {
            name: "remove_breakpoint".to_string(),
            description: Some("Remove a previously set breakpoint.".to_string()),
            input_schema: remove_breakpoint_schema(),
        },
    ]
}

/// Serializes a tool's return value as the JSON text content of the result.
fn call_tool_result_from_serializable<T: serde::Serialize>(value: &T) -> Result<CallToolResult, CallToolError> {
    let text = serde_json::to_string(value).map_err(CallToolError::new)?;
    Ok(CallToolResult::text_content(text, None))
}

#[async_trait]
impl ServerHandler for EnhancedServerHandler {
    #[instrument(skip(self, _request, _runtime))]
    async fn handle_list_tools_request(
        &self,
        _request: ListToolsRequest,
        _runtime: &dyn McpServer,
    ) -> Result<ListToolsResult, rust_mcp_schema::RpcError> {
        info!("Handling list_tools request");
        Ok(ListToolsResult {
            tools: tool_definitions(),
            meta: None,
            next_cursor: None,
        })
    }

    #[instrument(skip(self, request, _runtime), fields(tool_name = %request.params.name))]
    async fn handle_call_tool_request(
        &self,
        request: CallToolRequest,
        _runtime: &dyn McpServer,
    ) -> Result<CallToolResult, CallToolError> {
        info!("Handling call_tool request for: {}", request.params.name);
        let args = request.params.arguments.unwrap_or_default();

        // Parses args and calls the manager method
        macro_rules! handle_tool {
            ($manager_field:ident . $method:ident :: <$param_type:ty> ()) => {{
                let params: $param_type = serde_json::from_value(Value::Object(args))
                    .map_err(|e| CallToolError::new(RpcError::invalid_params().with_message(e.to_string())))?;
                let result = self.managers.$manager_field.$method(&params).await?;
                Ok(call_tool_result_from_serializable(&result)?)
            }};
            ($manager_field:ident . $method:ident ()) => {{
                let result = self.managers.$manager_field.$method().await?;
                Ok(call_tool_result_from_serializable(&result)?)
            }};
        }

        match request.params.name.as_str() {
            "get_config" => {
                let config_clone = self.managers.config.as_ref().clone();
                Ok(call_tool_result_from_serializable(&config_clone)?)
            }
            "create_debug_session" => handle_tool!(debug_session_manager.create_session::<CreateSessionParams>()),
            "list_debug_sessions" => handle_tool!(debug_session_manager.list_sessions()),
            "start_debugging" => handle_tool!(debug_session_manager.start_debugging::<SessionIdParams>()),
            "close_debug_session" => handle_tool!(debug_session_manager.close_session::<SessionIdParams>()),
            "set_breakpoint" => handle_tool!(debug_session_manager.set_breakpoint::<SetBreakpointParams>()),
            "remove_breakpoint" => handle_tool!(debug_session_manager.remove_breakpoint::<RemoveBreakpointParams>()),
            _ => {
                error!("Unknown tool called: {}", request.params.name);
                Err(CallToolError::unknown_tool(request.params.name))
            }
        }
    }
}
