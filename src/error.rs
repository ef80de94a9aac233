use thiserror::Error;

#[derive(Error, Debug)]
pub enum AppError {
    #[error("I/O error: {0}")]
    StdIoError(#[from] std::io::Error),

    #[error("Language '{0}' is not supported. Only 'python' is currently implemented.")]
    UnsupportedLanguage(String),

    #[error("Managed session not found: {0}")]
    SessionNotFound(String),

    #[error("Failed to create adapter log directory: {0}")]
    AdapterLogDirCreationFailed(String),

    #[error("Failed to spawn debugpy adapter process: {0}")]
    AdapterSpawnFailed(String),

    #[error("Proxy error: {0}")]
    ProxyError(String),

    #[error("Invalid input argument: {0}")]
    InvalidInputArgument(String),
}

impl From<AppError> for rust_mcp_schema::schema_utils::CallToolError {
    fn from(err: AppError) -> Self {
        tracing::error!("AppError converted to CallToolError: {:?}", err);
        let rpc_error = match err {
            AppError::InvalidInputArgument(_)
            | AppError::UnsupportedLanguage(_)
            | AppError::SessionNotFound(_) => rust_mcp_schema::RpcError::new(
                rust_mcp_schema::schema_utils::RpcErrorCodes::INVALID_PARAMS,
                err.to_string(),
                None,
            ),
            _ => rust_mcp_schema::RpcError::new(
                rust_mcp_schema::schema_utils::RpcErrorCodes::INTERNAL_ERROR,
                err.to_string(),
                None,
            ),
        };
        rust_mcp_schema::schema_utils::CallToolError::new(rpc_error)
    }
}
