use thiserror::Error;

#[derive(Debug, Error)]
pub enum AssistantError {
    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Backend request failed: {0}")]
    BackendRequest(String),

    #[error("Tool execution failed: {0}")]
    ToolExecution(String),

    #[error("Argument parse error: {0}")]
    ArgumentParse(String),

    #[error("Protocol violation: {0}")]
    ProtocolViolation(String),

    #[error("Invalid tool definition: {0}")]
    InvalidDefinition(String),

    #[error("Duplicate tool: {0}")]
    DuplicateTool(String),

    #[error("Tool not found: {0}")]
    ToolNotFound(String),
}

impl AssistantError {
    /// Short machine-readable label, used as the `kind` field of error events.
    pub fn kind(&self) -> &'static str {
        match self {
            AssistantError::Configuration(_) => "configuration",
            AssistantError::BackendRequest(_) => "backend_request",
            AssistantError::ToolExecution(_) => "tool_execution",
            AssistantError::ArgumentParse(_) => "argument_parse",
            AssistantError::ProtocolViolation(_) => "protocol_violation",
            AssistantError::InvalidDefinition(_) => "invalid_definition",
            AssistantError::DuplicateTool(_) => "duplicate_tool",
            AssistantError::ToolNotFound(_) => "tool_not_found",
        }
    }
}

impl From<reqwest::Error> for AssistantError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            AssistantError::BackendRequest(format!("request timed out: {}", e))
        } else if e.is_connect() {
            AssistantError::BackendRequest(format!("connection failed: {}", e))
        } else {
            AssistantError::BackendRequest(e.to_string())
        }
    }
}

impl From<crate::config::ConfigError> for AssistantError {
    fn from(e: crate::config::ConfigError) -> Self {
        AssistantError::Configuration(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, AssistantError>;
