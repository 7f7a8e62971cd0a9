//! Error types for the advisor orchestrator

use crate::models::{FailureKind, ToolFailure};
use thiserror::Error;

/// Result type alias for orchestrator operations
pub type Result<T> = std::result::Result<T, OrchestrationError>;

#[derive(Error, Debug)]
pub enum OrchestrationError {

    // =============================
    // Core Pipeline Errors
    // =============================

    #[error("Routing error: {0}")]
    Routing(#[from] RoutingError),

    #[error("Tool error: {0}")]
    Tool(#[from] ToolError),

    #[error("Evaluation error: {0}")]
    EvaluationError(String),

    #[error("Oracle error: {0}")]
    OracleError(String),

    #[error("Checkpoint error: {0}")]
    CheckpointError(String),

    #[error("Checkpoint for conversation {0} failed integrity check")]
    CheckpointCorrupted(String),

    #[error("Handler not registered: {0}")]
    HandlerNotFound(String),

    #[error("Request cancelled")]
    Cancelled,

    // =============================
    // External Library Conversions
    // =============================

    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    #[error("HTTP client error: {0}")]
    HttpError(#[from] reqwest::Error),

    #[error("Database error: {0}")]
    DatabaseError(#[from] sqlx::Error),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
}

/// Failures raised by the tool registry.
///
/// All of these are recoverable from the loop's point of view: they are
/// recorded as error-typed turns and handed back to the active handler.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ToolError {
    #[error("Unknown tool: {0}")]
    UnknownTool(String),

    #[error("Schema violation for {tool}: {detail}")]
    SchemaViolation { tool: String, detail: String },

    #[error("{kind} failure: {message}")]
    ExecutionError { kind: FailureKind, message: String },

    #[error("Tool {tool} timed out after {after_ms} ms")]
    Timeout { tool: String, after_ms: u64 },
}

impl ToolError {
    pub fn execution(message: impl Into<String>) -> Self {
        ToolError::ExecutionError {
            kind: FailureKind::Execution,
            message: message.into(),
        }
    }

    pub fn kind(&self) -> FailureKind {
        match self {
            ToolError::UnknownTool(_) => FailureKind::UnknownTool,
            ToolError::SchemaViolation { .. } => FailureKind::SchemaViolation,
            ToolError::ExecutionError { kind, .. } => *kind,
            ToolError::Timeout { .. } => FailureKind::Timeout,
        }
    }
}

impl From<ToolError> for ToolFailure {
    fn from(error: ToolError) -> Self {
        let kind = error.kind();
        let message = match error {
            ToolError::ExecutionError { message, .. } => message,
            other => other.to_string(),
        };
        ToolFailure { kind, message }
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RoutingError {
    #[error("No handler matches the request: {0}")]
    NoRoute(String),
}
