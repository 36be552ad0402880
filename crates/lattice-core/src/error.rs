use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Top-level error type for the lattice-core library.
#[derive(Debug, Error)]
pub enum LatticeError {
    /// Configuration parse or validation error.
    #[error("config error: {0}")]
    Config(String),

    /// Workflow failed structural pre-flight validation.
    #[error("validation error: {0}")]
    Validation(String),

    /// Agent adapter or agent service error.
    #[error("agent error: {0}")]
    Agent(String),

    /// Scheduler / run loop error.
    #[error("execution error: {0}")]
    Execution(String),

    /// Evolution validation or apply error.
    #[error("evolution error: {0}")]
    Evolution(String),

    /// Workflow or execution storage error.
    #[error("storage error: {0}")]
    Storage(String),

    /// Sandboxed script execution error.
    #[error("sandbox error: {0}")]
    Sandbox(String),

    /// Wraps `std::io::Error`.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// Wraps `serde_json::Error`.
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Convenience alias used throughout the library.
pub type Result<T> = std::result::Result<T, LatticeError>;

/// Stable machine-readable error codes surfaced in execution events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    UnknownNodeType,
    ValidationFailed,
    ExecutionFailed,
    Timeout,
    InvalidReference,
    CircularReference,
    MissingPredecessor,
    AgentError,
    AgentTimeout,
    AgentInterrupted,
    NoValidPath,
    MissingInput,
    CycleDetected,
    InvalidConditionType,
    ConditionEvaluationFailed,
    EvolutionValidationFailed,
    EvolutionApplyFailed,
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = serde_json::to_string(self).map_err(|_| std::fmt::Error)?;
        write!(f, "{}", s.trim_matches('"'))
    }
}

/// Structured error payload carried on `node-error` / `execution-error` events.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionError {
    pub code: ErrorCode,
    pub message: String,
    pub recoverable: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub node_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}

impl ExecutionError {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            recoverable: false,
            node_id: None,
            details: None,
        }
    }

    pub fn recoverable(mut self, recoverable: bool) -> Self {
        self.recoverable = recoverable;
        self
    }

    pub fn with_node(mut self, node_id: impl Into<String>) -> Self {
        self.node_id = Some(node_id.into());
        self
    }

    pub fn with_details(mut self, details: serde_json::Value) -> Self {
        self.details = Some(details);
        self
    }

    /// The canonical error raised when a run is interrupted by the user.
    pub fn interrupted() -> Self {
        Self::new(ErrorCode::AgentInterrupted, "Execution interrupted")
    }
}

impl std::fmt::Display for ExecutionError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{}] {}", self.code, self.message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_code_serializes_screaming_snake() {
        let json = serde_json::to_string(&ErrorCode::AgentInterrupted).unwrap();
        assert_eq!(json, "\"AGENT_INTERRUPTED\"");
        let json = serde_json::to_string(&ErrorCode::CycleDetected).unwrap();
        assert_eq!(json, "\"CYCLE_DETECTED\"");
    }

    #[test]
    fn error_code_display_matches_wire_form() {
        assert_eq!(ErrorCode::Timeout.to_string(), "TIMEOUT");
        assert_eq!(
            ErrorCode::EvolutionApplyFailed.to_string(),
            "EVOLUTION_APPLY_FAILED"
        );
    }

    #[test]
    fn interrupted_error_shape() {
        let err = ExecutionError::interrupted();
        assert_eq!(err.code, ErrorCode::AgentInterrupted);
        assert_eq!(err.message, "Execution interrupted");
        assert!(!err.recoverable);
    }

    #[test]
    fn execution_error_roundtrip() {
        let err = ExecutionError::new(ErrorCode::Timeout, "node timed out")
            .with_node("agent-1")
            .recoverable(false);
        let json = serde_json::to_string(&err).unwrap();
        assert!(json.contains("\"code\":\"TIMEOUT\""));
        assert!(json.contains("\"nodeId\":\"agent-1\""));
        let back: ExecutionError = serde_json::from_str(&json).unwrap();
        assert_eq!(back.code, ErrorCode::Timeout);
        assert_eq!(back.node_id.as_deref(), Some("agent-1"));
    }
}
