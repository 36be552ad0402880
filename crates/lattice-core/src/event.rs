//! Event vocabulary: per-node agent events and the bus-level execution envelope.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::ExecutionError;
use crate::evolution::Evolution;
use crate::validator::ValidationIssue;

/// One entry in a `todo-list` event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TodoItem {
    pub text: String,
    pub completed: bool,
}

/// Normalized events emitted while a single node makes progress.
///
/// Both agent dialects are reduced to this union; non-agent executors emit a
/// subset (usually just `complete` or `error`).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case", rename_all_fields = "camelCase")]
pub enum AgentEvent {
    /// An incremental fragment of assistant text.
    TextDelta { content: String },
    /// Reasoning / scratch content. Never round-tripped to external agents.
    Thinking { content: String },
    /// A tool invocation record.
    ToolUse { id: String, name: String, input: Value },
    /// Correlated by the tool-use id, carried in `name` when the service has
    /// no separate correlation field.
    ToolResult { name: String, result: String },
    /// Structured plan state.
    TodoList { items: Vec<TodoItem> },
    /// Terminal success for one agent turn.
    Complete { result: Value },
    /// Terminal failure.
    Error { message: String },
}

impl AgentEvent {
    pub fn is_terminal(&self) -> bool {
        matches!(self, AgentEvent::Complete { .. } | AgentEvent::Error { .. })
    }
}

/// A structured response captured from an agent turn that declared an
/// output schema.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StructuredOutput {
    pub format: String,
    pub content: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parsed: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub file_path: Option<String>,
}

/// A request for a human decision, surfaced on `node-waiting`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApprovalRequest {
    pub node_id: String,
    pub node_name: String,
    pub prompt_message: String,
    pub display_data: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub feedback_prompt: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timeout_at: Option<DateTime<Utc>>,
}

/// The user's answer to an [`ApprovalRequest`].
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApprovalResponse {
    pub approved: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub feedback: Option<String>,
    pub responded_at: DateTime<Utc>,
}

/// Bus-level envelope for everything observers see during a run.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case", rename_all_fields = "camelCase")]
pub enum ExecutionEvent {
    ExecutionStart {
        execution_id: String,
        workflow_id: String,
    },
    NodeStart {
        node_id: String,
        node_name: String,
    },
    NodeOutput {
        node_id: String,
        event: AgentEvent,
    },
    NodeWaiting {
        node_id: String,
        approval: ApprovalRequest,
    },
    NodeComplete {
        node_id: String,
        result: Value,
    },
    NodeError {
        node_id: String,
        error: ExecutionError,
    },
    ExecutionComplete {
        result: Value,
    },
    ExecutionError {
        error: ExecutionError,
    },
    ValidationError {
        errors: Vec<ValidationIssue>,
    },
    NodeEvolution {
        node_id: String,
        evolution: Evolution,
        applied: bool,
        approval_requested: bool,
        validation_errors: Vec<String>,
    },
}

impl ExecutionEvent {
    /// Whether this event terminates the execution stream.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ExecutionEvent::ExecutionComplete { .. } | ExecutionEvent::ExecutionError { .. }
        )
    }

    /// The node this event concerns, if any.
    pub fn node_id(&self) -> Option<&str> {
        match self {
            ExecutionEvent::NodeStart { node_id, .. }
            | ExecutionEvent::NodeOutput { node_id, .. }
            | ExecutionEvent::NodeWaiting { node_id, .. }
            | ExecutionEvent::NodeComplete { node_id, .. }
            | ExecutionEvent::NodeError { node_id, .. }
            | ExecutionEvent::NodeEvolution { node_id, .. } => Some(node_id),
            _ => None,
        }
    }
}

/// A journaled event: the envelope plus the instant it was published.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionEventRecord {
    pub timestamp: DateTime<Utc>,
    pub event: ExecutionEvent,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn agent_event_wire_tags() {
        let e = AgentEvent::TextDelta {
            content: "hi".into(),
        };
        let json = serde_json::to_string(&e).unwrap();
        assert!(json.contains("\"type\":\"text-delta\""));

        let e = AgentEvent::ToolUse {
            id: "t1".into(),
            name: "Read".into(),
            input: serde_json::json!({"file": "a.rs"}),
        };
        let json = serde_json::to_string(&e).unwrap();
        assert!(json.contains("\"type\":\"tool-use\""));
        assert!(json.contains("\"name\":\"Read\""));
    }

    #[test]
    fn execution_event_wire_tags_are_kebab() {
        let e = ExecutionEvent::NodeStart {
            node_id: "n1".into(),
            node_name: "Agent".into(),
        };
        let json = serde_json::to_string(&e).unwrap();
        assert!(json.contains("\"type\":\"node-start\""));
        assert!(json.contains("\"nodeId\":\"n1\""));
        assert!(json.contains("\"nodeName\":\"Agent\""));
    }

    #[test]
    fn terminal_classification() {
        assert!(ExecutionEvent::ExecutionComplete {
            result: Value::Null
        }
        .is_terminal());
        assert!(!ExecutionEvent::NodeComplete {
            node_id: "n".into(),
            result: Value::Null
        }
        .is_terminal());
        assert!(AgentEvent::Error {
            message: "boom".into()
        }
        .is_terminal());
        assert!(!AgentEvent::Thinking {
            content: "hmm".into()
        }
        .is_terminal());
    }

    #[test]
    fn event_record_roundtrip() {
        let rec = ExecutionEventRecord {
            timestamp: Utc::now(),
            event: ExecutionEvent::ExecutionStart {
                execution_id: "e1".into(),
                workflow_id: "w1".into(),
            },
        };
        let json = serde_json::to_string(&rec).unwrap();
        let back: ExecutionEventRecord = serde_json::from_str(&json).unwrap();
        assert!(matches!(
            back.event,
            ExecutionEvent::ExecutionStart { .. }
        ));
    }
}
