//! Control-message types for the socket transport.
//!
//! The transport itself lives outside this crate; these are the tagged
//! unions any server implementation exchanges with clients.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::event::{ApprovalResponse, ExecutionEvent};
use crate::workflow::Workflow;

/// Client -> server control messages.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case", rename_all_fields = "camelCase")]
pub enum ClientMessage {
    StartExecution {
        workflow_id: String,
        input: String,
    },
    Interrupt {
        execution_id: String,
    },
    SubscribeExecution {
        execution_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        after_timestamp: Option<DateTime<Utc>>,
    },
    SubmitApproval {
        execution_id: String,
        node_id: String,
        response: ApprovalResponse,
    },
    SubmitEvolution {
        execution_id: String,
        node_id: String,
        response: ApprovalResponse,
    },
    ReplayExecution {
        workflow_id: String,
        source_execution_id: String,
        from_node_id: String,
    },
    SaveWorkflow {
        workflow: Workflow,
    },
}

/// Server -> client pushes.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case", rename_all_fields = "camelCase")]
pub enum ServerMessage {
    Workflows {
        workflows: Vec<Workflow>,
    },
    WorkflowUpdated {
        workflow: Workflow,
    },
    WorkflowSaved {
        success: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
    Event {
        execution_id: String,
        timestamp: DateTime<Utc>,
        event: ExecutionEvent,
    },
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn client_messages_parse_from_wire_shape() {
        let msg: ClientMessage = serde_json::from_value(json!({
            "type": "start-execution",
            "workflowId": "w1",
            "input": "hello"
        }))
        .unwrap();
        assert!(matches!(
            msg,
            ClientMessage::StartExecution { workflow_id, input }
                if workflow_id == "w1" && input == "hello"
        ));

        let msg: ClientMessage = serde_json::from_value(json!({
            "type": "submit-approval",
            "executionId": "e1",
            "nodeId": "n1",
            "response": {"approved": true, "respondedAt": "2026-01-05T10:00:00Z"}
        }))
        .unwrap();
        assert!(matches!(msg, ClientMessage::SubmitApproval { .. }));

        let msg: ClientMessage = serde_json::from_value(json!({
            "type": "subscribe-execution",
            "executionId": "e1"
        }))
        .unwrap();
        assert!(matches!(
            msg,
            ClientMessage::SubscribeExecution {
                after_timestamp: None,
                ..
            }
        ));
    }

    #[test]
    fn server_event_wraps_execution_event() {
        let msg = ServerMessage::Event {
            execution_id: "e1".into(),
            timestamp: Utc::now(),
            event: ExecutionEvent::ExecutionComplete {
                result: json!("done"),
            },
        };
        let wire = serde_json::to_value(&msg).unwrap();
        assert_eq!(wire["type"], "event");
        assert_eq!(wire["event"]["type"], "execution-complete");
    }
}
