//! Approval coordination: suspends an executor on a one-shot completion slot
//! until a user responds, a timeout fires, or the run is interrupted.
//!
//! Process-local and in-memory; approvals do not survive a restart.

use chrono::Utc;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::oneshot;
use tracing::debug;

use crate::error::{ErrorCode, ExecutionError};
use crate::event::ApprovalResponse;
use crate::workflow::ApprovalTimeoutAction;

/// How a suspended approval was resolved.
#[derive(Debug)]
enum Resolution {
    Response(ApprovalResponse),
    TimedOut(ApprovalTimeoutAction),
    Cancelled,
}

/// The decision handed back to the waiting executor.
#[derive(Debug, Clone)]
pub struct ApprovalOutcome {
    pub approved: bool,
    pub feedback: Option<String>,
}

type SlotKey = (String, String);

#[derive(Default)]
struct Slots {
    pending: HashMap<SlotKey, oneshot::Sender<Resolution>>,
}

/// Cheaply cloneable coordinator shared by the scheduler, executors, and the
/// transport layer.
#[derive(Clone, Default)]
pub struct ApprovalCoordinator {
    slots: Arc<Mutex<Slots>>,
}

impl ApprovalCoordinator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Park until the approval keyed by `(execution_id, node_id)` resolves.
    ///
    /// A `timeout` pairs a duration with the configured expiry action;
    /// `fail` surfaces `AGENT_TIMEOUT`. Cancellation surfaces
    /// `AGENT_INTERRUPTED`.
    pub async fn wait(
        &self,
        execution_id: &str,
        node_id: &str,
        timeout: Option<(Duration, ApprovalTimeoutAction)>,
    ) -> Result<ApprovalOutcome, ExecutionError> {
        let key = (execution_id.to_string(), node_id.to_string());
        let (tx, rx) = oneshot::channel();

        {
            let mut slots = self.slots.lock().unwrap();
            // A second wait on the same key replaces the first; the old
            // waiter resolves as cancelled.
            if let Some(stale) = slots.pending.insert(key.clone(), tx) {
                let _ = stale.send(Resolution::Cancelled);
            }
        }

        if let Some((duration, action)) = timeout {
            let slots = Arc::clone(&self.slots);
            let timer_key = key.clone();
            tokio::spawn(async move {
                tokio::time::sleep(duration).await;
                let sender = slots.lock().unwrap().pending.remove(&timer_key);
                if let Some(sender) = sender {
                    debug!(node_id = %timer_key.1, "approval timed out");
                    let _ = sender.send(Resolution::TimedOut(action));
                }
            });
        }

        let resolution = rx.await.unwrap_or(Resolution::Cancelled);
        match resolution {
            Resolution::Response(response) => Ok(ApprovalOutcome {
                approved: response.approved,
                feedback: response.feedback,
            }),
            Resolution::TimedOut(ApprovalTimeoutAction::Approve) => Ok(ApprovalOutcome {
                approved: true,
                feedback: None,
            }),
            Resolution::TimedOut(ApprovalTimeoutAction::Reject) => Ok(ApprovalOutcome {
                approved: false,
                feedback: None,
            }),
            Resolution::TimedOut(ApprovalTimeoutAction::Fail) => Err(ExecutionError::new(
                ErrorCode::AgentTimeout,
                "approval timed out",
            )
            .with_node(node_id)),
            Resolution::Cancelled => Err(ExecutionError::interrupted().with_node(node_id)),
        }
    }

    /// Deliver a user response. The first submission wins; returns `false`
    /// when nothing is pending under the key.
    pub fn submit(&self, execution_id: &str, node_id: &str, response: ApprovalResponse) -> bool {
        let key = (execution_id.to_string(), node_id.to_string());
        let sender = self.slots.lock().unwrap().pending.remove(&key);
        match sender {
            Some(sender) => sender.send(Resolution::Response(response)).is_ok(),
            None => false,
        }
    }

    /// Unblock one waiter with `AGENT_INTERRUPTED`.
    pub fn cancel(&self, execution_id: &str, node_id: &str) {
        let key = (execution_id.to_string(), node_id.to_string());
        if let Some(sender) = self.slots.lock().unwrap().pending.remove(&key) {
            let _ = sender.send(Resolution::Cancelled);
        }
    }

    /// Unblock every waiter of one execution; used on interrupt.
    pub fn cancel_all(&self, execution_id: &str) {
        let mut slots = self.slots.lock().unwrap();
        let keys: Vec<SlotKey> = slots
            .pending
            .keys()
            .filter(|(exec, _)| exec == execution_id)
            .cloned()
            .collect();
        for key in keys {
            if let Some(sender) = slots.pending.remove(&key) {
                let _ = sender.send(Resolution::Cancelled);
            }
        }
    }

    /// Number of approvals currently parked (all executions).
    pub fn pending_count(&self) -> usize {
        self.slots.lock().unwrap().pending.len()
    }
}
