use async_trait::async_trait;
use chrono::Utc;
use serde_json::{json, Value};
use std::time::Duration;

use super::{ExecutorContext, ExecutorEmit, ExecutorOutcome, NodeExecutor};
use crate::error::ExecutionError;
use crate::event::ApprovalRequest;
use crate::reference::{find_references, interpolate, resolve};
use crate::workflow::{handles, NodeConfig, WorkflowNode};

/// Suspends the run on a human decision, then routes down the
/// approved/rejected handle.
pub struct ApprovalExecutor;

fn display_data(reference: Option<&str>, ctx: &ExecutorContext) -> Value {
    match reference {
        Some(template) => {
            let refs = find_references(template);
            if let [only] = refs.as_slice() {
                if only.raw == template.trim() {
                    if let Some(value) = resolve(only, &ctx.upstream) {
                        return value.clone();
                    }
                }
            }
            Value::String(interpolate(template, &ctx.upstream))
        }
        None => ctx
            .upstream
            .clone()
            .into_iter()
            .collect::<serde_json::Map<_, _>>()
            .into(),
    }
}

#[async_trait]
impl NodeExecutor for ApprovalExecutor {
    fn validate(&self, node: &WorkflowNode) -> Option<String> {
        match &node.data {
            NodeConfig::Approval(config) if config.prompt_message.trim().is_empty() => {
                Some("approval node has no prompt message".to_string())
            }
            _ => None,
        }
    }

    async fn execute(&self, node: &WorkflowNode, ctx: &ExecutorContext) -> ExecutorOutcome {
        let NodeConfig::Approval(config) = &node.data else {
            return ExecutorOutcome::err(
                ExecutionError::new(
                    crate::error::ErrorCode::ExecutionFailed,
                    "node data is not an approval config",
                )
                .with_node(&ctx.node_id),
            );
        };

        let timeout = config
            .timeout_ms
            .map(|ms| (Duration::from_millis(ms), config.timeout_action));

        let request = ApprovalRequest {
            node_id: ctx.node_id.clone(),
            node_name: node.name().to_string(),
            prompt_message: interpolate(&config.prompt_message, &ctx.upstream),
            display_data: display_data(config.display_data_reference.as_deref(), ctx),
            feedback_prompt: config.feedback_prompt.clone(),
            timeout_at: config
                .timeout_ms
                .map(|ms| Utc::now() + chrono::Duration::milliseconds(ms as i64)),
        };

        let _ = ctx.emit.send(ExecutorEmit::Waiting(request)).await;

        match ctx
            .approvals
            .wait(&ctx.execution_id, &ctx.node_id, timeout)
            .await
        {
            Ok(outcome) => {
                let handle = if outcome.approved {
                    handles::APPROVED
                } else {
                    handles::REJECTED
                };
                ExecutorOutcome::ok_with_handle(
                    json!({
                        "approved": outcome.approved,
                        "feedback": outcome.feedback,
                        "value": outcome.approved,
                    }),
                    handle,
                )
            }
            Err(error) => ExecutorOutcome::err(error),
        }
    }
}
