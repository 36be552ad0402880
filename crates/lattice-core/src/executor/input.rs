use async_trait::async_trait;
use serde_json::json;

use super::{ExecutorContext, ExecutorOutcome, NodeExecutor};
use crate::workflow::WorkflowNode;

/// Seeds the run with the user's input string.
pub struct InputExecutor;

#[async_trait]
impl NodeExecutor for InputExecutor {
    async fn execute(&self, _node: &WorkflowNode, ctx: &ExecutorContext) -> ExecutorOutcome {
        ExecutorOutcome::ok(json!({
            "prompt": ctx.user_input,
            "value": ctx.user_input,
        }))
    }
}
