use async_trait::async_trait;
use serde_json::{json, Value};

use super::{public_result, ExecutorContext, ExecutorOutcome, NodeExecutor};
use crate::workflow::WorkflowNode;

/// Joins fan-in branches. Readiness (wait-all vs first-complete) is decided
/// by the scheduler; by the time this runs, the upstream snapshot holds
/// whatever the strategy admitted.
pub struct MergeExecutor;

#[async_trait]
impl NodeExecutor for MergeExecutor {
    async fn execute(&self, _node: &WorkflowNode, ctx: &ExecutorContext) -> ExecutorOutcome {
        let merged: Value = ctx
            .upstream
            .iter()
            .map(|(name, output)| (name.clone(), public_result(output)))
            .collect::<serde_json::Map<String, Value>>()
            .into();

        ExecutorOutcome::ok(json!({ "value": merged }))
    }
}
