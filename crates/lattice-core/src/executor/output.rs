use async_trait::async_trait;
use serde_json::{json, Value};

use super::{public_result, ExecutorContext, ExecutorOutcome, NodeExecutor};
use crate::workflow::WorkflowNode;

/// Collects predecessor outputs into the run's final result.
///
/// A single predecessor passes through untouched; multiple predecessors
/// produce a map keyed by their display names.
pub struct OutputExecutor;

#[async_trait]
impl NodeExecutor for OutputExecutor {
    async fn execute(&self, _node: &WorkflowNode, ctx: &ExecutorContext) -> ExecutorOutcome {
        let value: Value = if ctx.upstream.len() == 1 {
            let (_, output) = ctx.upstream.iter().next().expect("one upstream");
            public_result(output)
        } else {
            ctx.upstream
                .iter()
                .map(|(name, output)| (name.clone(), public_result(output)))
                .collect::<serde_json::Map<String, Value>>()
                .into()
        };

        ExecutorOutcome::ok(json!({ "value": value }))
    }
}
