//! Replay planning: partial re-execution of a workflow from a chosen node,
//! reusing completed ancestor outputs from a prior execution.
//!
//! The planner is pure; the scheduler consumes the plan by seeding node
//! outputs and marking reused nodes complete before the first tick.

use serde_json::Value;
use std::collections::HashMap;

use crate::error::{ErrorCode, ExecutionError};
use crate::storage::ExecutionSummary;
use crate::workflow::{NodeStatus, NodeType, Workflow};

/// Classification of the current workflow's nodes for a replay run.
#[derive(Debug, Clone)]
pub struct ReplayPlan {
    /// Ancestor outputs seeded into the new run, keyed by node id.
    pub reused: HashMap<String, Value>,
    /// The restart node and its reflexive descendants.
    pub re_executed: Vec<String>,
    /// Nodes that did not exist in the source execution.
    pub new_nodes: Vec<String>,
    /// Node-set drift between the source execution and the workflow.
    pub warnings: Vec<String>,
}

/// Plan a replay of `workflow` restarting at `from_node_id`, sourcing
/// outputs from `summary`.
pub fn plan_replay(
    summary: &ExecutionSummary,
    workflow: &Workflow,
    from_node_id: &str,
) -> std::result::Result<ReplayPlan, ExecutionError> {
    let Some(from_node) = workflow.node(from_node_id) else {
        return Err(ExecutionError::new(
            ErrorCode::MissingPredecessor,
            format!("restart node '{from_node_id}' does not exist in the workflow"),
        ));
    };

    let mut warnings = Vec::new();
    for node_id in summary.nodes.keys() {
        if workflow.node(node_id).is_none() {
            warnings.push(format!(
                "node '{node_id}' from the source execution no longer exists; its output is dropped"
            ));
        }
    }

    let mut reused = HashMap::new();
    for ancestor_id in workflow.ancestors(from_node_id) {
        let Some(node_summary) = summary.nodes.get(&ancestor_id) else {
            return Err(ExecutionError::new(
                ErrorCode::MissingPredecessor,
                format!(
                    "ancestor '{ancestor_id}' of '{}' has no output in execution {}",
                    from_node.name(),
                    summary.execution_id
                ),
            )
            .with_node(ancestor_id));
        };
        if node_summary.status != NodeStatus::Complete {
            return Err(ExecutionError::new(
                ErrorCode::MissingPredecessor,
                format!(
                    "ancestor '{ancestor_id}' did not complete in execution {} (status {:?})",
                    summary.execution_id, node_summary.status
                ),
            )
            .with_node(ancestor_id));
        }
        reused.insert(
            ancestor_id,
            node_summary.result.clone().unwrap_or(Value::Null),
        );
    }

    let descendants = workflow.descendants(from_node_id);
    let mut re_executed: Vec<String> = descendants.iter().cloned().collect();
    re_executed.sort();

    let mut new_nodes: Vec<String> = workflow
        .nodes
        .iter()
        .filter(|n| n.node_type != NodeType::Input)
        .filter(|n| !summary.nodes.contains_key(&n.id))
        .filter(|n| !descendants.contains(&n.id))
        .map(|n| n.id.clone())
        .collect();
    new_nodes.sort();

    Ok(ReplayPlan {
        reused,
        re_executed,
        new_nodes,
        warnings,
    })
}
