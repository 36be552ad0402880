//! Structural pre-flight validation of workflow definitions.
//!
//! Runs before any execution starts; an invalid workflow surfaces a
//! `validation-error` event and the run never begins.

use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet, VecDeque};

use crate::workflow::{NodeType, Workflow};

/// Stable codes for structural findings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ValidationCode {
    MissingInput,
    DuplicateInput,
    MissingOutput,
    DuplicateOutput,
    InputNotConnected,
    OutputNotConnected,
    OrphanedNode,
    OutputNotReachable,
    DuplicateName,
}

/// One structural finding.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ValidationIssue {
    pub code: ValidationCode,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub node_id: Option<String>,
}

impl ValidationIssue {
    fn new(code: ValidationCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            node_id: None,
        }
    }

    fn with_node(mut self, node_id: impl Into<String>) -> Self {
        self.node_id = Some(node_id.into());
        self
    }
}

/// Result of a pre-flight run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValidationReport {
    pub valid: bool,
    pub errors: Vec<ValidationIssue>,
}

/// Nodes reachable from `start` by walking outgoing edges.
///
/// Edges whose endpoints do not exist are ignored; nodes behind them simply
/// stay unreachable.
pub fn reachable_from(workflow: &Workflow, start: &str) -> HashSet<String> {
    let ids: HashSet<&str> = workflow.nodes.iter().map(|n| n.id.as_str()).collect();
    let mut seen = HashSet::new();
    let mut queue = VecDeque::new();
    if ids.contains(start) {
        seen.insert(start.to_string());
        queue.push_back(start.to_string());
    }
    while let Some(cur) = queue.pop_front() {
        for edge in workflow.edges_from(&cur) {
            if ids.contains(edge.target.as_str()) && seen.insert(edge.target.clone()) {
                queue.push_back(edge.target.clone());
            }
        }
    }
    seen
}

/// Run every structural check and collect findings.
pub fn validate_workflow(workflow: &Workflow) -> ValidationReport {
    let mut errors = Vec::new();

    let inputs: Vec<_> = workflow
        .nodes
        .iter()
        .filter(|n| n.node_type == NodeType::Input)
        .collect();
    let outputs: Vec<_> = workflow
        .nodes
        .iter()
        .filter(|n| n.node_type == NodeType::Output)
        .collect();

    match inputs.len() {
        0 => errors.push(ValidationIssue::new(
            ValidationCode::MissingInput,
            "workflow has no input node",
        )),
        1 => {}
        n => {
            for node in inputs.iter().skip(1) {
                errors.push(
                    ValidationIssue::new(
                        ValidationCode::DuplicateInput,
                        format!("workflow has {n} input nodes; exactly one is required"),
                    )
                    .with_node(&node.id),
                );
            }
        }
    }

    match outputs.len() {
        0 => errors.push(ValidationIssue::new(
            ValidationCode::MissingOutput,
            "workflow has no output node",
        )),
        1 => {}
        n => {
            for node in outputs.iter().skip(1) {
                errors.push(
                    ValidationIssue::new(
                        ValidationCode::DuplicateOutput,
                        format!("workflow has {n} output nodes; exactly one is required"),
                    )
                    .with_node(&node.id),
                );
            }
        }
    }

    if let Some(input) = inputs.first() {
        if workflow.edges_from(&input.id).is_empty() {
            errors.push(
                ValidationIssue::new(
                    ValidationCode::InputNotConnected,
                    "input node has no outgoing edges",
                )
                .with_node(&input.id),
            );
        }
    }

    if let Some(output) = outputs.first() {
        if workflow.edges_to(&output.id).is_empty() {
            errors.push(
                ValidationIssue::new(
                    ValidationCode::OutputNotConnected,
                    "output node has no incoming edges",
                )
                .with_node(&output.id),
            );
        }
    }

    // Reachability from the single input node.
    if let [input] = inputs.as_slice() {
        let reachable = reachable_from(workflow, &input.id);
        for node in &workflow.nodes {
            if node.id == input.id || reachable.contains(&node.id) {
                continue;
            }
            if node.node_type == NodeType::Output {
                errors.push(
                    ValidationIssue::new(
                        ValidationCode::OutputNotReachable,
                        format!("output node '{}' is not reachable from the input", node.name()),
                    )
                    .with_node(&node.id),
                );
            } else {
                errors.push(
                    ValidationIssue::new(
                        ValidationCode::OrphanedNode,
                        format!("node '{}' is not reachable from the input", node.name()),
                    )
                    .with_node(&node.id),
                );
            }
        }
    }

    // Display names must be unique.
    let mut seen_names: HashMap<&str, &str> = HashMap::new();
    for node in &workflow.nodes {
        if let Some(first_id) = seen_names.insert(node.name(), &node.id) {
            errors.push(
                ValidationIssue::new(
                    ValidationCode::DuplicateName,
                    format!(
                        "node name '{}' is used by both '{first_id}' and '{}'",
                        node.name(),
                        node.id
                    ),
                )
                .with_node(&node.id),
            );
        }
    }

    ValidationReport {
        valid: errors.is_empty(),
        errors,
    }
}
