//! Validates candidate evolutions against the live workflow definition.
//!
//! The candidate is first sanitized, then each mutation is checked and, when
//! it passes, applied to a shadow copy so later mutations in the batch see
//! the effects of earlier ones.

use serde_json::Value;
use std::collections::{HashMap, HashSet};

use super::applier::apply_mutation;
use super::{sanitize_evolution, Evolution, EvolutionScope, MutationOp};
use crate::schema::{is_reserved_segment, registry};
use crate::workflow::{NodeType, Workflow};

/// Options scoping a validation run.
#[derive(Debug, Clone, Default)]
pub struct ValidateOptions {
    /// Cap on the number of mutations in one evolution.
    pub max_mutations: Option<usize>,
    /// Allowed scope classes; `None` allows everything.
    pub scope: Option<Vec<EvolutionScope>>,
    /// The proposing self-reflect node, protected from self-mutation.
    pub self_node_id: Option<String>,
}

/// Validation outcome plus the sanitized evolution to apply on success.
#[derive(Debug, Clone)]
pub struct EvolutionReport {
    pub valid: bool,
    pub errors: Vec<String>,
    pub sanitized: Evolution,
}

#[derive(Clone, Copy, PartialEq)]
enum Mark {
    White,
    Grey,
    Black,
}

/// Three-color DFS over the edge set.
fn has_cycle(workflow: &Workflow) -> bool {
    let mut succ: HashMap<&str, Vec<&str>> = HashMap::new();
    let ids: HashSet<&str> = workflow.nodes.iter().map(|n| n.id.as_str()).collect();
    for edge in &workflow.edges {
        if ids.contains(edge.source.as_str()) && ids.contains(edge.target.as_str()) {
            succ.entry(edge.source.as_str())
                .or_default()
                .push(edge.target.as_str());
        }
    }

    let mut marks: HashMap<&str, Mark> = ids.iter().map(|id| (*id, Mark::White)).collect();

    fn visit<'a>(
        node: &'a str,
        succ: &HashMap<&'a str, Vec<&'a str>>,
        marks: &mut HashMap<&'a str, Mark>,
    ) -> bool {
        marks.insert(node, Mark::Grey);
        for next in succ.get(node).into_iter().flatten() {
            match marks.get(next) {
                Some(Mark::Grey) => return true,
                Some(Mark::White) => {
                    if visit(next, succ, marks) {
                        return true;
                    }
                }
                _ => {}
            }
        }
        marks.insert(node, Mark::Black);
        false
    }

    let all: Vec<&str> = ids.into_iter().collect();
    for id in all {
        if marks.get(id) == Some(&Mark::White) && visit(id, &succ, &mut marks) {
            return true;
        }
    }
    false
}

/// Ids directly connected to `node_id` by any edge.
fn neighbors(workflow: &Workflow, node_id: &str) -> HashSet<String> {
    let mut out = HashSet::new();
    for edge in &workflow.edges {
        if edge.source == node_id {
            out.insert(edge.target.clone());
        }
        if edge.target == node_id {
            out.insert(edge.source.clone());
        }
    }
    out
}

struct MutationChecker<'a> {
    shadow: Workflow,
    self_node_id: Option<&'a str>,
    errors: Vec<String>,
}

impl<'a> MutationChecker<'a> {
    fn fail(&mut self, idx: usize, message: impl Into<String>) -> bool {
        self.errors.push(format!("mutation {idx}: {}", message.into()));
        false
    }

    fn touches_self(&mut self, idx: usize, op: &MutationOp) -> bool {
        let Some(self_id) = self.self_node_id else {
            return false;
        };
        if op.touched_nodes().iter().any(|id| *id == self_id) {
            self.fail(idx, "the self-reflect node may not be modified");
            return true;
        }
        false
    }

    /// Check path-addressed config updates (update-node-config, update-prompt,
    /// update-model are all expressed this way).
    fn check_config_update(
        &mut self,
        idx: usize,
        node_id: &str,
        segments: &[&str],
        value: &Value,
        text_only: bool,
    ) -> bool {
        let Some(node) = self.shadow.node(node_id) else {
            return self.fail(idx, format!("node '{node_id}' does not exist"));
        };
        let node_type = node.node_type;

        for segment in segments {
            if is_reserved_segment(segment) {
                return self.fail(idx, format!("path segment '{segment}' is not allowed"));
            }
        }

        let Some(spec) = registry().resolve_property(node_type, segments) else {
            return self.fail(
                idx,
                format!(
                    "path '{}' does not resolve within the {node_type} schema",
                    segments.join(".")
                ),
            );
        };

        if text_only && !spec.property_type.is_text() {
            return self.fail(
                idx,
                format!("property '{}' is not a text field", spec.key),
            );
        }

        if let Err(msg) = spec.check_value(value) {
            return self.fail(idx, msg);
        }

        // Renames must preserve display-name uniqueness.
        if segments == ["name"] {
            let new_name = value.as_str().unwrap_or_default();
            let taken = self
                .shadow
                .nodes
                .iter()
                .any(|n| n.id != node_id && n.name() == new_name);
            if taken {
                return self.fail(idx, format!("node name '{new_name}' is already in use"));
            }
        }

        true
    }

    fn check(&mut self, idx: usize, op: &MutationOp) -> bool {
        if self.touches_self(idx, op) {
            return false;
        }

        match op {
            MutationOp::UpdateNodeConfig {
                node_id,
                path,
                value,
            } => {
                let segments: Vec<&str> = path.split('.').collect();
                if segments.iter().any(|s| s.is_empty()) {
                    return self.fail(idx, format!("malformed config path '{path}'"));
                }
                self.check_config_update(idx, node_id, &segments, value, false)
            }
            MutationOp::UpdatePrompt {
                node_id,
                field,
                new_value,
            } => self.check_config_update(
                idx,
                node_id,
                &[field.as_str()],
                &Value::String(new_value.clone()),
                true,
            ),
            MutationOp::UpdateModel { node_id, new_model } => {
                let Some(node) = self.shadow.node(node_id) else {
                    return self.fail(idx, format!("node '{node_id}' does not exist"));
                };
                let node_type = node.node_type;
                let Some(spec) = registry().resolve_property(node_type, &["model"]) else {
                    return self.fail(
                        idx,
                        format!("{node_type} nodes do not define a model property"),
                    );
                };
                if let Err(msg) = spec.check_value(&Value::String(new_model.clone())) {
                    return self.fail(idx, msg);
                }
                true
            }
            MutationOp::AddNode {
                node,
                connect_from,
                connect_to,
            } => {
                if self.shadow.node(&node.id).is_some() {
                    return self.fail(idx, format!("node id '{}' already exists", node.id));
                }
                if node.name().is_empty() {
                    return self.fail(idx, "new node needs a non-empty name");
                }
                if self.shadow.nodes.iter().any(|n| n.name() == node.name()) {
                    return self.fail(
                        idx,
                        format!("node name '{}' is already in use", node.name()),
                    );
                }
                if !node.position.x.is_finite() || !node.position.y.is_finite() {
                    return self.fail(idx, "node position must be finite");
                }
                if !node.type_tags_match() {
                    return self.fail(idx, "node type and data.type disagree");
                }

                for endpoint in [connect_from, connect_to].into_iter().flatten() {
                    if self.shadow.node(endpoint).is_none() {
                        return self.fail(
                            idx,
                            format!("auto-edge endpoint '{endpoint}' does not exist"),
                        );
                    }
                    if self.self_node_id == Some(endpoint.as_str()) {
                        return self.fail(idx, "may not auto-connect to the self-reflect node");
                    }
                }

                // Trial-apply to check edge collisions and acyclicity.
                let mut trial = self.shadow.clone();
                if let Err(e) = apply_mutation(&mut trial, op) {
                    return self.fail(idx, e);
                }
                let mut keys = HashSet::new();
                for edge in &trial.edges {
                    if !keys.insert(edge.key()) {
                        return self.fail(idx, "auto-created edge duplicates an existing edge");
                    }
                }
                if has_cycle(&trial) {
                    return self.fail(idx, "connecting the new node introduces a cycle");
                }
                true
            }
            MutationOp::RemoveNode { node_id } => {
                let Some(node_type) = self.shadow.node(node_id).map(|n| n.node_type) else {
                    return self.fail(idx, format!("node '{node_id}' does not exist"));
                };
                if matches!(node_type, NodeType::Input | NodeType::Output) {
                    return self.fail(idx, "input and output nodes cannot be removed");
                }
                let deletable = registry()
                    .schema_for(node_type)
                    .map(|s| s.deletable)
                    .unwrap_or(false);
                if !deletable {
                    return self.fail(idx, format!("{node_type} nodes are not deletable"));
                }
                let protected = self
                    .self_node_id
                    .is_some_and(|self_id| neighbors(&self.shadow, self_id).contains(node_id));
                if protected {
                    return self.fail(
                        idx,
                        "may not remove a neighbor of the self-reflect node",
                    );
                }
                true
            }
            MutationOp::AddEdge { edge } => {
                for endpoint in [&edge.source, &edge.target] {
                    if self.shadow.node(endpoint).is_none() {
                        return self.fail(idx, format!("edge endpoint '{endpoint}' does not exist"));
                    }
                }
                if self.shadow.edges.iter().any(|e| e.id == edge.id) {
                    return self.fail(idx, format!("edge id '{}' already exists", edge.id));
                }
                if self.shadow.edges.iter().any(|e| e.key() == edge.key()) {
                    return self.fail(idx, "an identical edge already exists");
                }
                let mut trial = self.shadow.clone();
                trial.edges.push(edge.clone());
                if has_cycle(&trial) {
                    return self.fail(idx, "edge introduces a cycle");
                }
                true
            }
            MutationOp::RemoveEdge { edge_id } => {
                let Some(edge) = self.shadow.edges.iter().find(|e| e.id == *edge_id) else {
                    return self.fail(idx, format!("edge '{edge_id}' does not exist"));
                };
                let touches_self = self
                    .self_node_id
                    .is_some_and(|self_id| edge.source == self_id || edge.target == self_id);
                if touches_self {
                    return self.fail(idx, "may not remove an edge of the self-reflect node");
                }
                true
            }
            MutationOp::UpdateWorkflowSetting { field, .. } => {
                if matches!(field.as_str(), "name" | "description" | "workingDirectory") {
                    true
                } else {
                    self.fail(idx, format!("'{field}' is not an updatable workflow setting"))
                }
            }
        }
    }
}

/// Validate a raw candidate against `workflow`.
pub fn validate_evolution(
    workflow: &Workflow,
    candidate: &Value,
    options: &ValidateOptions,
) -> EvolutionReport {
    let (sanitized, mut errors) = sanitize_evolution(candidate);

    if let Some(max) = options.max_mutations {
        if sanitized.mutations.len() > max {
            errors.push(format!(
                "evolution proposes {} mutations; at most {max} are allowed",
                sanitized.mutations.len()
            ));
        }
    }

    let mut checker = MutationChecker {
        shadow: workflow.clone(),
        self_node_id: options.self_node_id.as_deref(),
        errors: Vec::new(),
    };

    for (idx, op) in sanitized.mutations.iter().enumerate() {
        if let Some(allowed) = &options.scope {
            let scope = op.scope();
            if !allowed.contains(&scope) {
                checker.errors.push(format!(
                    "mutation {idx}: scope '{}' is not allowed here",
                    serde_json::to_string(&scope)
                        .unwrap_or_default()
                        .trim_matches('"')
                ));
                continue;
            }
        }

        if checker.check(idx, op) {
            // Passed checks: thread the effect so later mutations see it.
            if let Err(e) = apply_mutation(&mut checker.shadow, op) {
                checker.errors.push(format!("mutation {idx}: {e}"));
            }
        }
    }

    errors.extend(checker.errors);

    EvolutionReport {
        valid: errors.is_empty(),
        sanitized,
        errors,
    }
}
