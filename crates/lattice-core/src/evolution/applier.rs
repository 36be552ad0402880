//! Applies validated evolutions to a workflow definition.
//!
//! The applier is the only writer of workflow state during a run. Mutations
//! are applied to a deep copy; the caller swaps the copy in only after
//! persistence succeeds.

use chrono::Utc;
use serde_json::Value;
use std::sync::Arc;
use tracing::info;

use super::{Evolution, MutationOp};
use crate::error::{ErrorCode, ExecutionError};
use crate::storage::WorkflowStore;
use crate::workflow::{Edge, EvolutionRecord, NodeConfig, Workflow};
use crate::{LatticeError, Result};

/// Set `value` at `path` inside a JSON object tree.
///
/// Intermediate segments must already exist; the final segment may introduce
/// a new key on an object. Array segments must be in-bounds indices.
fn set_json_path(root: &mut Value, path: &[String], value: Value) -> std::result::Result<(), String> {
    let Some((last, parents)) = path.split_last() else {
        return Err("empty config path".into());
    };

    let mut current = root;
    for segment in parents {
        current = match current {
            Value::Object(map) => map
                .get_mut(segment.as_str())
                .ok_or_else(|| format!("path segment '{segment}' does not exist"))?,
            Value::Array(items) => {
                let idx: usize = segment
                    .parse()
                    .map_err(|_| format!("'{segment}' is not an array index"))?;
                items
                    .get_mut(idx)
                    .ok_or_else(|| format!("array index {idx} out of bounds"))?
            }
            _ => return Err(format!("path segment '{segment}' is not addressable")),
        };
    }

    match current {
        Value::Object(map) => {
            map.insert(last.clone(), value);
            Ok(())
        }
        Value::Array(items) => {
            let idx: usize = last
                .parse()
                .map_err(|_| format!("'{last}' is not an array index"))?;
            let slot = items
                .get_mut(idx)
                .ok_or_else(|| format!("array index {idx} out of bounds"))?;
            *slot = value;
            Ok(())
        }
        _ => Err(format!("cannot set '{last}' on a scalar")),
    }
}

/// Rewrite one config field of a node through a JSON round-trip, so path
/// edits work uniformly across the typed payload variants.
fn update_config_path(
    workflow: &mut Workflow,
    node_id: &str,
    path: &[String],
    value: Value,
) -> std::result::Result<(), String> {
    let node = workflow
        .node_mut(node_id)
        .ok_or_else(|| format!("node '{node_id}' does not exist"))?;

    let mut raw = serde_json::to_value(&node.data).map_err(|e| e.to_string())?;
    set_json_path(&mut raw, path, value)?;
    node.data = serde_json::from_value::<NodeConfig>(raw)
        .map_err(|e| format!("config for node '{node_id}' no longer parses: {e}"))?;
    Ok(())
}

fn auto_edge(source: &str, target: &str) -> Edge {
    Edge {
        id: format!("edge-{source}-{target}"),
        source: source.to_string(),
        target: target.to_string(),
        source_handle: None,
        target_handle: None,
        edge_type: None,
    }
}

/// Apply one mutation in place. Shared by the validator (on its shadow copy)
/// and the applier, so both see identical semantics.
pub fn apply_mutation(workflow: &mut Workflow, op: &MutationOp) -> std::result::Result<(), String> {
    match op {
        MutationOp::UpdateNodeConfig {
            node_id,
            path,
            value,
        } => {
            let segments: Vec<String> = path.split('.').map(String::from).collect();
            update_config_path(workflow, node_id, &segments, value.clone())
        }
        MutationOp::UpdatePrompt {
            node_id,
            field,
            new_value,
        } => update_config_path(
            workflow,
            node_id,
            &[field.clone()],
            Value::String(new_value.clone()),
        ),
        MutationOp::UpdateModel { node_id, new_model } => update_config_path(
            workflow,
            node_id,
            &["model".to_string()],
            Value::String(new_model.clone()),
        ),
        MutationOp::AddNode {
            node,
            connect_from,
            connect_to,
        } => {
            workflow.nodes.push(node.clone());
            if let Some(from) = connect_from {
                workflow.edges.push(auto_edge(from, &node.id));
            }
            if let Some(to) = connect_to {
                workflow.edges.push(auto_edge(&node.id, to));
            }
            Ok(())
        }
        MutationOp::RemoveNode { node_id } => {
            let before = workflow.nodes.len();
            workflow.nodes.retain(|n| n.id != *node_id);
            if workflow.nodes.len() == before {
                return Err(format!("node '{node_id}' does not exist"));
            }
            workflow
                .edges
                .retain(|e| e.source != *node_id && e.target != *node_id);
            Ok(())
        }
        MutationOp::AddEdge { edge } => {
            workflow.edges.push(edge.clone());
            Ok(())
        }
        MutationOp::RemoveEdge { edge_id } => {
            let before = workflow.edges.len();
            workflow.edges.retain(|e| e.id != *edge_id);
            if workflow.edges.len() == before {
                return Err(format!("edge '{edge_id}' does not exist"));
            }
            Ok(())
        }
        MutationOp::UpdateWorkflowSetting { field, value } => {
            match field.as_str() {
                "name" => workflow.name = value.clone(),
                "description" => workflow.description = Some(value.clone()),
                "workingDirectory" => workflow.working_directory = Some(value.clone()),
                other => return Err(format!("'{other}' is not an updatable workflow setting")),
            }
            Ok(())
        }
    }
}

/// Apply a validated evolution to a deep copy and return the new definition
/// with its history record appended. Does not persist.
pub fn apply_evolution(
    workflow: &Workflow,
    evolution: &Evolution,
    source_node_id: &str,
) -> Result<Workflow> {
    let before_digest = workflow.snapshot_digest();
    let mut next = workflow.clone();

    for (idx, op) in evolution.mutations.iter().enumerate() {
        apply_mutation(&mut next, op)
            .map_err(|e| LatticeError::Evolution(format!("mutation {idx} failed to apply: {e}")))?;
    }

    next.updated_at = Utc::now();
    let record = EvolutionRecord {
        applied_at: next.updated_at,
        node_id: source_node_id.to_string(),
        reasoning: evolution.reasoning.clone(),
        mutations: evolution.mutations.clone(),
        before_digest,
        after_digest: next.snapshot_digest(),
    };
    next.evolution_history
        .get_or_insert_with(Vec::new)
        .push(record);

    Ok(next)
}

/// Commits evolutions: apply, persist, hand back the updated definition.
pub struct EvolutionApplier {
    store: Arc<dyn WorkflowStore>,
}

impl EvolutionApplier {
    pub fn new(store: Arc<dyn WorkflowStore>) -> Self {
        Self { store }
    }

    /// Apply and persist. A storage failure surfaces as
    /// `EVOLUTION_APPLY_FAILED` and leaves the caller's definition untouched.
    pub async fn apply(
        &self,
        workflow: &Workflow,
        evolution: &Evolution,
        source_node_id: &str,
    ) -> std::result::Result<Workflow, ExecutionError> {
        let next = apply_evolution(workflow, evolution, source_node_id).map_err(|e| {
            ExecutionError::new(ErrorCode::EvolutionApplyFailed, e.to_string())
                .with_node(source_node_id)
        })?;

        self.store.save(&next).await.map_err(|e| {
            ExecutionError::new(
                ErrorCode::EvolutionApplyFailed,
                format!("failed to persist evolved workflow: {e}"),
            )
            .with_node(source_node_id)
        })?;

        info!(
            workflow_id = %next.id,
            mutations = evolution.mutations.len(),
            "applied workflow evolution"
        );
        Ok(next)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workflow::{
        AgentNodeConfig, InputConfig, NodeConfig, NodeType, OutputNodeConfig, Position,
        WorkflowNode,
    };
    use serde_json::json;

    fn agent_node(id: &str, name: &str) -> WorkflowNode {
        WorkflowNode {
            id: id.into(),
            node_type: NodeType::ClaudeAgent,
            position: Position { x: 10.0, y: 20.0 },
            data: NodeConfig::ClaudeAgent(AgentNodeConfig {
                name: name.into(),
                user_query: "{{Input.prompt}}".into(),
                model: Some("sonnet".into()),
                system_prompt: None,
                working_directory: None,
                session_reference: None,
                output_schema: None,
                output_file_path: None,
                timeout_ms: None,
                mcp_servers: vec![],
            }),
        }
    }

    fn base_workflow() -> Workflow {
        Workflow {
            id: "w".into(),
            name: "base".into(),
            description: None,
            working_directory: None,
            nodes: vec![
                WorkflowNode {
                    id: "in".into(),
                    node_type: NodeType::Input,
                    position: Position { x: 0.0, y: 0.0 },
                    data: NodeConfig::Input(InputConfig { name: "Input".into() }),
                },
                agent_node("a", "Agent"),
                WorkflowNode {
                    id: "out".into(),
                    node_type: NodeType::Output,
                    position: Position { x: 0.0, y: 0.0 },
                    data: NodeConfig::Output(OutputNodeConfig { name: "Output".into() }),
                },
            ],
            edges: vec![
                Edge {
                    id: "e1".into(),
                    source: "in".into(),
                    target: "a".into(),
                    source_handle: None,
                    target_handle: None,
                    edge_type: None,
                },
                Edge {
                    id: "e2".into(),
                    source: "a".into(),
                    target: "out".into(),
                    source_handle: None,
                    target_handle: None,
                    edge_type: None,
                },
            ],
            created_at: Utc::now(),
            updated_at: Utc::now(),
            evolution_history: None,
        }
    }

    #[test]
    fn update_model_mutation() {
        let mut wf = base_workflow();
        apply_mutation(
            &mut wf,
            &MutationOp::UpdateModel {
                node_id: "a".into(),
                new_model: "opus".into(),
            },
        )
        .unwrap();
        match &wf.node("a").unwrap().data {
            NodeConfig::ClaudeAgent(c) => assert_eq!(c.model.as_deref(), Some("opus")),
            other => panic!("unexpected config {other:?}"),
        }
    }

    #[test]
    fn update_config_path_rename() {
        let mut wf = base_workflow();
        apply_mutation(
            &mut wf,
            &MutationOp::UpdateNodeConfig {
                node_id: "a".into(),
                path: "name".into(),
                value: json!("Better Agent"),
            },
        )
        .unwrap();
        assert_eq!(wf.node("a").unwrap().name(), "Better Agent");
    }

    #[test]
    fn update_unknown_node_fails() {
        let mut wf = base_workflow();
        let err = apply_mutation(
            &mut wf,
            &MutationOp::UpdateModel {
                node_id: "ghost".into(),
                new_model: "opus".into(),
            },
        )
        .unwrap_err();
        assert!(err.contains("ghost"));
    }

    #[test]
    fn remove_node_drops_its_edges() {
        let mut wf = base_workflow();
        apply_mutation(&mut wf, &MutationOp::RemoveNode { node_id: "a".into() }).unwrap();
        assert!(wf.node("a").is_none());
        assert!(wf.edges.is_empty());
    }

    #[test]
    fn add_node_with_auto_edges() {
        let mut wf = base_workflow();
        apply_mutation(
            &mut wf,
            &MutationOp::AddNode {
                node: agent_node("b", "Reviewer"),
                connect_from: Some("a".into()),
                connect_to: Some("out".into()),
            },
        )
        .unwrap();
        assert!(wf.node("b").is_some());
        assert!(wf.edges.iter().any(|e| e.source == "a" && e.target == "b"));
        assert!(wf.edges.iter().any(|e| e.source == "b" && e.target == "out"));
    }

    #[test]
    fn workflow_setting_updates() {
        let mut wf = base_workflow();
        apply_mutation(
            &mut wf,
            &MutationOp::UpdateWorkflowSetting {
                field: "workingDirectory".into(),
                value: "/srv/project".into(),
            },
        )
        .unwrap();
        assert_eq!(wf.working_directory.as_deref(), Some("/srv/project"));

        let err = apply_mutation(
            &mut wf,
            &MutationOp::UpdateWorkflowSetting {
                field: "id".into(),
                value: "nope".into(),
            },
        )
        .unwrap_err();
        assert!(err.contains("not an updatable"));
    }

    #[test]
    fn apply_evolution_records_history() {
        let wf = base_workflow();
        let evolution = Evolution {
            reasoning: "use a stronger model".into(),
            expected_impact: "better results".into(),
            risk_assessment: "low".into(),
            rollback_plan: None,
            mutations: vec![MutationOp::UpdateModel {
                node_id: "a".into(),
                new_model: "opus".into(),
            }],
        };

        let next = apply_evolution(&wf, &evolution, "reflect-1").unwrap();
        let history = next.evolution_history.as_ref().unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].node_id, "reflect-1");
        assert_ne!(history[0].before_digest, history[0].after_digest);
        assert_eq!(history[0].before_digest, wf.snapshot_digest());
        // Source definition untouched.
        assert!(wf.evolution_history.is_none());
    }
}
