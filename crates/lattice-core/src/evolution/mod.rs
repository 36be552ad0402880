//! Workflow evolution: agent-proposed mutation sets, their validation, and
//! their application to the live definition.

mod applier;
mod validator;

pub use applier::{apply_evolution, apply_mutation, EvolutionApplier};
pub use validator::{validate_evolution, EvolutionReport, ValidateOptions};

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::workflow::{Edge, WorkflowNode};

/// A proposed set of mutations, typically emitted by a self-reflect node.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Evolution {
    #[serde(default)]
    pub reasoning: String,
    #[serde(default)]
    pub expected_impact: String,
    #[serde(default)]
    pub risk_assessment: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rollback_plan: Option<String>,
    #[serde(default)]
    pub mutations: Vec<MutationOp>,
}

/// One atomic change to a workflow.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case", rename_all_fields = "camelCase")]
pub enum MutationOp {
    UpdateNodeConfig {
        node_id: String,
        /// Dot-separated path into the node's config, e.g. `rules.0.compareValue`.
        path: String,
        value: Value,
    },
    UpdatePrompt {
        node_id: String,
        field: String,
        new_value: String,
    },
    UpdateModel {
        node_id: String,
        new_model: String,
    },
    AddNode {
        node: WorkflowNode,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        connect_from: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        connect_to: Option<String>,
    },
    RemoveNode {
        node_id: String,
    },
    AddEdge {
        edge: Edge,
    },
    RemoveEdge {
        edge_id: String,
    },
    UpdateWorkflowSetting {
        field: String,
        value: String,
    },
}

/// Scope classes a self-reflect node may be restricted to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EvolutionScope {
    Prompts,
    Models,
    Structure,
    Settings,
    Config,
}

/// Config-path root segments that count as prompt edits.
const PROMPT_ROOTS: [&str; 4] = ["userQuery", "systemPrompt", "promptMessage", "reflectionGoal"];

impl MutationOp {
    /// The scope class this mutation falls into.
    ///
    /// `update-node-config` is classified by the root path segment: `model`
    /// edits count as model scope, known prompt fields as prompt scope, and
    /// everything else as general config.
    pub fn scope(&self) -> EvolutionScope {
        match self {
            MutationOp::UpdatePrompt { .. } => EvolutionScope::Prompts,
            MutationOp::UpdateModel { .. } => EvolutionScope::Models,
            MutationOp::AddNode { .. }
            | MutationOp::RemoveNode { .. }
            | MutationOp::AddEdge { .. }
            | MutationOp::RemoveEdge { .. } => EvolutionScope::Structure,
            MutationOp::UpdateWorkflowSetting { .. } => EvolutionScope::Settings,
            MutationOp::UpdateNodeConfig { path, .. } => {
                let root = path.split('.').next().unwrap_or("");
                if root == "model" {
                    EvolutionScope::Models
                } else if PROMPT_ROOTS.contains(&root) {
                    EvolutionScope::Prompts
                } else {
                    EvolutionScope::Config
                }
            }
        }
    }

    /// Node ids this mutation touches (used for self-node protection).
    pub fn touched_nodes(&self) -> Vec<&str> {
        match self {
            MutationOp::UpdateNodeConfig { node_id, .. }
            | MutationOp::UpdatePrompt { node_id, .. }
            | MutationOp::UpdateModel { node_id, .. }
            | MutationOp::RemoveNode { node_id } => vec![node_id],
            MutationOp::AddEdge { edge } => vec![&edge.source, &edge.target],
            MutationOp::AddNode { .. }
            | MutationOp::RemoveEdge { .. }
            | MutationOp::UpdateWorkflowSetting { .. } => vec![],
        }
    }
}

fn coerce_string(value: Option<&Value>) -> String {
    match value {
        Some(Value::String(s)) => s.clone(),
        Some(Value::Null) | None => String::new(),
        Some(other) => other.to_string(),
    }
}

/// Shape a raw candidate value into an [`Evolution`].
///
/// Prose fields are string-coerced; mutation entries that are not objects
/// are dropped. Object entries that do not parse as a known op are kept as
/// errors for the validator to report.
pub fn sanitize_evolution(candidate: &Value) -> (Evolution, Vec<String>) {
    let mut errors = Vec::new();
    let obj = candidate.as_object();

    let mut mutations = Vec::new();
    if let Some(raw) = obj
        .and_then(|o| o.get("mutations"))
        .and_then(Value::as_array)
    {
        for (idx, entry) in raw.iter().enumerate() {
            if !entry.is_object() {
                continue;
            }
            match serde_json::from_value::<MutationOp>(entry.clone()) {
                Ok(op) => mutations.push(op),
                Err(e) => errors.push(format!("mutation {idx} is not a recognised operation: {e}")),
            }
        }
    }

    let evolution = Evolution {
        reasoning: coerce_string(obj.and_then(|o| o.get("reasoning"))),
        expected_impact: coerce_string(obj.and_then(|o| o.get("expectedImpact"))),
        risk_assessment: coerce_string(obj.and_then(|o| o.get("riskAssessment"))),
        rollback_plan: obj
            .and_then(|o| o.get("rollbackPlan"))
            .and_then(Value::as_str)
            .map(String::from),
        mutations,
    };

    (evolution, errors)
}

/// JSON schema handed to reflection agents describing an [`Evolution`].
pub fn evolution_output_schema() -> Value {
    serde_json::json!({
        "type": "object",
        "properties": {
            "reasoning": {"type": "string"},
            "expectedImpact": {"type": "string"},
            "riskAssessment": {"type": "string"},
            "rollbackPlan": {"type": "string"},
            "mutations": {
                "type": "array",
                "items": {
                    "type": "object",
                    "properties": {
                        "type": {"type": "string"},
                        "nodeId": {"type": "string"},
                        "path": {"type": "string"},
                        "value": {},
                        "field": {"type": "string"},
                        "newValue": {"type": "string"},
                        "newModel": {"type": "string"},
                        "node": {"type": "object"},
                        "edge": {"type": "object"},
                        "edgeId": {"type": "string"},
                        "connectFrom": {"type": "string"},
                        "connectTo": {"type": "string"}
                    },
                    "required": ["type"]
                }
            }
        },
        "required": ["reasoning", "mutations"]
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn mutation_wire_tags() {
        let op = MutationOp::UpdateModel {
            node_id: "a".into(),
            new_model: "opus".into(),
        };
        let json = serde_json::to_string(&op).unwrap();
        assert!(json.contains("\"type\":\"update-model\""));
        assert!(json.contains("\"newModel\":\"opus\""));
    }

    #[test]
    fn scopes_per_op() {
        assert_eq!(
            MutationOp::UpdateModel {
                node_id: "a".into(),
                new_model: "opus".into()
            }
            .scope(),
            EvolutionScope::Models
        );
        assert_eq!(
            MutationOp::RemoveEdge { edge_id: "e".into() }.scope(),
            EvolutionScope::Structure
        );
        assert_eq!(
            MutationOp::UpdateNodeConfig {
                node_id: "a".into(),
                path: "model".into(),
                value: json!("opus")
            }
            .scope(),
            EvolutionScope::Models
        );
        assert_eq!(
            MutationOp::UpdateNodeConfig {
                node_id: "a".into(),
                path: "userQuery".into(),
                value: json!("hi")
            }
            .scope(),
            EvolutionScope::Prompts
        );
        assert_eq!(
            MutationOp::UpdateNodeConfig {
                node_id: "a".into(),
                path: "timeout".into(),
                value: json!(5)
            }
            .scope(),
            EvolutionScope::Config
        );
    }

    #[test]
    fn sanitize_drops_non_object_mutations() {
        let candidate = json!({
            "reasoning": "tighten prompts",
            "expectedImpact": 3,
            "mutations": [
                "not-a-mutation",
                42,
                {"type": "update-model", "nodeId": "a", "newModel": "opus"}
            ]
        });
        let (evolution, errors) = sanitize_evolution(&candidate);
        assert!(errors.is_empty());
        assert_eq!(evolution.mutations.len(), 1);
        assert_eq!(evolution.reasoning, "tighten prompts");
        // Non-string prose is coerced, not dropped.
        assert_eq!(evolution.expected_impact, "3");
    }

    #[test]
    fn sanitize_reports_unparseable_object_mutations() {
        let candidate = json!({
            "reasoning": "r",
            "mutations": [{"type": "teleport-node", "nodeId": "a"}]
        });
        let (evolution, errors) = sanitize_evolution(&candidate);
        assert!(evolution.mutations.is_empty());
        assert_eq!(errors.len(), 1);
        assert!(errors[0].contains("mutation 0"));
    }

    #[test]
    fn sanitize_tolerates_non_object_candidate() {
        let (evolution, errors) = sanitize_evolution(&json!("nonsense"));
        assert!(evolution.mutations.is_empty());
        assert!(errors.is_empty());
        assert_eq!(evolution.reasoning, "");
    }
}
