//! Workflow definition model: nodes, edges, per-type configuration payloads.
//!
//! Workflows are authored and stored as JSON documents; every type here
//! round-trips through serde with the camelCase field names those documents
//! use. A node carries its type twice (the outer `type` and `data.type`);
//! [`WorkflowNode::type_tags_match`] checks the two agree.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::collections::{HashMap, HashSet};

use crate::event::AgentEvent;
use crate::evolution::{EvolutionScope, MutationOp};

// ---------------------------------------------------------------------------
// Node type & status
// ---------------------------------------------------------------------------

/// The ten node kinds the engine can drive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum NodeType {
    Input,
    Output,
    ClaudeAgent,
    CodexAgent,
    Condition,
    Merge,
    Javascript,
    Bash,
    Approval,
    SelfReflect,
}

impl NodeType {
    pub const ALL: [NodeType; 10] = [
        NodeType::Input,
        NodeType::Output,
        NodeType::ClaudeAgent,
        NodeType::CodexAgent,
        NodeType::Condition,
        NodeType::Merge,
        NodeType::Javascript,
        NodeType::Bash,
        NodeType::Approval,
        NodeType::SelfReflect,
    ];

    pub fn is_agent(&self) -> bool {
        matches!(self, NodeType::ClaudeAgent | NodeType::CodexAgent)
    }
}

impl std::fmt::Display for NodeType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let tag = match self {
            NodeType::Input => "input",
            NodeType::Output => "output",
            NodeType::ClaudeAgent => "claude-agent",
            NodeType::CodexAgent => "codex-agent",
            NodeType::Condition => "condition",
            NodeType::Merge => "merge",
            NodeType::Javascript => "javascript",
            NodeType::Bash => "bash",
            NodeType::Approval => "approval",
            NodeType::SelfReflect => "self-reflect",
        };
        write!(f, "{tag}")
    }
}

/// Lifecycle status of a node within one execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeStatus {
    Pending,
    Running,
    Waiting,
    Complete,
    Error,
    Skipped,
}

impl NodeStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            NodeStatus::Complete | NodeStatus::Error | NodeStatus::Skipped
        )
    }

    /// Legal transitions. `waiting` may only resolve to a terminal status.
    pub fn can_transition_to(&self, next: NodeStatus) -> bool {
        match self {
            NodeStatus::Pending => matches!(
                next,
                NodeStatus::Running | NodeStatus::Skipped | NodeStatus::Error
            ),
            NodeStatus::Running => matches!(
                next,
                NodeStatus::Waiting
                    | NodeStatus::Complete
                    | NodeStatus::Error
                    | NodeStatus::Skipped
            ),
            NodeStatus::Waiting => matches!(
                next,
                NodeStatus::Complete | NodeStatus::Error | NodeStatus::Skipped
            ),
            // Terminal statuses only move back to pending when a loop re-arms
            // the node; the scheduler resets them explicitly.
            NodeStatus::Complete | NodeStatus::Error | NodeStatus::Skipped => {
                matches!(next, NodeStatus::Pending)
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Per-type configuration payloads
// ---------------------------------------------------------------------------

/// Condition rule operators.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConditionOperator {
    Equals,
    NotEquals,
    Contains,
    NotContains,
    GreaterThan,
    LessThan,
    GreaterThanOrEquals,
    LessThanOrEquals,
    IsEmpty,
    IsNotEmpty,
    Regex,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RuleCombinator {
    And,
    Or,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConditionRule {
    /// Template resolved against upstream outputs, e.g. `{{Input.prompt}}`.
    pub input_reference: String,
    pub operator: ConditionOperator,
    #[serde(default)]
    pub compare_value: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum MergeStrategy {
    WaitAll,
    FirstComplete,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ApprovalTimeoutAction {
    Approve,
    Reject,
    Fail,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AgentFlavor {
    Claude,
    Codex,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ReflectMode {
    DryRun,
    Suggest,
    AutoApply,
}

/// Maps one upstream reference to a named variable exposed to a script.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InputMapping {
    pub variable: String,
    pub reference: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InputConfig {
    pub name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OutputNodeConfig {
    pub name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentNodeConfig {
    pub name: String,
    /// Prompt template; `{{...}}` references resolve against upstream outputs.
    #[serde(default)]
    pub user_query: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub system_prompt: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub working_directory: Option<String>,
    /// Reference template resolving to a session id to resume.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_reference: Option<String>,
    /// JSON schema (as a string) constraining the agent's final response.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output_schema: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output_file_path: Option<String>,
    #[serde(rename = "timeout", skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub mcp_servers: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConditionConfig {
    pub name: String,
    #[serde(default = "default_combinator")]
    pub combinator: RuleCombinator,
    #[serde(default)]
    pub rules: Vec<ConditionRule>,
}

fn default_combinator() -> RuleCombinator {
    RuleCombinator::And
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MergeConfig {
    pub name: String,
    #[serde(default = "default_merge_strategy")]
    pub strategy: MergeStrategy,
}

fn default_merge_strategy() -> MergeStrategy {
    MergeStrategy::WaitAll
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScriptConfig {
    pub name: String,
    #[serde(default)]
    pub code: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub input_mappings: Vec<InputMapping>,
    #[serde(rename = "timeout", skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApprovalConfig {
    pub name: String,
    #[serde(default)]
    pub prompt_message: String,
    /// Template whose resolution is shown to the approver.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub display_data_reference: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub feedback_prompt: Option<String>,
    #[serde(rename = "timeout", skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
    #[serde(default = "default_timeout_action")]
    pub timeout_action: ApprovalTimeoutAction,
}

fn default_timeout_action() -> ApprovalTimeoutAction {
    ApprovalTimeoutAction::Reject
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SelfReflectConfig {
    pub name: String,
    #[serde(default = "default_reflect_agent")]
    pub agent: AgentFlavor,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(default = "default_reflect_mode")]
    pub mode: ReflectMode,
    #[serde(default)]
    pub reflection_goal: String,
    #[serde(default)]
    pub scope: Vec<EvolutionScope>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_mutations: Option<usize>,
    #[serde(default)]
    pub include_transcripts: bool,
    #[serde(rename = "timeout", skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
}

fn default_reflect_agent() -> AgentFlavor {
    AgentFlavor::Claude
}

fn default_reflect_mode() -> ReflectMode {
    ReflectMode::DryRun
}

/// Per-node configuration payload, tagged by node type.
///
/// The tag doubles as `data.type` in the stored JSON shape.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum NodeConfig {
    Input(InputConfig),
    Output(OutputNodeConfig),
    ClaudeAgent(AgentNodeConfig),
    CodexAgent(AgentNodeConfig),
    Condition(ConditionConfig),
    Merge(MergeConfig),
    Javascript(ScriptConfig),
    Bash(ScriptConfig),
    Approval(ApprovalConfig),
    SelfReflect(SelfReflectConfig),
}

impl NodeConfig {
    pub fn node_type(&self) -> NodeType {
        match self {
            NodeConfig::Input(_) => NodeType::Input,
            NodeConfig::Output(_) => NodeType::Output,
            NodeConfig::ClaudeAgent(_) => NodeType::ClaudeAgent,
            NodeConfig::CodexAgent(_) => NodeType::CodexAgent,
            NodeConfig::Condition(_) => NodeType::Condition,
            NodeConfig::Merge(_) => NodeType::Merge,
            NodeConfig::Javascript(_) => NodeType::Javascript,
            NodeConfig::Bash(_) => NodeType::Bash,
            NodeConfig::Approval(_) => NodeType::Approval,
            NodeConfig::SelfReflect(_) => NodeType::SelfReflect,
        }
    }

    /// The node's display name, unique across a workflow.
    pub fn name(&self) -> &str {
        match self {
            NodeConfig::Input(c) => &c.name,
            NodeConfig::Output(c) => &c.name,
            NodeConfig::ClaudeAgent(c) | NodeConfig::CodexAgent(c) => &c.name,
            NodeConfig::Condition(c) => &c.name,
            NodeConfig::Merge(c) => &c.name,
            NodeConfig::Javascript(c) | NodeConfig::Bash(c) => &c.name,
            NodeConfig::Approval(c) => &c.name,
            NodeConfig::SelfReflect(c) => &c.name,
        }
    }

    pub fn set_name(&mut self, name: String) {
        match self {
            NodeConfig::Input(c) => c.name = name,
            NodeConfig::Output(c) => c.name = name,
            NodeConfig::ClaudeAgent(c) | NodeConfig::CodexAgent(c) => c.name = name,
            NodeConfig::Condition(c) => c.name = name,
            NodeConfig::Merge(c) => c.name = name,
            NodeConfig::Javascript(c) | NodeConfig::Bash(c) => c.name = name,
            NodeConfig::Approval(c) => c.name = name,
            NodeConfig::SelfReflect(c) => c.name = name,
        }
    }

    /// Per-node wall-clock bound in milliseconds, where configured.
    pub fn timeout_ms(&self) -> Option<u64> {
        match self {
            NodeConfig::ClaudeAgent(c) | NodeConfig::CodexAgent(c) => c.timeout_ms,
            NodeConfig::Javascript(c) | NodeConfig::Bash(c) => c.timeout_ms,
            NodeConfig::Approval(c) => c.timeout_ms,
            NodeConfig::SelfReflect(c) => c.timeout_ms,
            _ => None,
        }
    }
}

// ---------------------------------------------------------------------------
// Nodes, edges, workflow
// ---------------------------------------------------------------------------

/// Canvas position. Opaque to the engine; kept for round-tripping.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Position {
    pub x: f64,
    pub y: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowNode {
    pub id: String,
    #[serde(rename = "type")]
    pub node_type: NodeType,
    pub position: Position,
    pub data: NodeConfig,
}

impl WorkflowNode {
    pub fn name(&self) -> &str {
        self.data.name()
    }

    /// The stored shape carries the node type twice; they must agree.
    pub fn type_tags_match(&self) -> bool {
        self.node_type == self.data.node_type()
    }
}

/// Source-handle labels used by condition and approval fan-out.
pub mod handles {
    pub const TRUE: &str = "true";
    pub const FALSE: &str = "false";
    pub const APPROVED: &str = "approved";
    pub const REJECTED: &str = "rejected";
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Edge {
    pub id: String,
    pub source: String,
    pub target: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source_handle: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub target_handle: Option<String>,
    #[serde(rename = "edgeType", skip_serializing_if = "Option::is_none")]
    pub edge_type: Option<String>,
}

impl Edge {
    /// Collision key for duplicate detection.
    pub fn key(&self) -> String {
        format!(
            "{}|{}|{}|{}|{}",
            self.source,
            self.target,
            self.source_handle.as_deref().unwrap_or(""),
            self.target_handle.as_deref().unwrap_or(""),
            self.edge_type.as_deref().unwrap_or("")
        )
    }
}

/// One applied evolution, kept in `evolutionHistory`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EvolutionRecord {
    pub applied_at: DateTime<Utc>,
    /// The self-reflect node that proposed the evolution.
    pub node_id: String,
    pub reasoning: String,
    pub mutations: Vec<MutationOp>,
    pub before_digest: String,
    pub after_digest: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Workflow {
    pub id: String,
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub working_directory: Option<String>,
    pub nodes: Vec<WorkflowNode>,
    pub edges: Vec<Edge>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub evolution_history: Option<Vec<EvolutionRecord>>,
}

impl Workflow {
    pub fn node(&self, id: &str) -> Option<&WorkflowNode> {
        self.nodes.iter().find(|n| n.id == id)
    }

    pub fn node_mut(&mut self, id: &str) -> Option<&mut WorkflowNode> {
        self.nodes.iter_mut().find(|n| n.id == id)
    }

    pub fn node_by_name(&self, name: &str) -> Option<&WorkflowNode> {
        self.nodes.iter().find(|n| n.name() == name)
    }

    pub fn input_node(&self) -> Option<&WorkflowNode> {
        self.nodes.iter().find(|n| n.node_type == NodeType::Input)
    }

    pub fn output_node(&self) -> Option<&WorkflowNode> {
        self.nodes.iter().find(|n| n.node_type == NodeType::Output)
    }

    /// Edges entering `id`.
    pub fn edges_to(&self, id: &str) -> Vec<&Edge> {
        self.edges.iter().filter(|e| e.target == id).collect()
    }

    /// Edges leaving `id`.
    pub fn edges_from(&self, id: &str) -> Vec<&Edge> {
        self.edges.iter().filter(|e| e.source == id).collect()
    }

    /// Direct predecessor node ids.
    pub fn predecessors(&self, id: &str) -> Vec<&str> {
        let mut seen = HashSet::new();
        self.edges
            .iter()
            .filter(|e| e.target == id)
            .filter(|e| seen.insert(e.source.as_str()))
            .map(|e| e.source.as_str())
            .collect()
    }

    /// Direct successor node ids.
    pub fn successors(&self, id: &str) -> Vec<&str> {
        let mut seen = HashSet::new();
        self.edges
            .iter()
            .filter(|e| e.source == id)
            .filter(|e| seen.insert(e.target.as_str()))
            .map(|e| e.target.as_str())
            .collect()
    }

    /// Transitive ancestors of `id` (not including `id` itself).
    pub fn ancestors(&self, id: &str) -> HashSet<String> {
        let mut out = HashSet::new();
        let mut stack: Vec<&str> = self.predecessors(id);
        while let Some(cur) = stack.pop() {
            if out.insert(cur.to_string()) {
                stack.extend(self.predecessors(cur));
            }
        }
        out
    }

    /// Reflexive descendants of `id` (including `id`).
    pub fn descendants(&self, id: &str) -> HashSet<String> {
        let mut out = HashSet::new();
        let mut stack = vec![id];
        while let Some(cur) = stack.pop() {
            if out.insert(cur.to_string()) {
                stack.extend(self.successors(cur));
            }
        }
        out
    }

    /// Display-name -> node-id map.
    pub fn name_index(&self) -> HashMap<String, String> {
        self.nodes
            .iter()
            .map(|n| (n.name().to_string(), n.id.clone()))
            .collect()
    }

    /// Content digest of the definition, recorded around evolutions.
    pub fn snapshot_digest(&self) -> String {
        let body = serde_json::json!({
            "name": self.name,
            "workingDirectory": self.working_directory,
            "nodes": self.nodes,
            "edges": self.edges,
        });
        let mut hasher = Sha256::new();
        hasher.update(body.to_string().as_bytes());
        format!("{:x}", hasher.finalize())
    }
}

/// Output recorded for one node of one execution.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeOutput {
    pub name: String,
    #[serde(default)]
    pub events: Vec<AgentEvent>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    /// Number of times the node has run; >1 only inside loops.
    #[serde(default)]
    pub run_count: u32,
}

impl NodeOutput {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            events: Vec::new(),
            result: None,
            error: None,
            started_at: None,
            completed_at: None,
            run_count: 0,
        }
    }
}
