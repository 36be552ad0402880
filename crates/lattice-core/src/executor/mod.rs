//! Node executor dispatch: one handler per node type, selected at run time.

mod agent;
mod approval;
mod condition;
mod input;
mod merge;
mod output;
mod reflect;
mod script;

pub use agent::{AgentPool, AgentServiceFactory, CliAgentFactory, FixedServiceFactory};

use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{mpsc, watch};

use crate::approval::ApprovalCoordinator;
use crate::config::LatticeConfig;
use crate::error::ExecutionError;
use crate::event::{AgentEvent, ApprovalRequest};
use crate::evolution::{Evolution, EvolutionApplier};
use crate::sandbox::SandboxSet;
use crate::workflow::{NodeType, Workflow, WorkflowNode};

/// Emissions an executor can make while running, forwarded by the scheduler
/// onto the bus under the right envelope.
#[derive(Debug, Clone)]
pub enum ExecutorEmit {
    /// Progress from the node, published as `node-output`.
    Agent(AgentEvent),
    /// The node is suspended on a human decision (`node-waiting`).
    Waiting(ApprovalRequest),
    /// A self-reflect node proposed an evolution (`node-evolution`).
    Evolution {
        evolution: Evolution,
        applied: bool,
        approval_requested: bool,
        validation_errors: Vec<String>,
    },
    /// An evolution was committed; the scheduler must re-snapshot.
    WorkflowUpdated(Workflow),
}

/// Terminal outcome of one executor run.
#[derive(Debug)]
pub struct ExecutorOutcome {
    pub result: Result<Value, ExecutionError>,
    /// Source-handle decision for condition/approval fan-out.
    pub handle: Option<String>,
}

impl ExecutorOutcome {
    pub fn ok(result: Value) -> Self {
        Self {
            result: Ok(result),
            handle: None,
        }
    }

    pub fn ok_with_handle(result: Value, handle: impl Into<String>) -> Self {
        Self {
            result: Ok(result),
            handle: Some(handle.into()),
        }
    }

    pub fn err(error: ExecutionError) -> Self {
        Self {
            result: Err(error),
            handle: None,
        }
    }
}

/// Everything an executor may touch. Upstream outputs are an immutable
/// snapshot taken when the scheduler pulls the node from the ready set.
pub struct ExecutorContext {
    pub execution_id: String,
    pub node_id: String,
    pub user_input: String,
    pub working_directory: Option<String>,
    /// Snapshot of the workflow as of this node's start.
    pub workflow: Arc<Workflow>,
    /// Upstream display name -> output object.
    pub upstream: HashMap<String, Value>,
    /// Upstream display name -> emitted events (reflect transcripts).
    pub upstream_events: HashMap<String, Vec<AgentEvent>>,
    pub emit: mpsc::Sender<ExecutorEmit>,
    /// Run-level cancellation signal; true once interrupted.
    pub cancelled: watch::Receiver<bool>,
    pub approvals: ApprovalCoordinator,
    pub agents: Arc<AgentPool>,
    pub sandboxes: Arc<SandboxSet>,
    pub applier: Option<Arc<EvolutionApplier>>,
    pub config: Arc<LatticeConfig>,
    /// How many times this node has already run (loops).
    pub run_count: u32,
}

impl ExecutorContext {
    pub fn is_cancelled(&self) -> bool {
        *self.cancelled.borrow()
    }

    pub async fn emit_agent(&self, event: AgentEvent) {
        let _ = self.emit.send(ExecutorEmit::Agent(event)).await;
    }
}

/// One per node type. `validate` runs before the node is started;
/// `execute` drives it to a terminal outcome.
#[async_trait]
pub trait NodeExecutor: Send + Sync {
    fn validate(&self, _node: &WorkflowNode) -> Option<String> {
        None
    }

    async fn execute(&self, node: &WorkflowNode, ctx: &ExecutorContext) -> ExecutorOutcome;
}

/// Dispatch table from node type to executor.
pub struct ExecutorRegistry {
    executors: HashMap<NodeType, Arc<dyn NodeExecutor>>,
}

impl ExecutorRegistry {
    /// The standard registry covering every built-in node type.
    pub fn standard() -> Self {
        let mut executors: HashMap<NodeType, Arc<dyn NodeExecutor>> = HashMap::new();
        executors.insert(NodeType::Input, Arc::new(input::InputExecutor));
        executors.insert(NodeType::Output, Arc::new(output::OutputExecutor));
        executors.insert(NodeType::ClaudeAgent, Arc::new(agent::AgentExecutor));
        executors.insert(NodeType::CodexAgent, Arc::new(agent::AgentExecutor));
        executors.insert(NodeType::Condition, Arc::new(condition::ConditionExecutor));
        executors.insert(NodeType::Merge, Arc::new(merge::MergeExecutor));
        executors.insert(NodeType::Javascript, Arc::new(script::JavascriptExecutor));
        executors.insert(NodeType::Bash, Arc::new(script::BashExecutor));
        executors.insert(NodeType::Approval, Arc::new(approval::ApprovalExecutor));
        executors.insert(NodeType::SelfReflect, Arc::new(reflect::SelfReflectExecutor));
        Self { executors }
    }

    pub fn executor_for(&self, node_type: NodeType) -> Option<Arc<dyn NodeExecutor>> {
        self.executors.get(&node_type).cloned()
    }
}

/// The node's externally visible result: its `value` field when the output
/// object declares one, otherwise the whole object.
pub fn public_result(result: &Value) -> Value {
    match result.get("value") {
        Some(value) => value.clone(),
        None => result.clone(),
    }
}
