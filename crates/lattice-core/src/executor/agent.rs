use async_trait::async_trait;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use super::{ExecutorContext, ExecutorOutcome, NodeExecutor};
use crate::agent::{
    AgentAdapter, AgentInput, AgentService, CliAgentService, Dialect, OutputConfig,
};
use crate::config::AgentsConfig;
use crate::error::{ErrorCode, ExecutionError};
use crate::event::AgentEvent;
use crate::reference::interpolate;
use crate::workflow::{AgentNodeConfig, NodeConfig, NodeType, WorkflowNode};

// ---------------------------------------------------------------------------
// Adapter pooling
// ---------------------------------------------------------------------------

/// Produces the underlying service for a dialect. Lets tests swap in
/// scripted services without touching the executors.
pub trait AgentServiceFactory: Send + Sync {
    fn service(&self, dialect: Dialect) -> Arc<dyn AgentService>;
}

/// Shells out to the installed CLIs.
pub struct CliAgentFactory {
    config: AgentsConfig,
}

impl CliAgentFactory {
    pub fn new(config: AgentsConfig) -> Self {
        Self { config }
    }
}

impl AgentServiceFactory for CliAgentFactory {
    fn service(&self, dialect: Dialect) -> Arc<dyn AgentService> {
        let path = match dialect {
            Dialect::Claude => self.config.claude_path.clone(),
            Dialect::Codex => self.config.codex_path.clone(),
        };
        Arc::new(CliAgentService::new(dialect, path))
    }
}

/// Hands every dialect the same service instance (tests).
pub struct FixedServiceFactory {
    service: Arc<dyn AgentService>,
}

impl FixedServiceFactory {
    pub fn new(service: Arc<dyn AgentService>) -> Self {
        Self { service }
    }
}

impl AgentServiceFactory for FixedServiceFactory {
    fn service(&self, _dialect: Dialect) -> Arc<dyn AgentService> {
        Arc::clone(&self.service)
    }
}

/// Per-execution adapter cache: one adapter per agent node, so session
/// state survives loop re-entries and interrupt reaches every live stream.
pub struct AgentPool {
    factory: Arc<dyn AgentServiceFactory>,
    adapters: Mutex<HashMap<String, Arc<AgentAdapter>>>,
}

impl AgentPool {
    pub fn new(factory: Arc<dyn AgentServiceFactory>) -> Self {
        Self {
            factory,
            adapters: Mutex::new(HashMap::new()),
        }
    }

    pub fn adapter_for(&self, node_id: &str, dialect: Dialect) -> Arc<AgentAdapter> {
        let mut adapters = self.adapters.lock().unwrap();
        adapters
            .entry(node_id.to_string())
            .or_insert_with(|| Arc::new(AgentAdapter::new(dialect, self.factory.service(dialect))))
            .clone()
    }

    /// Interrupt every adapter with a live stream.
    pub async fn interrupt_all(&self) {
        let adapters: Vec<Arc<AgentAdapter>> =
            self.adapters.lock().unwrap().values().cloned().collect();
        for adapter in adapters {
            adapter.interrupt().await;
        }
    }

    /// Interrupt the one adapter bound to `node_id`, if any (timeouts).
    pub async fn interrupt_node(&self, node_id: &str) {
        let adapter = self.adapters.lock().unwrap().get(node_id).cloned();
        if let Some(adapter) = adapter {
            adapter.interrupt().await;
        }
    }
}

// ---------------------------------------------------------------------------
// Agent executor
// ---------------------------------------------------------------------------

/// Thin adapter from node config to an agent turn.
pub struct AgentExecutor;

fn dialect_for(node_type: NodeType) -> Dialect {
    match node_type {
        NodeType::CodexAgent => Dialect::Codex,
        _ => Dialect::Claude,
    }
}

fn build_input(config: &AgentNodeConfig, ctx: &ExecutorContext) -> AgentInput {
    let session_id = config
        .session_reference
        .as_deref()
        .map(|template| interpolate(template, &ctx.upstream))
        .filter(|resolved| !resolved.is_empty() && !resolved.contains("{{"));

    AgentInput {
        prompt: interpolate(&config.user_query, &ctx.upstream),
        session_id,
        working_directory: config
            .working_directory
            .clone()
            .or_else(|| ctx.working_directory.clone()),
        output_config: config.output_schema.as_ref().map(|schema| OutputConfig {
            schema: schema.clone(),
            file_path: config.output_file_path.clone(),
        }),
        model: config.model.clone().or_else(|| {
            ctx.config.agents.default_model.clone()
        }),
        system_prompt: config.system_prompt.clone(),
        mcp_servers: config.mcp_servers.clone(),
    }
}

fn error_code_for(message: &str) -> ErrorCode {
    if message == "Execution interrupted" {
        ErrorCode::AgentInterrupted
    } else {
        ErrorCode::AgentError
    }
}

#[async_trait]
impl NodeExecutor for AgentExecutor {
    fn validate(&self, node: &WorkflowNode) -> Option<String> {
        match &node.data {
            NodeConfig::ClaudeAgent(config) | NodeConfig::CodexAgent(config) => {
                if config.user_query.trim().is_empty() {
                    Some("agent node has no prompt".to_string())
                } else {
                    None
                }
            }
            _ => Some("node data is not an agent config".to_string()),
        }
    }

    async fn execute(&self, node: &WorkflowNode, ctx: &ExecutorContext) -> ExecutorOutcome {
        let (NodeConfig::ClaudeAgent(config) | NodeConfig::CodexAgent(config)) = &node.data else {
            return ExecutorOutcome::err(
                ExecutionError::new(ErrorCode::ExecutionFailed, "node data is not an agent config")
                    .with_node(&ctx.node_id),
            );
        };

        let adapter = ctx
            .agents
            .adapter_for(&ctx.node_id, dialect_for(node.node_type));
        let input = build_input(config, ctx);

        let mut stream = match adapter.execute(input).await {
            Ok(stream) => stream,
            Err(e) => {
                return ExecutorOutcome::err(
                    ExecutionError::new(ErrorCode::AgentError, e.to_string())
                        .with_node(&ctx.node_id),
                );
            }
        };

        let mut terminal: Option<AgentEvent> = None;
        while let Some(event) = stream.recv().await {
            if event.is_terminal() {
                terminal = Some(event);
                break;
            }
            ctx.emit_agent(event).await;
        }

        match terminal {
            Some(AgentEvent::Complete { result }) => {
                let session_id = adapter.session_id().await;
                let structured = adapter.structured_output().await;
                // Structured output becomes the addressable value so
                // downstream references can reach into its fields.
                let value = structured
                    .as_ref()
                    .and_then(|s| s.parsed.clone())
                    .unwrap_or_else(|| result.clone());

                ExecutorOutcome::ok(json!({
                    "result": result,
                    "value": value,
                    "sessionId": session_id,
                    "structuredOutput": structured,
                }))
            }
            Some(AgentEvent::Error { message }) => ExecutorOutcome::err(
                ExecutionError::new(error_code_for(&message), message).with_node(&ctx.node_id),
            ),
            _ => ExecutorOutcome::err(
                ExecutionError::new(ErrorCode::AgentError, "agent stream ended without a result")
                    .with_node(&ctx.node_id),
            ),
        }
    }
}
