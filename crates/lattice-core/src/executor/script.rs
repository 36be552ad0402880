use async_trait::async_trait;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::time::Duration;

use super::{ExecutorContext, ExecutorOutcome, NodeExecutor};
use crate::error::{ErrorCode, ExecutionError};
use crate::reference::{find_references, interpolate, resolve};
use crate::workflow::{InputMapping, NodeConfig, WorkflowNode};

/// Resolve one input mapping. A mapping whose reference is exactly one
/// token keeps the referenced value's type; anything else interpolates to a
/// string.
fn resolve_mapping(mapping: &InputMapping, upstream: &HashMap<String, Value>) -> Value {
    let refs = find_references(&mapping.reference);
    if let [only] = refs.as_slice() {
        if only.raw == mapping.reference.trim() {
            if let Some(value) = resolve(only, upstream) {
                return value.clone();
            }
        }
    }
    Value::String(interpolate(&mapping.reference, upstream))
}

fn script_timeout(ctx: &ExecutorContext, configured: Option<u64>) -> Duration {
    Duration::from_millis(configured.unwrap_or(ctx.config.sandbox.default_script_timeout_ms))
}

fn value_as_env_string(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Runs user javascript in the external sandbox with mapped inputs bound as
/// globals.
pub struct JavascriptExecutor;

#[async_trait]
impl NodeExecutor for JavascriptExecutor {
    fn validate(&self, node: &WorkflowNode) -> Option<String> {
        match &node.data {
            NodeConfig::Javascript(config) if config.code.trim().is_empty() => {
                Some("javascript node has no code".to_string())
            }
            _ => None,
        }
    }

    async fn execute(&self, node: &WorkflowNode, ctx: &ExecutorContext) -> ExecutorOutcome {
        let NodeConfig::Javascript(config) = &node.data else {
            return ExecutorOutcome::err(
                ExecutionError::new(ErrorCode::ExecutionFailed, "node data is not javascript")
                    .with_node(&ctx.node_id),
            );
        };

        let inputs: HashMap<String, Value> = config
            .input_mappings
            .iter()
            .map(|m| (m.variable.clone(), resolve_mapping(m, &ctx.upstream)))
            .collect();

        let timeout = script_timeout(ctx, config.timeout_ms);
        match ctx.sandboxes.js.run(&config.code, &inputs, timeout).await {
            Ok(result) => ExecutorOutcome::ok(json!({
                "result": result,
                "value": result,
            })),
            Err(e) => ExecutorOutcome::err(
                ExecutionError::new(ErrorCode::ExecutionFailed, e.to_string())
                    .with_node(&ctx.node_id),
            ),
        }
    }
}

/// Runs user bash in the external sandbox with mapped inputs exported as
/// environment variables.
pub struct BashExecutor;

#[async_trait]
impl NodeExecutor for BashExecutor {
    fn validate(&self, node: &WorkflowNode) -> Option<String> {
        match &node.data {
            NodeConfig::Bash(config) if config.code.trim().is_empty() => {
                Some("bash node has no script".to_string())
            }
            _ => None,
        }
    }

    async fn execute(&self, node: &WorkflowNode, ctx: &ExecutorContext) -> ExecutorOutcome {
        let NodeConfig::Bash(config) = &node.data else {
            return ExecutorOutcome::err(
                ExecutionError::new(ErrorCode::ExecutionFailed, "node data is not bash")
                    .with_node(&ctx.node_id),
            );
        };

        let env: Vec<(String, String)> = config
            .input_mappings
            .iter()
            .map(|m| {
                (
                    m.variable.clone(),
                    value_as_env_string(&resolve_mapping(m, &ctx.upstream)),
                )
            })
            .collect();

        let timeout = script_timeout(ctx, config.timeout_ms);
        let shell = ctx
            .sandboxes
            .bash
            .run(
                &config.code,
                &env,
                ctx.working_directory.as_deref(),
                timeout,
            )
            .await;

        match shell {
            Ok(result) if result.exit_code == 0 => ExecutorOutcome::ok(json!({
                "stdout": result.stdout,
                "stderr": result.stderr,
                "exitCode": result.exit_code,
                "value": result.stdout.trim_end(),
            })),
            Ok(result) => ExecutorOutcome::err(
                ExecutionError::new(
                    ErrorCode::ExecutionFailed,
                    format!(
                        "script exited with code {}: {}",
                        result.exit_code,
                        result.stderr.trim()
                    ),
                )
                .with_node(&ctx.node_id)
                .with_details(json!({
                    "stdout": result.stdout,
                    "stderr": result.stderr,
                    "exitCode": result.exit_code,
                })),
            ),
            Err(e) => ExecutorOutcome::err(
                ExecutionError::new(
                    if e.to_string().contains("timed out") {
                        ErrorCode::Timeout
                    } else {
                        ErrorCode::ExecutionFailed
                    },
                    e.to_string(),
                )
                .with_node(&ctx.node_id),
            ),
        }
    }
}
