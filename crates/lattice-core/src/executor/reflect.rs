use async_trait::async_trait;
use serde_json::{json, Value};

use super::{ExecutorContext, ExecutorEmit, ExecutorOutcome, NodeExecutor};
use crate::agent::{AgentInput, Dialect, OutputConfig};
use crate::error::{ErrorCode, ExecutionError};
use crate::event::AgentEvent;
use crate::evolution::{
    evolution_output_schema, validate_evolution, Evolution, ValidateOptions,
};
use crate::workflow::{AgentFlavor, NodeConfig, ReflectMode, SelfReflectConfig, WorkflowNode};

/// Asks a reflection agent to propose a workflow evolution, validates it,
/// and applies it subject to mode and approval.
pub struct SelfReflectExecutor;

fn reflection_prompt(config: &SelfReflectConfig, ctx: &ExecutorContext) -> String {
    let workflow_json =
        serde_json::to_string_pretty(ctx.workflow.as_ref()).unwrap_or_else(|_| "{}".to_string());
    let outputs_json =
        serde_json::to_string_pretty(&ctx.upstream).unwrap_or_else(|_| "{}".to_string());

    let mut prompt = format!(
        "You are improving a workflow while it runs.\n\n\
         Current workflow definition:\n{workflow_json}\n\n\
         Outputs of the nodes that ran before this one:\n{outputs_json}\n\n\
         Goal: {}\n",
        config.reflection_goal
    );

    if config.include_transcripts && !ctx.upstream_events.is_empty() {
        let transcripts = serde_json::to_string_pretty(&ctx.upstream_events)
            .unwrap_or_else(|_| "{}".to_string());
        prompt.push_str(&format!("\nNode transcripts:\n{transcripts}\n"));
    }

    let scopes: Vec<String> = config
        .scope
        .iter()
        .filter_map(|s| serde_json::to_string(s).ok())
        .map(|s| s.trim_matches('"').to_string())
        .collect();
    if !scopes.is_empty() {
        prompt.push_str(&format!("\nAllowed change scopes: {}.\n", scopes.join(", ")));
    }
    if let Some(max) = config.max_mutations {
        prompt.push_str(&format!("Propose at most {max} mutations.\n"));
    }
    prompt.push_str(
        "\nRespond with a JSON evolution: reasoning, expectedImpact, riskAssessment, \
         optional rollbackPlan, and a mutations array.",
    );
    prompt
}

async fn emit_evolution(
    ctx: &ExecutorContext,
    evolution: &Evolution,
    applied: bool,
    approval_requested: bool,
    validation_errors: Vec<String>,
) {
    let _ = ctx
        .emit
        .send(ExecutorEmit::Evolution {
            evolution: evolution.clone(),
            applied,
            approval_requested,
            validation_errors,
        })
        .await;
}

fn reflect_result(evolution: &Evolution, applied: bool) -> Value {
    json!({
        "evolution": evolution,
        "applied": applied,
        "value": applied,
    })
}

impl SelfReflectExecutor {
    async fn apply(
        &self,
        ctx: &ExecutorContext,
        evolution: &Evolution,
    ) -> Result<(), ExecutionError> {
        let Some(applier) = &ctx.applier else {
            return Err(ExecutionError::new(
                ErrorCode::EvolutionApplyFailed,
                "no evolution applier configured",
            )
            .with_node(&ctx.node_id));
        };

        let next = applier
            .apply(ctx.workflow.as_ref(), evolution, &ctx.node_id)
            .await?;
        let _ = ctx.emit.send(ExecutorEmit::WorkflowUpdated(next)).await;
        Ok(())
    }
}

#[async_trait]
impl NodeExecutor for SelfReflectExecutor {
    fn validate(&self, node: &WorkflowNode) -> Option<String> {
        match &node.data {
            NodeConfig::SelfReflect(config) if config.reflection_goal.trim().is_empty() => {
                Some("self-reflect node has no reflection goal".to_string())
            }
            _ => None,
        }
    }

    async fn execute(&self, node: &WorkflowNode, ctx: &ExecutorContext) -> ExecutorOutcome {
        let NodeConfig::SelfReflect(config) = &node.data else {
            return ExecutorOutcome::err(
                ExecutionError::new(
                    ErrorCode::ExecutionFailed,
                    "node data is not a self-reflect config",
                )
                .with_node(&ctx.node_id),
            );
        };

        let dialect = match config.agent {
            AgentFlavor::Claude => Dialect::Claude,
            AgentFlavor::Codex => Dialect::Codex,
        };
        let adapter = ctx.agents.adapter_for(&ctx.node_id, dialect);

        let input = AgentInput {
            prompt: reflection_prompt(config, ctx),
            session_id: None,
            working_directory: ctx.working_directory.clone(),
            output_config: Some(OutputConfig {
                schema: evolution_output_schema().to_string(),
                file_path: None,
            }),
            model: config.model.clone(),
            system_prompt: None,
            mcp_servers: vec![],
        };

        let mut stream = match adapter.execute(input).await {
            Ok(stream) => stream,
            Err(e) => {
                return ExecutorOutcome::err(
                    ExecutionError::new(ErrorCode::AgentError, e.to_string())
                        .with_node(&ctx.node_id),
                );
            }
        };

        let mut final_result: Option<Value> = None;
        while let Some(event) = stream.recv().await {
            match event {
                AgentEvent::Complete { result } => {
                    final_result = Some(result);
                    break;
                }
                AgentEvent::Error { message } => {
                    let code = if message == "Execution interrupted" {
                        ErrorCode::AgentInterrupted
                    } else {
                        ErrorCode::AgentError
                    };
                    return ExecutorOutcome::err(
                        ExecutionError::new(code, message).with_node(&ctx.node_id),
                    );
                }
                other => ctx.emit_agent(other).await,
            }
        }

        // Structured output first, agent's final text second.
        let candidate = match adapter.structured_output().await.and_then(|s| s.parsed) {
            Some(parsed) => parsed,
            None => {
                let fallback = final_result
                    .as_ref()
                    .and_then(Value::as_str)
                    .and_then(|text| serde_json::from_str::<Value>(text).ok());
                match fallback {
                    Some(parsed) => parsed,
                    None => {
                        return ExecutorOutcome::err(
                            ExecutionError::new(
                                ErrorCode::AgentError,
                                "Unable to parse workflow evolution from agent output",
                            )
                            .with_node(&ctx.node_id),
                        );
                    }
                }
            }
        };

        let report = validate_evolution(
            ctx.workflow.as_ref(),
            &candidate,
            &ValidateOptions {
                max_mutations: config.max_mutations,
                scope: if config.scope.is_empty() {
                    None
                } else {
                    Some(config.scope.clone())
                },
                self_node_id: Some(ctx.node_id.clone()),
            },
        );
        let evolution = report.sanitized;

        if !report.valid {
            emit_evolution(ctx, &evolution, false, false, report.errors).await;
            return ExecutorOutcome::ok(reflect_result(&evolution, false));
        }

        match config.mode {
            ReflectMode::DryRun => {
                emit_evolution(ctx, &evolution, false, false, vec![]).await;
                ExecutorOutcome::ok(reflect_result(&evolution, false))
            }
            ReflectMode::AutoApply => match self.apply(ctx, &evolution).await {
                Ok(()) => {
                    emit_evolution(ctx, &evolution, true, false, vec![]).await;
                    ExecutorOutcome::ok(reflect_result(&evolution, true))
                }
                Err(error) => ExecutorOutcome::err(error),
            },
            ReflectMode::Suggest => {
                emit_evolution(ctx, &evolution, false, true, vec![]).await;
                match ctx
                    .approvals
                    .wait(&ctx.execution_id, &ctx.node_id, None)
                    .await
                {
                    Ok(outcome) if outcome.approved => match self.apply(ctx, &evolution).await {
                        Ok(()) => {
                            emit_evolution(ctx, &evolution, true, false, vec![]).await;
                            ExecutorOutcome::ok(reflect_result(&evolution, true))
                        }
                        Err(error) => ExecutorOutcome::err(error),
                    },
                    Ok(_) => ExecutorOutcome::ok(reflect_result(&evolution, false)),
                    Err(error) => ExecutorOutcome::err(error),
                }
            }
        }
    }
}
