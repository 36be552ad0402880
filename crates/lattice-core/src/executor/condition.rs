use async_trait::async_trait;
use regex::Regex;
use serde_json::{json, Value};

use super::{public_result, ExecutorContext, ExecutorOutcome, NodeExecutor};
use crate::error::{ErrorCode, ExecutionError};
use crate::reference::interpolate;
use crate::workflow::{
    handles, ConditionOperator, ConditionRule, NodeConfig, RuleCombinator, WorkflowNode,
};

/// Evaluates rule sets and routes execution down the matching handle.
///
/// Coercion: ordering and equality operators compare numerically when both
/// sides parse cleanly as f64 after trimming, and fall back to string
/// comparison otherwise. `contains` and `regex` always work on the string
/// rendering.
pub struct ConditionExecutor;

fn as_number(s: &str) -> Option<f64> {
    let trimmed = s.trim();
    if trimmed.is_empty() {
        return None;
    }
    trimmed.parse::<f64>().ok().filter(|n| n.is_finite())
}

fn compare_ordering(left: &str, right: &str) -> std::cmp::Ordering {
    match (as_number(left), as_number(right)) {
        (Some(l), Some(r)) => l.partial_cmp(&r).unwrap_or(std::cmp::Ordering::Equal),
        _ => left.cmp(right),
    }
}

fn values_equal(left: &str, right: &str) -> bool {
    match (as_number(left), as_number(right)) {
        (Some(l), Some(r)) => l == r,
        _ => left == right,
    }
}

/// Evaluate one rule against its resolved input text.
pub fn evaluate_rule(rule: &ConditionRule, resolved_input: &str) -> Result<bool, String> {
    let compare = rule.compare_value.as_str();
    let matched = match rule.operator {
        ConditionOperator::Equals => values_equal(resolved_input, compare),
        ConditionOperator::NotEquals => !values_equal(resolved_input, compare),
        ConditionOperator::Contains => resolved_input.contains(compare),
        ConditionOperator::NotContains => !resolved_input.contains(compare),
        ConditionOperator::GreaterThan => {
            compare_ordering(resolved_input, compare) == std::cmp::Ordering::Greater
        }
        ConditionOperator::LessThan => {
            compare_ordering(resolved_input, compare) == std::cmp::Ordering::Less
        }
        ConditionOperator::GreaterThanOrEquals => {
            compare_ordering(resolved_input, compare) != std::cmp::Ordering::Less
        }
        ConditionOperator::LessThanOrEquals => {
            compare_ordering(resolved_input, compare) != std::cmp::Ordering::Greater
        }
        ConditionOperator::IsEmpty => resolved_input.trim().is_empty(),
        ConditionOperator::IsNotEmpty => !resolved_input.trim().is_empty(),
        ConditionOperator::Regex => {
            let re = Regex::new(compare).map_err(|e| format!("invalid pattern: {e}"))?;
            re.is_match(resolved_input)
        }
    };
    Ok(matched)
}

#[async_trait]
impl NodeExecutor for ConditionExecutor {
    fn validate(&self, node: &WorkflowNode) -> Option<String> {
        match &node.data {
            NodeConfig::Condition(config) if config.rules.is_empty() => {
                Some("condition node has no rules".to_string())
            }
            NodeConfig::Condition(_) => None,
            _ => Some("node data is not a condition config".to_string()),
        }
    }

    async fn execute(&self, node: &WorkflowNode, ctx: &ExecutorContext) -> ExecutorOutcome {
        let NodeConfig::Condition(config) = &node.data else {
            return ExecutorOutcome::err(
                ExecutionError::new(
                    ErrorCode::InvalidConditionType,
                    "node data is not a condition config",
                )
                .with_node(&ctx.node_id),
            );
        };

        let mut matched = config.combinator == RuleCombinator::And;
        for rule in &config.rules {
            let resolved = interpolate(&rule.input_reference, &ctx.upstream);
            let rule_matched = match evaluate_rule(rule, &resolved) {
                Ok(m) => m,
                Err(e) => {
                    return ExecutorOutcome::err(
                        ExecutionError::new(ErrorCode::ConditionEvaluationFailed, e)
                            .recoverable(true)
                            .with_node(&ctx.node_id),
                    );
                }
            };
            match config.combinator {
                RuleCombinator::And => matched = matched && rule_matched,
                RuleCombinator::Or => matched = matched || rule_matched,
            }
        }

        // Pass through the single upstream's value where there is one.
        let value: Value = if ctx.upstream.len() == 1 {
            let (_, output) = ctx.upstream.iter().next().expect("one upstream");
            public_result(output)
        } else {
            ctx.upstream.clone().into_iter().collect::<serde_json::Map<_, _>>().into()
        };

        let handle = if matched { handles::TRUE } else { handles::FALSE };
        ExecutorOutcome::ok_with_handle(
            json!({ "matched": matched, "value": value }),
            handle,
        )
    }
}
