// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

use async_trait::async_trait;
use serde_json::{json, Map, Value};
use std::time::Duration;
use tracing::{debug, warn};

use crate::application::context::{ExecutionContext, ForkResult};
use crate::application::nodes::NodeExecutor;
use crate::domain::error::EngineError;
use crate::domain::state::NodeResult;
use crate::domain::workflow::{MergeStrategy, Node};

const DEFAULT_OUTPUT_FIELD: &str = "fork_results";

/// Executor for `Join` nodes: awaits the fork children listed in
/// `await_targets` (with an optional per-future timeout), then merges the
/// successful outputs by the configured strategy. Merge order follows the
/// `await_targets` declaration, not completion order.
pub struct JoinNodeExecutor;

#[async_trait]
impl NodeExecutor for JoinNodeExecutor {
    async fn execute(
        &self,
        node_id: &str,
        node: &Node,
        ctx: &mut ExecutionContext,
    ) -> Result<NodeResult, EngineError> {
        let Node::Join {
            await_targets,
            merge_strategy,
            output_field,
            timeout_ms,
            fail_on_any_error,
            ..
        } = node
        else {
            return Err(EngineError::IllegalState(format!(
                "join executor dispatched for non-join node '{node_id}'"
            )));
        };

        // Pull the matching handles out of every stashed fork context.
        let mut pending = Vec::new();
        for fork in ctx.fork_contexts.values_mut() {
            let mut remaining = Vec::new();
            for (target, handle) in fork.handles.drain(..) {
                if await_targets.contains(&target) {
                    pending.push((target, handle));
                } else {
                    remaining.push((target, handle));
                }
            }
            fork.handles = remaining;
        }

        let mut results: Vec<ForkResult> = Vec::with_capacity(await_targets.len());
        for target in await_targets {
            let Some(position) = pending.iter().position(|(t, _)| t == target) else {
                results.push(ForkResult::failure(
                    target.clone(),
                    "no fork context holds this target",
                    0,
                ));
                continue;
            };
            let (_, handle) = pending.remove(position);

            let outcome = if *timeout_ms > 0 {
                match tokio::time::timeout(Duration::from_millis(*timeout_ms), handle).await {
                    Ok(joined) => joined,
                    Err(_) => {
                        warn!(join = %node_id, target = %target, timeout_ms, "fork child timed out");
                        results.push(ForkResult::failure(
                            target.clone(),
                            format!("timeout after {timeout_ms}ms"),
                            *timeout_ms,
                        ));
                        continue;
                    }
                }
            } else {
                handle.await
            };

            match outcome {
                Ok(result) => results.push(result),
                Err(e) => results.push(ForkResult::failure(
                    target.clone(),
                    format!("fork child panicked: {e}"),
                    0,
                )),
            }
        }

        let errors: Vec<Value> = results
            .iter()
            .filter(|r| !r.is_success())
            .map(|r| {
                json!({
                    "target": r.target,
                    "error": r.error.clone().unwrap_or_default(),
                })
            })
            .collect();

        if *fail_on_any_error && !errors.is_empty() {
            debug!(join = %node_id, failed = errors.len(), "join failing on child errors");
            return Ok(NodeResult::failure("one or more fork children failed")
                .with_metadata("fork_errors", Value::Array(errors)));
        }

        let successes: Vec<&ForkResult> = results.iter().filter(|r| r.is_success()).collect();
        let merged = merge_results(&successes, *merge_strategy);

        let output_field = output_field.as_deref().unwrap_or(DEFAULT_OUTPUT_FIELD);
        ctx.state.set(output_field, merged.clone());

        let mut result = NodeResult::success(value_to_output(&merged));
        if !errors.is_empty() {
            result
                .metadata
                .insert("fork_errors".into(), Value::Array(errors));
        }
        result
            .metadata
            .insert("merged_targets".into(), json!(successes.len()));
        Ok(result)
    }
}

fn merge_results(successes: &[&ForkResult], strategy: MergeStrategy) -> Value {
    match strategy {
        // CUSTOM behaves as COLLECT_ALL; a downstream generic node may
        // post-process the collected map.
        MergeStrategy::CollectAll | MergeStrategy::Custom => {
            let mut map = Map::new();
            for result in successes {
                map.insert(
                    result.target.clone(),
                    result.output.clone().unwrap_or(Value::Null),
                );
            }
            Value::Object(map)
        }
        MergeStrategy::FirstCompleted => successes
            .first()
            .and_then(|r| r.output.clone())
            .unwrap_or(Value::Null),
        MergeStrategy::Concatenate => {
            let joined = successes
                .iter()
                .filter_map(|r| r.output.as_ref())
                .map(value_to_output)
                .collect::<Vec<_>>()
                .join("\n\n---\n\n");
            Value::String(joined)
        }
        MergeStrategy::MergeMaps => {
            let mut map = Map::new();
            for result in successes {
                if let Some(object) = result.output.as_ref().and_then(as_object) {
                    // Later targets win on key collisions.
                    for (key, value) in object {
                        map.insert(key, value);
                    }
                }
            }
            Value::Object(map)
        }
    }
}

/// Outputs arrive as raw values or as JSON-encoded strings; accept both.
fn as_object(value: &Value) -> Option<Map<String, Value>> {
    match value {
        Value::Object(map) => Some(map.clone()),
        Value::String(s) => serde_json::from_str::<Value>(s)
            .ok()
            .and_then(|v| v.as_object().cloned()),
        _ => None,
    }
}

fn value_to_output(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}
