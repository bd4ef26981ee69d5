// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

use async_trait::async_trait;
use serde_json::{json, Value};
use tracing::debug;

use crate::application::context::ExecutionContext;
use crate::application::nodes::NodeExecutor;
use crate::domain::error::EngineError;
use crate::domain::handlers::ActionResult;
use crate::domain::state::NodeResult;
use crate::domain::workflow::{ActionSpec, Node};

/// Executor for `Action` nodes. `Send` payloads are template-resolved before
/// dispatch; `Execute` commands resolve through the wiring-time command
/// registry. The node fails on the first failing action.
pub struct ActionNodeExecutor;

#[async_trait]
impl NodeExecutor for ActionNodeExecutor {
    async fn execute(
        &self,
        node_id: &str,
        node: &Node,
        ctx: &mut ExecutionContext,
    ) -> Result<NodeResult, EngineError> {
        let Node::Action { actions, .. } = node else {
            return Err(EngineError::IllegalState(format!(
                "action executor dispatched for non-action node '{node_id}'"
            )));
        };

        let mut results: Vec<Value> = Vec::with_capacity(actions.len());

        for action in actions {
            let outcome = match action {
                ActionSpec::Send { handler_id, payload } => {
                    let handler =
                        ctx.services.action_handlers.get(handler_id).ok_or_else(|| {
                            EngineError::ActionHandlerNotFound(handler_id.clone())
                        })?;
                    let payload = resolve_payload(ctx, payload);
                    debug!(node_id = %node_id, handler = %handler_id, "dispatching send action");
                    handler.execute(&payload, &ctx.state.context).await?
                }
                ActionSpec::Execute { command_id } => {
                    let command = ctx.services.commands.get(command_id).ok_or_else(|| {
                        EngineError::CommandNotFound(command_id.clone())
                    })?;
                    debug!(node_id = %node_id, command = %command_id, "dispatching command action");
                    command.execute(&Value::Null, &ctx.state.context).await?
                }
            };

            let failed = !outcome.success;
            results.push(action_result_json(&outcome));

            if failed {
                return Ok(NodeResult::failure(
                    outcome
                        .error
                        .unwrap_or_else(|| "action failed".to_string()),
                )
                .with_metadata("action_results", Value::Array(results)));
            }
        }

        Ok(
            NodeResult::success(serde_json::to_string(&results).unwrap_or_default())
                .with_metadata("action_results", Value::Array(results)),
        )
    }
}

fn action_result_json(result: &ActionResult) -> Value {
    json!({
        "success": result.success,
        "message": result.message,
        "data": result.data,
        "error": result.error,
    })
}

/// Template-resolve every string inside the payload, recursively.
fn resolve_payload(ctx: &ExecutionContext, payload: &Value) -> Value {
    match payload {
        Value::String(s) => Value::String(ctx.services.templates.resolve(s, &ctx.state.context)),
        Value::Array(items) => {
            Value::Array(items.iter().map(|v| resolve_payload(ctx, v)).collect())
        }
        Value::Object(map) => Value::Object(
            map.iter()
                .map(|(k, v)| (k.clone(), resolve_payload(ctx, v)))
                .collect(),
        ),
        other => other.clone(),
    }
}
