// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

use async_trait::async_trait;
use serde_json::json;
use tracing::{debug, info};

use crate::application::context::ExecutionContext;
use crate::application::nodes::NodeExecutor;
use crate::domain::error::EngineError;
use crate::domain::state::{keys, NodeResult};
use crate::domain::workflow::Node;

/// Executor for `Loop` nodes. Each visit increments the bounded iteration
/// counter kept in context, then evaluates the break conditions. On break (or
/// on hitting `max_iterations`) the configured exit from the
/// `loop_exit_target` context key is handed to transition evaluation through
/// `state.loop_break_target`; otherwise the node's own transition rules send
/// control back into the loop body.
pub struct LoopNodeExecutor;

#[async_trait]
impl NodeExecutor for LoopNodeExecutor {
    async fn execute(
        &self,
        node_id: &str,
        node: &Node,
        ctx: &mut ExecutionContext,
    ) -> Result<NodeResult, EngineError> {
        let Node::Loop {
            break_conditions,
            max_iterations,
            ..
        } = node
        else {
            return Err(EngineError::IllegalState(format!(
                "loop executor dispatched for non-loop node '{node_id}'"
            )));
        };

        let counter_key = keys::loop_iterations(node_id);
        let iteration = ctx
            .state
            .get(&counter_key)
            .and_then(serde_json::Value::as_u64)
            .unwrap_or(0)
            + 1;
        ctx.state.set(counter_key, json!(iteration));

        let break_reason = if let Some(condition) = break_conditions
            .iter()
            .find(|c| c.matches(&ctx.state.context))
        {
            Some(format!("break condition met: {condition:?}"))
        } else if iteration >= u64::from(*max_iterations) {
            Some("MAX_ITERATIONS".to_string())
        } else {
            None
        };

        let Some(reason) = break_reason else {
            debug!(node_id = %node_id, iteration, "loop continues");
            return Ok(NodeResult::success_empty()
                .with_metadata("loop_iteration", json!(iteration)));
        };

        let Some(exit_target) = ctx.state.get_str(keys::LOOP_EXIT_TARGET).map(String::from)
        else {
            return Ok(NodeResult::failure(format!(
                "loop '{node_id}' broke ({reason}) but '{}' is not set",
                keys::LOOP_EXIT_TARGET
            )));
        };

        info!(node_id = %node_id, iteration, exit = %exit_target, reason = %reason, "loop break");
        ctx.state.loop_break_target = Some(exit_target);

        Ok(NodeResult::success_empty()
            .with_metadata("loop_iteration", json!(iteration))
            .with_metadata("loop_break_reason", json!(reason)))
    }
}
