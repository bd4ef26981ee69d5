// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

use async_trait::async_trait;
use tracing::info;

use crate::application::context::ExecutionContext;
use crate::application::nodes::NodeExecutor;
use crate::domain::error::EngineError;
use crate::domain::state::NodeResult;
use crate::domain::workflow::Node;

/// Terminal node executor. `End` bypasses the processor pipeline, so the
/// observer callbacks and the history append happen here before the traversal
/// loop returns `Completed`.
pub struct EndNodeExecutor;

#[async_trait]
impl NodeExecutor for EndNodeExecutor {
    async fn execute(
        &self,
        node_id: &str,
        node: &Node,
        ctx: &mut ExecutionContext,
    ) -> Result<NodeResult, EngineError> {
        let Node::End { exit_status } = node else {
            return Err(EngineError::IllegalState(format!(
                "end executor dispatched for '{node_id}' which is not an End node"
            )));
        };

        let execution_id = ctx.state.execution_id;
        ctx.listener.on_node_start(execution_id, node_id, node.kind());

        info!(
            execution_id = %execution_id,
            node_id = %node_id,
            exit_status = ?exit_status,
            "reached end node"
        );

        let result = NodeResult::end();
        ctx.listener.on_node_complete(execution_id, node_id, &result);
        ctx.state.record_step(node_id, result.clone());

        Ok(result)
    }
}
