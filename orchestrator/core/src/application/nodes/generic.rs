// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

use async_trait::async_trait;
use tracing::debug;

use crate::application::context::ExecutionContext;
use crate::application::nodes::NodeExecutor;
use crate::domain::error::EngineError;
use crate::domain::state::NodeResult;
use crate::domain::workflow::Node;

/// Executor for `Generic` nodes: delegates to the handler registered for the
/// node's `executor_type`, passing the node's config dictionary. A missing
/// handler is fatal for the execution.
pub struct GenericNodeExecutor;

#[async_trait]
impl NodeExecutor for GenericNodeExecutor {
    async fn execute(
        &self,
        node_id: &str,
        node: &Node,
        ctx: &mut ExecutionContext,
    ) -> Result<NodeResult, EngineError> {
        let Node::Generic {
            executor_type,
            config,
            ..
        } = node
        else {
            return Err(EngineError::IllegalState(format!(
                "generic executor dispatched for non-generic node '{node_id}'"
            )));
        };

        let handler = ctx
            .services
            .generic_handlers
            .get(executor_type)
            .map(|e| e.value().clone())
            .ok_or_else(|| EngineError::NodeExecutorNotFound(executor_type.clone()))?;

        debug!(node_id = %node_id, executor_type = %executor_type, "delegating to generic handler");
        handler.execute(node_id, config, &ctx.state.context).await
    }
}
