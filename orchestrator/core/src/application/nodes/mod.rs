// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! Node executors.
//!
//! One executor per node kind, dispatched through [`NodeExecutorRegistry`].
//! Recoverable executor errors are folded into `NodeResult::failure` so they
//! flow through the node's `Failure` transition rules; only fatal errors
//! (missing generic handler, illegal engine state) abort the execution.

mod action;
mod end;
mod fork;
mod generic;
mod join;
mod loop_node;
mod parallel;
mod standard;
mod sub_workflow;

pub use action::ActionNodeExecutor;
pub use end::EndNodeExecutor;
pub use fork::ForkNodeExecutor;
pub use generic::GenericNodeExecutor;
pub use join::JoinNodeExecutor;
pub use loop_node::LoopNodeExecutor;
pub use parallel::ParallelNodeExecutor;
pub use standard::StandardNodeExecutor;
pub use sub_workflow::SubWorkflowNodeExecutor;

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::warn;

use crate::application::context::ExecutionContext;
use crate::domain::error::EngineError;
use crate::domain::state::NodeResult;
use crate::domain::workflow::Node;

#[async_trait]
pub trait NodeExecutor: Send + Sync {
    async fn execute(
        &self,
        node_id: &str,
        node: &Node,
        ctx: &mut ExecutionContext,
    ) -> Result<NodeResult, EngineError>;
}

/// Type registry mapping node kinds to their executors.
pub struct NodeExecutorRegistry {
    executors: HashMap<&'static str, Arc<dyn NodeExecutor>>,
}

impl NodeExecutorRegistry {
    /// Registry with the standard executor set for all nine node kinds.
    pub fn with_defaults() -> Self {
        let mut executors: HashMap<&'static str, Arc<dyn NodeExecutor>> = HashMap::new();
        executors.insert("end", Arc::new(EndNodeExecutor));
        executors.insert("standard", Arc::new(StandardNodeExecutor));
        executors.insert("parallel", Arc::new(ParallelNodeExecutor));
        executors.insert("fork", Arc::new(ForkNodeExecutor));
        executors.insert("join", Arc::new(JoinNodeExecutor));
        executors.insert("loop", Arc::new(LoopNodeExecutor));
        executors.insert("sub_workflow", Arc::new(SubWorkflowNodeExecutor));
        executors.insert("action", Arc::new(ActionNodeExecutor));
        executors.insert("generic", Arc::new(GenericNodeExecutor));
        Self { executors }
    }

    /// Dispatch a node to its executor. Recoverable errors become `FAILURE`
    /// results; fatal errors propagate and end the execution.
    pub async fn dispatch(
        &self,
        node_id: &str,
        node: &Node,
        ctx: &mut ExecutionContext,
    ) -> Result<NodeResult, EngineError> {
        let executor = self
            .executors
            .get(node.kind())
            .ok_or_else(|| EngineError::NodeExecutorNotFound(node.kind().to_string()))?;

        match executor.execute(node_id, node, ctx).await {
            Ok(result) => Ok(result),
            Err(e) if is_fatal(&e) => Err(e),
            Err(e) => {
                warn!(node_id = %node_id, error = %e, "node executor error; surfacing as FAILURE");
                Ok(NodeResult::failure(e.to_string()))
            }
        }
    }
}

fn is_fatal(error: &EngineError) -> bool {
    matches!(
        error,
        EngineError::NodeExecutorNotFound(_)
            | EngineError::NodeMissing(_)
            | EngineError::NoValidTransition(_)
            | EngineError::LeaseLost(_)
    )
}
