// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::time::Instant;
use tracing::{debug, info};

use crate::application::context::{ExecutionContext, ForkContext, ForkResult};
use crate::application::executor::WorkflowExecutor;
use crate::application::nodes::NodeExecutor;
use crate::domain::error::EngineError;
use crate::domain::state::{keys, ExecutionResult, NodeResult};
use crate::domain::workflow::{ExitStatus, Node};

/// Executor for `Fork` nodes: spawns each target as an independent child
/// execution on the shared pool (state branched from the parent, fresh
/// execution id) and completes immediately. The spawned handles are stashed
/// in the execution context under the fork node's id for a later `Join`.
pub struct ForkNodeExecutor;

#[async_trait]
impl NodeExecutor for ForkNodeExecutor {
    async fn execute(
        &self,
        node_id: &str,
        node: &Node,
        ctx: &mut ExecutionContext,
    ) -> Result<NodeResult, EngineError> {
        let Node::Fork {
            targets,
            wait_for_all,
            ..
        } = node
        else {
            return Err(EngineError::IllegalState(format!(
                "fork executor dispatched for non-fork node '{node_id}'"
            )));
        };

        if targets.is_empty() {
            return Ok(NodeResult::failure("fork node has no targets"));
        }

        let mut handles = Vec::with_capacity(targets.len());
        for target in targets {
            let services = ctx.services.clone();
            let workflow = ctx.workflow.clone();
            let listener = ctx.listener.clone();
            let child_state = ctx.state.branch_for(target.clone());
            let target = target.clone();
            let target_for_handle = target.clone();

            info!(
                fork = %node_id,
                target = %target,
                child_execution = %child_state.execution_id,
                "spawning fork child"
            );

            let handle = tokio::spawn(async move {
                let started = Instant::now();
                let executor = WorkflowExecutor::new(services);
                let outcome = executor.execute_from(workflow, child_state, listener).await;
                let elapsed = started.elapsed().as_millis() as u64;

                match outcome {
                    ExecutionResult::Completed {
                        state,
                        exit_status: ExitStatus::Success,
                    } => {
                        // The child's contribution is whatever its target
                        // node extracted into context.
                        let output = state.context.get(&target).cloned();
                        ForkResult::success(target, output, elapsed)
                    }
                    ExecutionResult::Completed { exit_status, .. } => ForkResult::failure(
                        target,
                        format!("child completed with exit status {exit_status:?}"),
                        elapsed,
                    ),
                    ExecutionResult::Paused { .. } => {
                        ForkResult::failure(target, "child execution paused", elapsed)
                    }
                    ExecutionResult::Rejected { reason, .. } => {
                        ForkResult::failure(target, format!("child rejected: {reason}"), elapsed)
                    }
                    ExecutionResult::Failure { error, .. } => {
                        ForkResult::failure(target, error.to_string(), elapsed)
                    }
                }
            });

            handles.push((target_for_handle, handle));
        }

        ctx.fork_contexts
            .insert(node_id.to_string(), ForkContext { handles });

        // The serializable marker travels with the snapshot; the handles do
        // not survive a process boundary.
        ctx.state.set(
            keys::fork_context(node_id),
            json!({ "targets": targets, "wait_for_all": wait_for_all }),
        );

        debug!(fork = %node_id, count = targets.len(), "fork children spawned");
        Ok(NodeResult::success_empty()
            .with_metadata("forked_targets", Value::Array(
                targets.iter().map(|t| json!(t)).collect(),
            )))
    }
}
