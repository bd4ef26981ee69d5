// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{info, warn};

use crate::application::context::{ExecutionContext, MAX_SUBWORKFLOW_DEPTH};
use crate::application::executor::WorkflowExecutor;
use crate::application::nodes::NodeExecutor;
use crate::domain::error::EngineError;
use crate::domain::state::{keys, ExecutionResult, NodeResult};
use crate::domain::tenant::TenantId;
use crate::domain::workflow::{ExitStatus, Node};

/// Executor for `SubWorkflow` nodes: loads the nested workflow through the
/// tenant-scoped repository (tenant read from `_tenant_id`), maps the input
/// keys into a child context, runs the child recursively, and maps outputs
/// back on completion.
pub struct SubWorkflowNodeExecutor;

#[async_trait]
impl NodeExecutor for SubWorkflowNodeExecutor {
    async fn execute(
        &self,
        node_id: &str,
        node: &Node,
        ctx: &mut ExecutionContext,
    ) -> Result<NodeResult, EngineError> {
        let Node::SubWorkflow {
            workflow_id,
            input_mapping,
            output_mapping,
            ..
        } = node
        else {
            return Err(EngineError::IllegalState(format!(
                "sub-workflow executor dispatched for '{node_id}'"
            )));
        };

        if ctx.depth >= MAX_SUBWORKFLOW_DEPTH {
            return Err(EngineError::SubWorkflow(format!(
                "sub-workflow nesting exceeds depth {MAX_SUBWORKFLOW_DEPTH}"
            )));
        }

        let tenant_id = ctx
            .state
            .get_str(keys::TENANT_ID)
            .map(TenantId::from)
            .ok_or_else(|| {
                EngineError::IllegalState(format!(
                    "sub-workflow '{node_id}' requires '{}' in context",
                    keys::TENANT_ID
                ))
            })?;

        let child_workflow = ctx
            .services
            .workflows
            .find_by_id(&tenant_id, workflow_id)
            .await?
            .ok_or_else(|| {
                EngineError::SubWorkflow(format!(
                    "workflow '{workflow_id}' not found for tenant {tenant_id}"
                ))
            })?;

        // Build the child context from the input mapping (child key ←
        // parent key). A missing parent key is an authoring error.
        let mut child_context: HashMap<String, Value> = HashMap::new();
        for (child_key, parent_key) in input_mapping {
            let value = ctx.state.get(parent_key).cloned().ok_or_else(|| {
                EngineError::IllegalState(format!(
                    "sub-workflow input mapping references missing context key '{parent_key}'"
                ))
            })?;
            child_context.insert(child_key.clone(), value);
        }

        info!(
            node_id = %node_id,
            child_workflow = %workflow_id,
            depth = ctx.depth + 1,
            "starting sub-workflow"
        );

        let executor = WorkflowExecutor::new(ctx.services.clone()).with_depth(ctx.depth + 1);
        let outcome = executor
            .execute(Arc::new(child_workflow), child_context, ctx.listener.clone())
            .await;

        match outcome {
            ExecutionResult::Completed {
                state: child_state,
                exit_status: ExitStatus::Success,
            } => {
                // Map outputs back (parent key ← child key).
                for (parent_key, child_key) in output_mapping {
                    match child_state.context.get(child_key) {
                        Some(value) => ctx.state.set(parent_key.clone(), value.clone()),
                        None => {
                            warn!(
                                node_id = %node_id,
                                child_key = %child_key,
                                "sub-workflow output key missing; skipping"
                            );
                        }
                    }
                }
                Ok(NodeResult::success_empty().with_metadata(
                    "sub_workflow_execution_id",
                    Value::String(child_state.execution_id.to_string()),
                ))
            }
            ExecutionResult::Completed { exit_status, .. } => Ok(NodeResult::failure(format!(
                "sub-workflow '{workflow_id}' completed with {exit_status:?}"
            ))),
            ExecutionResult::Paused { .. } => Ok(NodeResult::failure(format!(
                "sub-workflow '{workflow_id}' paused; pause inside sub-workflows is unsupported"
            ))),
            ExecutionResult::Rejected { reason, .. } => Ok(NodeResult::failure(format!(
                "sub-workflow '{workflow_id}' rejected: {reason}"
            ))),
            ExecutionResult::Failure { error, .. } => Ok(NodeResult::failure(format!(
                "sub-workflow '{workflow_id}' failed: {error}"
            ))),
        }
    }
}
