// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! Workflow Executor
//!
//! Owns the traversal loop: resolve node → pre-pipeline → dispatch → pending
//! check → post-pipeline → repeat. Everything else — transitions, output
//! extraction, review, rubric scoring, checkpointing, listener notification —
//! happens inside the processor pipeline, never here.
//!
//! One fresh executor instance drives one execution; instances are not reused
//! across executions. Always returns a concrete [`ExecutionResult`] variant:
//! internal errors become `Failure`, never a panic or an empty return.

use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

use crate::application::context::{Collaborators, ExecutionContext};
use crate::application::nodes::NodeExecutorRegistry;
use crate::application::pipeline::{Pipeline, PipelineStep};
use crate::domain::error::EngineError;
use crate::domain::events::ExecutionListener;
use crate::domain::state::{
    keys, ExecutionResult, NodeStatus, Snapshot, SnapshotStatus, WorkflowState,
};
use crate::domain::workflow::{Node, Workflow};

pub struct WorkflowExecutor {
    services: Arc<Collaborators>,
    registry: NodeExecutorRegistry,
    pre_pipeline: Pipeline,
    post_pipeline: Pipeline,
    depth: u32,
}

impl WorkflowExecutor {
    pub fn new(services: Arc<Collaborators>) -> Self {
        Self {
            services,
            registry: NodeExecutorRegistry::with_defaults(),
            pre_pipeline: Pipeline::pre_execution(),
            post_pipeline: Pipeline::post_execution(),
            depth: 0,
        }
    }

    /// Nesting depth for sub-workflow recursion.
    pub fn with_depth(mut self, depth: u32) -> Self {
        self.depth = depth;
        self
    }

    /// Start a fresh execution from the workflow's start node.
    pub async fn execute(
        &self,
        workflow: Arc<Workflow>,
        initial_context: HashMap<String, Value>,
        listener: Arc<dyn ExecutionListener>,
    ) -> ExecutionResult {
        let mut state = WorkflowState::new(&workflow.workflow_id, &workflow.start_node);
        state.context = initial_context;
        self.execute_from(workflow, state, listener).await
    }

    /// Resume (or start) an execution from a prepared state.
    pub async fn execute_from(
        &self,
        workflow: Arc<Workflow>,
        mut state: WorkflowState,
        listener: Arc<dyn ExecutionListener>,
    ) -> ExecutionResult {
        self.register_missing_agents(&workflow);

        // Reserved identity keys travel with the state so spawned children
        // and resumed executions keep the right scope.
        state.set(keys::TENANT_ID, json!(workflow.tenant_id.as_str()));
        state.set(keys::EXECUTION_ID, json!(state.execution_id.to_string()));

        let mut ctx = ExecutionContext::new(workflow, state, self.services.clone(), listener);
        ctx.depth = self.depth;

        info!(
            execution_id = %ctx.state.execution_id,
            workflow_id = %ctx.state.workflow_id,
            start_node = %ctx.state.current_node,
            "starting traversal"
        );
        metrics::counter!("conductor_executions_started_total").increment(1);

        let result = self.run_loop(&mut ctx).await;

        // Terminal snapshot. A lost lease means another instance owns the
        // execution now — no further writes of any kind.
        if !matches!(&result, ExecutionResult::Failure { error: EngineError::LeaseLost(_), .. }) {
            self.persist_terminal(&ctx, &result).await;
        }

        match &result {
            ExecutionResult::Completed { .. } => {
                metrics::counter!("conductor_executions_completed_total").increment(1)
            }
            ExecutionResult::Failure { .. } => {
                metrics::counter!("conductor_executions_failed_total").increment(1)
            }
            _ => {}
        }

        result
    }

    async fn run_loop(&self, ctx: &mut ExecutionContext) -> ExecutionResult {
        loop {
            let node_id = ctx.state.current_node.clone();
            let Some(node) = ctx.workflow.get_node(&node_id).cloned() else {
                return self.fail(ctx, EngineError::NodeMissing(node_id));
            };

            // Stale evaluations must not bleed across nodes.
            ctx.state.rubric_evaluation = None;

            if let Node::End { exit_status } = &node {
                let exit_status = *exit_status;
                // End bypasses the pipeline; its executor fires the observer
                // callbacks and appends history.
                if let Err(e) = self.registry.dispatch(&node_id, &node, ctx).await {
                    return self.fail(ctx, e);
                }
                info!(
                    execution_id = %ctx.state.execution_id,
                    exit_status = ?exit_status,
                    "execution completed"
                );
                return ExecutionResult::Completed {
                    state: Box::new(ctx.state.clone()),
                    exit_status,
                };
            }

            let mut step = PipelineStep::pre(&node_id, node.clone());
            match self.pre_pipeline.run(ctx, &mut step).await {
                Ok(Some(terminal)) => return terminal,
                Ok(None) => {}
                Err(e) => return self.fail(ctx, e),
            }

            let result = match self.registry.dispatch(&node_id, &node, ctx).await {
                Ok(result) => result,
                Err(e) => return self.fail(ctx, e),
            };

            if result.status == NodeStatus::Pending {
                // Keep the current node; the resume path re-enters it.
                debug!(
                    execution_id = %ctx.state.execution_id,
                    node_id = %node_id,
                    "node pending; pausing execution"
                );
                return ExecutionResult::Paused {
                    state: Box::new(ctx.state.clone()),
                };
            }

            let mut step = PipelineStep::post(&node_id, node, result);
            match self.post_pipeline.run(ctx, &mut step).await {
                Ok(Some(terminal)) => return terminal,
                Ok(None) => {}
                Err(e) => return self.fail(ctx, e),
            }
        }
    }

    fn fail(&self, ctx: &ExecutionContext, error: EngineError) -> ExecutionResult {
        error!(
            execution_id = %ctx.state.execution_id,
            node_id = %ctx.state.current_node,
            error = %error,
            "execution failed"
        );
        ExecutionResult::Failure {
            state: Box::new(ctx.state.clone()),
            error,
        }
    }

    async fn persist_terminal(&self, ctx: &ExecutionContext, result: &ExecutionResult) {
        let snapshot = Snapshot::from_state(
            ctx.tenant_id.clone(),
            result.state(),
            result.snapshot_status(),
            self.services.server_node_id,
        );
        debug_assert!(
            snapshot.status != SnapshotStatus::Checkpoint && snapshot.server_node_id.is_none(),
            "terminal snapshots must release the lease"
        );
        if let Err(e) = self.services.states.save(&ctx.tenant_id, &snapshot).await {
            error!(
                execution_id = %ctx.state.execution_id,
                error = %e,
                "failed to persist terminal snapshot"
            );
        }
    }

    /// Agents referenced by the workflow but absent from the shared registry
    /// are built from the workflow's agent configs before the loop starts.
    fn register_missing_agents(&self, workflow: &Workflow) {
        let Some(factory) = &self.services.agent_factory else {
            return;
        };
        for (agent_id, config) in &workflow.agents {
            if self.services.agents.has_agent(agent_id) {
                continue;
            }
            match factory.create(config) {
                Ok(agent) => {
                    debug!(agent_id = %agent_id, "auto-registered agent from workflow config");
                    self.services.agents.register(agent_id.clone(), agent);
                }
                Err(e) => {
                    warn!(agent_id = %agent_id, error = %e, "agent auto-registration failed");
                }
            }
        }
    }
}
