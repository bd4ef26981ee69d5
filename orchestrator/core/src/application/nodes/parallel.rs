// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

use async_trait::async_trait;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::application::consensus::{BranchResult, ConsensusEvaluator};
use crate::application::context::ExecutionContext;
use crate::application::nodes::NodeExecutor;
use crate::domain::agent::AgentResponse;
use crate::domain::error::EngineError;
use crate::domain::state::{keys, NodeResult};
use crate::domain::workflow::Node;

/// Executor for `Parallel` nodes: fans the branches out on the shared pool
/// (bounded by the branch-concurrency semaphore), optionally rubric-scores
/// each branch, then evaluates consensus over the collected results.
///
/// Branch results are collected in branch declaration order regardless of
/// completion order.
pub struct ParallelNodeExecutor;

#[async_trait]
impl NodeExecutor for ParallelNodeExecutor {
    async fn execute(
        &self,
        node_id: &str,
        node: &Node,
        ctx: &mut ExecutionContext,
    ) -> Result<NodeResult, EngineError> {
        let Node::Parallel {
            branches,
            consensus,
            ..
        } = node
        else {
            return Err(EngineError::IllegalState(format!(
                "parallel executor dispatched for non-parallel node '{node_id}'"
            )));
        };

        if branches.is_empty() {
            return Ok(NodeResult::failure("parallel node has no branches"));
        }

        let semaphore = Arc::new(Semaphore::new(ctx.services.config.branch_concurrency));
        let mut handles = Vec::with_capacity(branches.len());

        for branch in branches {
            let prompt = {
                // Branch prompt override uses the branch id as the key.
                let override_key = keys::prompt_override(&branch.id);
                let template = ctx
                    .state
                    .get_str(&override_key)
                    .map(String::from)
                    .or_else(|| branch.prompt.clone())
                    .unwrap_or_default();
                ctx.services.templates.resolve(&template, &ctx.state.context)
            };

            let services = ctx.services.clone();
            // The cloned context carries `_tenant_id`, so branch rubrics and
            // agents stay scoped to the spawning execution's tenant.
            let context: HashMap<String, Value> = ctx.state.context.clone();
            let branch = branch.clone();
            let branch_id_for_handle = branch.id.clone();
            let semaphore = semaphore.clone();

            let handle = tokio::spawn(async move {
                let _permit = semaphore.acquire_owned().await;
                let started = Instant::now();

                let agent = match services.agents.get(&branch.agent_id) {
                    Some(agent) => agent,
                    None => {
                        return BranchResult {
                            branch_id: branch.id.clone(),
                            weight: branch.weight,
                            result: NodeResult::failure(format!(
                                "agent '{}' not registered",
                                branch.agent_id
                            )),
                            execution_time_ms: 0,
                        }
                    }
                };

                let mut result = match agent.execute(&prompt, &context).await {
                    Ok(AgentResponse::Text { content, metadata }) => {
                        let mut r = NodeResult::success(content);
                        r.metadata.extend(metadata);
                        r
                    }
                    Ok(AgentResponse::Error { message }) => NodeResult::failure(message),
                    Ok(other) => NodeResult::failure(format!(
                        "branch agent returned unsupported response: {other:?}"
                    )),
                    Err(e) => NodeResult::failure(e.to_string()),
                };

                // Branch-level rubric populates the vote extraction metadata.
                if let (Some(rubric_id), Some(engine), Some(output)) = (
                    branch.rubric_id.as_deref(),
                    services.rubric_engine.as_ref(),
                    result.output.clone(),
                ) {
                    match engine.evaluate(rubric_id, &branch.id, &output, &context).await {
                        Ok(evaluation) => {
                            result
                                .metadata
                                .insert("rubric_passed".into(), json!(evaluation.passed));
                            result
                                .metadata
                                .insert("rubric_score".into(), json!(evaluation.score));
                        }
                        Err(e) => {
                            warn!(branch = %branch.id, error = %e, "branch rubric evaluation failed");
                        }
                    }
                }

                BranchResult {
                    branch_id: branch.id.clone(),
                    weight: branch.weight,
                    result,
                    execution_time_ms: started.elapsed().as_millis() as u64,
                }
            });

            handles.push((branch_id_for_handle, handle));
        }

        // Collect in declaration order.
        let mut results = Vec::with_capacity(handles.len());
        for (branch_id, handle) in handles {
            match handle.await {
                Ok(result) => results.push(result),
                Err(e) => results.push(BranchResult {
                    branch_id: branch_id.clone(),
                    weight: 1.0,
                    result: NodeResult::failure(format!("branch task panicked: {e}")),
                    execution_time_ms: 0,
                }),
            }
        }

        debug!(node_id = %node_id, branches = results.len(), "parallel branches complete");

        let Some(consensus_config) = consensus else {
            // No consensus: succeed with every branch's output.
            let outputs: Vec<Value> = results
                .iter()
                .map(|r| {
                    json!({
                        "branch_id": r.branch_id,
                        "output": r.result.output.clone(),
                        "status": r.result.status,
                        "execution_time_ms": r.execution_time_ms,
                    })
                })
                .collect();
            let body = serde_json::to_string(&outputs).unwrap_or_default();
            return Ok(NodeResult::success(body));
        };

        let evaluator = ConsensusEvaluator::new(ctx.services.agents.clone());
        let outcome = evaluator
            .evaluate(node_id, &results, consensus_config, &ctx.state.context)
            .await?;

        let metadata = outcome.to_metadata();
        ctx.listener.on_consensus(
            ctx.state.execution_id,
            node_id,
            outcome.reached,
            &metadata,
        );

        let mut result = if outcome.reached {
            NodeResult::success(outcome.final_output.clone().unwrap_or_default())
        } else {
            NodeResult::failure("consensus not reached")
        };
        result.metadata.extend(metadata);
        Ok(result)
    }
}
