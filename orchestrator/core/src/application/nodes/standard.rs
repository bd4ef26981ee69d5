// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

use async_trait::async_trait;
use serde_json::Value;
use tracing::debug;

use crate::application::context::ExecutionContext;
use crate::application::nodes::NodeExecutor;
use crate::application::plan::PlanService;
use crate::domain::agent::AgentResponse;
use crate::domain::error::EngineError;
use crate::domain::state::NodeResult;
use crate::domain::workflow::{Node, PlanningMode};

/// Executor for `Standard` nodes: resolves the prompt (honoring overrides),
/// then either drives the plan sub-engine or calls the node's agent directly.
pub struct StandardNodeExecutor;

#[async_trait]
impl NodeExecutor for StandardNodeExecutor {
    async fn execute(
        &self,
        node_id: &str,
        node: &Node,
        ctx: &mut ExecutionContext,
    ) -> Result<NodeResult, EngineError> {
        let Node::Standard {
            agent_id,
            prompt,
            planning,
            static_plan,
            plan_failure_target,
            ..
        } = node
        else {
            return Err(EngineError::IllegalState(format!(
                "standard executor dispatched for non-standard node '{node_id}'"
            )));
        };

        let resolved_prompt = ctx.resolve_prompt(node_id, prompt.as_deref());

        if planning.mode != PlanningMode::Disabled {
            return PlanService::run(
                ctx,
                node_id,
                planning,
                static_plan.as_ref(),
                &resolved_prompt,
                plan_failure_target.as_deref(),
            )
            .await;
        }

        let Some(agent_id) = agent_id else {
            // Agent-less standard node: a pure templating step.
            debug!(node_id = %node_id, "standard node without agent; passing prompt through");
            return Ok(if resolved_prompt.is_empty() {
                NodeResult::success_empty()
            } else {
                NodeResult::success(resolved_prompt)
            });
        };

        let agent = ctx
            .services
            .agents
            .get(agent_id)
            .ok_or_else(|| EngineError::AgentNotFound(agent_id.clone()))?;

        let execution_id = ctx.state.execution_id;
        ctx.listener.on_agent_start(execution_id, node_id, agent_id);

        let response = agent.execute(&resolved_prompt, &ctx.state.context).await;

        ctx.listener.on_agent_complete(execution_id, node_id, agent_id);

        match response {
            Ok(AgentResponse::Text { content, metadata }) => {
                let mut result = NodeResult::success(content);
                for (key, value) in metadata {
                    result.metadata.insert(key, value);
                }
                result
                    .metadata
                    .insert("agent_id".to_string(), Value::String(agent_id.clone()));
                Ok(result)
            }
            Ok(AgentResponse::Error { message }) => Ok(NodeResult::failure(message)),
            Ok(AgentResponse::ToolRequest { tool_name, .. }) => Ok(NodeResult::failure(format!(
                "agent requested tool '{tool_name}' outside planning mode"
            ))),
            Ok(AgentResponse::PlanProposal { .. }) => Ok(NodeResult::failure(
                "agent proposed a plan outside planning mode",
            )),
            Err(e) => Ok(NodeResult::failure(e.to_string())),
        }
    }
}
