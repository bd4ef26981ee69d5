// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! Plan sub-engine.
//!
//! Creates the tool-call plan for a `Standard` node (static from the node, or
//! dynamic through the planner), optionally pauses for human approval, then
//! drives the steps in order through the tool executor. The first failing
//! step triggers replanning until the revision budget is spent; an exhausted
//! plan surfaces as a node `FAILURE`, routed through `plan_failure_target`
//! when the node names one.

use serde_json::{json, Value};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::application::context::ExecutionContext;
use crate::domain::error::EngineError;
use crate::domain::handlers::PlanRequest;
use crate::domain::plan::{Plan, PlanEvent, PlanStepStatus, ResumeDecision, RevisionContext};
use crate::domain::state::{keys, NodeResult};
use crate::domain::workflow::{PlanningConfig, PlanningMode};

pub struct PlanService;

impl PlanService {
    /// Run the plan lifecycle for a planning-enabled `Standard` node.
    pub async fn run(
        ctx: &mut ExecutionContext,
        node_id: &str,
        planning: &PlanningConfig,
        static_plan: Option<&Plan>,
        prompt: &str,
        plan_failure_target: Option<&str>,
    ) -> Result<NodeResult, EngineError> {
        let execution_id = ctx.state.execution_id;

        // Resuming a plan that already went out for review?
        if let Some(plan) = ctx.state.active_plan.clone() {
            if plan.node_id == node_id {
                match Self::take_resume_decision(ctx) {
                    Some(decision) if decision.approved => {
                        let mut plan = plan;
                        if let Some(steps) = decision.modifications {
                            plan.steps = steps;
                            for (index, step) in plan.steps.iter_mut().enumerate() {
                                step.index = index;
                            }
                        }
                        Self::clear_review_keys(ctx, node_id);
                        info!(node_id = %node_id, plan_id = %plan.plan_id, "plan approved on resume");
                        return Self::execute_plan(ctx, node_id, plan, planning, plan_failure_target)
                            .await;
                    }
                    Some(_) => {
                        Self::clear_review_keys(ctx, node_id);
                        ctx.state.active_plan = None;
                        let mut result = NodeResult::failure("plan rejected on review");
                        if let Some(target) = plan_failure_target {
                            result
                                .metadata
                                .insert(keys::PLAN_FAILURE_TARGET.into(), json!(target));
                        }
                        return Ok(result);
                    }
                    None => {
                        // Still waiting for a decision; stay paused.
                        return Ok(Self::pending_review_result(&plan));
                    }
                }
            }
            // Stale plan from an earlier node; drop it.
            ctx.state.active_plan = None;
        }

        let plan = match planning.mode {
            PlanningMode::Static => {
                let plan = static_plan.ok_or_else(|| {
                    EngineError::PlanCreation(format!("node '{node_id}' has no static plan"))
                })?;
                let mut plan = plan.clone();
                plan.node_id = node_id.to_string();
                plan.constraints = planning.constraints.clone();
                plan.reset();
                plan
            }
            PlanningMode::Dynamic => {
                let planner = ctx.services.planner.clone().ok_or_else(|| {
                    EngineError::PlanCreation("dynamic planning without a planner".to_string())
                })?;
                let tools = ctx.available_tools();
                ctx.listener.on_planner_start(execution_id, node_id, prompt);
                let plan = planner
                    .create_plan(PlanRequest {
                        node_id: node_id.to_string(),
                        prompt: prompt.to_string(),
                        tools,
                        context: ctx.state.context.clone(),
                        constraints: planning.constraints.clone(),
                    })
                    .await?;
                ctx.listener
                    .on_planner_complete(execution_id, node_id, plan.steps.len());
                plan
            }
            PlanningMode::Disabled => {
                return Err(EngineError::PlanCreation(format!(
                    "plan requested on node '{node_id}' with planning disabled"
                )))
            }
        };

        if plan.steps.len() as u32 > planning.constraints.max_steps {
            return Err(EngineError::PlanCreation(format!(
                "plan has {} steps, exceeding the limit of {}",
                plan.steps.len(),
                planning.constraints.max_steps
            )));
        }

        ctx.listener.on_plan_event(
            execution_id,
            &PlanEvent::PlanCreated {
                plan_id: plan.plan_id,
                node_id: node_id.to_string(),
                source: plan.source,
                step_count: plan.steps.len(),
            },
        );

        if planning.review_before_execute {
            let result = Self::pending_review_result(&plan);
            ctx.state.set(keys::PLAN_ID, json!(plan.plan_id.to_string()));
            ctx.state.set(keys::PLAN_REVIEW_REQUIRED, json!(true));
            ctx.state.set(keys::PLAN_STEPS, json!(plan.steps.len()));
            ctx.state.active_plan = Some(plan);
            return Ok(result);
        }

        Self::execute_plan(ctx, node_id, plan, planning, plan_failure_target).await
    }

    fn pending_review_result(plan: &Plan) -> NodeResult {
        NodeResult::pending("plan awaiting review")
            .with_metadata(keys::PLAN_ID, json!(plan.plan_id.to_string()))
            .with_metadata(keys::PLAN_REVIEW_REQUIRED, json!(true))
            .with_metadata(keys::PLAN_STEPS, json!(plan.steps.len()))
    }

    fn take_resume_decision(ctx: &mut ExecutionContext) -> Option<ResumeDecision> {
        let raw = ctx.state.context.remove(keys::PLAN_RESUME_DECISION)?;
        match serde_json::from_value(raw) {
            Ok(decision) => Some(decision),
            Err(e) => {
                warn!("unparseable plan resume decision: {e}");
                None
            }
        }
    }

    fn clear_review_keys(ctx: &mut ExecutionContext, _node_id: &str) {
        ctx.state.context.remove(keys::PLAN_REVIEW_REQUIRED);
        ctx.state.context.remove(keys::PLAN_STEPS);
    }

    /// Execute steps in order, revising on failure until the budget is spent.
    async fn execute_plan(
        ctx: &mut ExecutionContext,
        node_id: &str,
        mut plan: Plan,
        planning: &PlanningConfig,
        plan_failure_target: Option<&str>,
    ) -> Result<NodeResult, EngineError> {
        let execution_id = ctx.state.execution_id;
        let constraints = planning.constraints.clone();
        let started = Instant::now();
        let mut replans: u32 = 0;

        ctx.state.active_plan = Some(plan.clone());

        loop {
            let mut failed: Option<(usize, String)> = None;

            for index in 0..plan.steps.len() {
                if constraints.max_duration_ms > 0
                    && started.elapsed().as_millis() as u64 > constraints.max_duration_ms
                {
                    ctx.state.active_plan = None;
                    return Ok(Self::failure_result(
                        format!("plan exceeded its {}ms budget", constraints.max_duration_ms),
                        plan_failure_target,
                    ));
                }

                if plan.steps[index].status == PlanStepStatus::Succeeded {
                    continue;
                }

                plan.steps[index].status = PlanStepStatus::Running;
                let tool_name = plan.steps[index].tool_name.clone();
                let arguments = plan.steps[index].arguments.clone();
                ctx.listener.on_plan_event(
                    execution_id,
                    &PlanEvent::StepStarted {
                        plan_id: plan.plan_id,
                        index,
                        tool_name: tool_name.clone(),
                    },
                );

                let outcome = ctx
                    .services
                    .tool_executor
                    .execute_tool(&ctx.tenant_id, &tool_name, &arguments)
                    .await;

                match outcome {
                    Ok(output) => {
                        plan.steps[index].status = PlanStepStatus::Succeeded;
                        plan.steps[index].output = Some(output);
                        ctx.listener.on_plan_event(
                            execution_id,
                            &PlanEvent::StepCompleted {
                                plan_id: plan.plan_id,
                                index,
                                succeeded: true,
                            },
                        );
                    }
                    Err(e) => {
                        plan.steps[index].status = PlanStepStatus::Failed;
                        ctx.listener.on_plan_event(
                            execution_id,
                            &PlanEvent::StepCompleted {
                                plan_id: plan.plan_id,
                                index,
                                succeeded: false,
                            },
                        );
                        warn!(node_id = %node_id, step = index, tool = %tool_name, error = %e, "plan step failed");
                        failed = Some((index, e.to_string()));
                        break;
                    }
                }
            }

            let Some((failed_index, reason)) = failed else {
                // Every step succeeded.
                ctx.listener.on_plan_event(
                    execution_id,
                    &PlanEvent::PlanCompleted {
                        plan_id: plan.plan_id,
                        node_id: node_id.to_string(),
                        succeeded: true,
                    },
                );
                let outputs: Vec<Value> = plan
                    .steps
                    .iter()
                    .map(|s| {
                        json!({
                            "tool": s.tool_name,
                            "output": s.output.clone().unwrap_or(Value::Null),
                        })
                    })
                    .collect();
                let final_output = plan
                    .steps
                    .last()
                    .and_then(|s| s.output.as_ref())
                    .map(value_to_output)
                    .unwrap_or_default();
                ctx.state.active_plan = None;
                ctx.state.context.remove(keys::PLAN_ID);
                return Ok(NodeResult::success(final_output)
                    .with_metadata(keys::PLAN_ID, json!(plan.plan_id.to_string()))
                    .with_metadata("plan_outputs", Value::Array(outputs)));
            };

            if !constraints.allow_replan || replans >= constraints.max_replans {
                ctx.listener.on_plan_event(
                    execution_id,
                    &PlanEvent::PlanCompleted {
                        plan_id: plan.plan_id,
                        node_id: node_id.to_string(),
                        succeeded: false,
                    },
                );
                ctx.state.active_plan = None;
                return Ok(Self::failure_result(
                    format!("plan step {failed_index} failed after {replans} replans: {reason}"),
                    plan_failure_target,
                ));
            }

            let planner = ctx.services.planner.clone().ok_or_else(|| {
                EngineError::PlanRevision("replan requested without a planner".to_string())
            })?;
            let completed = plan
                .steps
                .iter()
                .filter(|s| s.status == PlanStepStatus::Succeeded)
                .count();
            let revision =
                RevisionContext::from_failure(&plan.steps[failed_index], &reason, completed);
            let mut revised = planner
                .revise_plan(&plan, revision)
                .await
                .map_err(|e| EngineError::PlanRevision(e.to_string()))?;
            revised.node_id = node_id.to_string();
            revised.reset();
            replans += 1;

            debug!(node_id = %node_id, revision = replans, "plan revised; re-executing from step 0");
            ctx.listener.on_plan_event(
                execution_id,
                &PlanEvent::PlanRevised {
                    plan_id: revised.plan_id,
                    revision: replans,
                    step_count: revised.steps.len(),
                },
            );
            plan = revised;
            ctx.state.active_plan = Some(plan.clone());
        }
    }

    fn failure_result(error: String, plan_failure_target: Option<&str>) -> NodeResult {
        let mut result = NodeResult::failure(error);
        if let Some(target) = plan_failure_target {
            result
                .metadata
                .insert(keys::PLAN_FAILURE_TARGET.into(), json!(target));
        }
        result
    }
}

fn value_to_output(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}
