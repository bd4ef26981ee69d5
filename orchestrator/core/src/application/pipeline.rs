// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! Processor Pipeline
//!
//! Every cross-cutting behavior of the traversal — checkpointing, listener
//! notification, output extraction, history, review, rubric scoring, and
//! transition selection — lives in an ordered processor chain. The traversal
//! loop itself contains none of that logic.
//!
//! Pre-execution: checkpoint → node-start.
//! Post-execution: output-extraction → node-complete → history → review →
//! rubric → transition.
//!
//! A processor either returns `None` (continue) or a terminal
//! [`ExecutionResult`] (short-circuit). Processors that move the traversal
//! target set `state.current_node`, mark the step redirected, and return
//! `None` so the loop re-enters at the new node.

use async_trait::async_trait;
use serde_json::{json, Value};
use tracing::{debug, info, warn};

use crate::application::context::ExecutionContext;
use crate::application::transition::{evaluate_transitions, score_rule_target};
use crate::domain::error::EngineError;
use crate::domain::handlers::ReviewDecision;
use crate::domain::rubric::{decide_backtrack, BacktrackSeverity};
use crate::domain::state::{
    keys, BacktrackType, ExecutionResult, NodeResult, NodeStatus, Snapshot, SnapshotStatus,
};
use crate::domain::validation::validate_output;
use crate::domain::workflow::{Node, ReviewMode};

/// Per-step mutable bundle threaded through the processors.
pub struct PipelineStep {
    pub node_id: String,
    pub node: Node,
    /// `None` during the pre-pipeline; the dispatch result afterwards.
    pub result: Option<NodeResult>,
    /// Set when review or rubric moved the traversal target; the remaining
    /// processors (rubric, transition) skip the step.
    pub redirected: bool,
}

impl PipelineStep {
    pub fn pre(node_id: impl Into<String>, node: Node) -> Self {
        Self {
            node_id: node_id.into(),
            node,
            result: None,
            redirected: false,
        }
    }

    pub fn post(node_id: impl Into<String>, node: Node, result: NodeResult) -> Self {
        Self {
            node_id: node_id.into(),
            node,
            result: Some(result),
            redirected: false,
        }
    }
}

#[async_trait]
pub trait Processor: Send + Sync {
    fn name(&self) -> &'static str;

    async fn process(
        &self,
        ctx: &mut ExecutionContext,
        step: &mut PipelineStep,
    ) -> Result<Option<ExecutionResult>, EngineError>;
}

/// Ordered processor chain.
pub struct Pipeline {
    processors: Vec<Box<dyn Processor>>,
}

impl Pipeline {
    pub fn pre_execution() -> Self {
        Self {
            processors: vec![Box::new(CheckpointProcessor), Box::new(NodeStartProcessor)],
        }
    }

    pub fn post_execution() -> Self {
        Self {
            processors: vec![
                Box::new(OutputExtractionProcessor),
                Box::new(NodeCompleteProcessor),
                Box::new(HistoryProcessor),
                Box::new(ReviewProcessor),
                Box::new(RubricProcessor),
                Box::new(TransitionProcessor),
            ],
        }
    }

    pub async fn run(
        &self,
        ctx: &mut ExecutionContext,
        step: &mut PipelineStep,
    ) -> Result<Option<ExecutionResult>, EngineError> {
        for processor in &self.processors {
            if let Some(terminal) = processor.process(ctx, step).await? {
                debug!(processor = processor.name(), "pipeline short-circuit");
                return Ok(Some(terminal));
            }
        }
        Ok(None)
    }
}

// ============================================================================
// Pre-Execution Processors
// ============================================================================

/// Persists a `checkpoint` snapshot before the node runs. The save carries
/// this instance's lease; a [`RepositoryError::LeaseConflict`] means another
/// instance claimed the execution and this owner must abort without writing.
struct CheckpointProcessor;

#[async_trait]
impl Processor for CheckpointProcessor {
    fn name(&self) -> &'static str {
        "checkpoint"
    }

    async fn process(
        &self,
        ctx: &mut ExecutionContext,
        _step: &mut PipelineStep,
    ) -> Result<Option<ExecutionResult>, EngineError> {
        let snapshot = Snapshot::from_state(
            ctx.tenant_id.clone(),
            &ctx.state,
            SnapshotStatus::Checkpoint,
            ctx.services.server_node_id,
        );

        match ctx.services.states.save(&ctx.tenant_id, &snapshot).await {
            Ok(()) => {
                ctx.listener.on_checkpoint(&snapshot);
                Ok(None)
            }
            Err(crate::domain::repository::RepositoryError::LeaseConflict { owner, .. }) => {
                warn!(
                    execution_id = %ctx.state.execution_id,
                    new_owner = %owner,
                    "lease lost; aborting without further writes"
                );
                Err(EngineError::LeaseLost(ctx.state.execution_id.to_string()))
            }
            Err(e) => Err(e.into()),
        }
    }
}

struct NodeStartProcessor;

#[async_trait]
impl Processor for NodeStartProcessor {
    fn name(&self) -> &'static str {
        "node-start"
    }

    async fn process(
        &self,
        ctx: &mut ExecutionContext,
        step: &mut PipelineStep,
    ) -> Result<Option<ExecutionResult>, EngineError> {
        ctx.listener
            .on_node_start(ctx.state.execution_id, &step.node_id, step.node.kind());
        Ok(None)
    }
}

// ============================================================================
// Post-Execution Processors
// ============================================================================

/// Writes validated node output into context under the node id; for
/// `Standard` nodes with `output_params`, lifts the named JSON fields out of
/// the output as well. Output that fails sanitization turns the step into a
/// `FAILURE` result and nothing reaches context.
struct OutputExtractionProcessor;

#[async_trait]
impl Processor for OutputExtractionProcessor {
    fn name(&self) -> &'static str {
        "output-extraction"
    }

    async fn process(
        &self,
        ctx: &mut ExecutionContext,
        step: &mut PipelineStep,
    ) -> Result<Option<ExecutionResult>, EngineError> {
        let Some(result) = step.result.as_mut() else {
            return Ok(None);
        };
        let Some(output) = result.output.clone() else {
            return Ok(None);
        };

        if let Err(e) = validate_output(&output, ctx.services.config.max_output_bytes) {
            warn!(node_id = %step.node_id, error = %e, "output rejected by validator");
            *result = NodeResult::failure(e.to_string());
            return Ok(None);
        }

        ctx.state
            .set(step.node_id.clone(), Value::String(output.clone()));

        if let Node::Standard { output_params, .. } = &step.node {
            if !output_params.is_empty() {
                match serde_json::from_str::<Value>(&output) {
                    Ok(parsed) => {
                        for param in output_params {
                            match parsed.get(param) {
                                Some(value) => ctx.state.set(param.clone(), value.clone()),
                                None => warn!(
                                    node_id = %step.node_id,
                                    param = %param,
                                    "output param missing from agent output"
                                ),
                            }
                        }
                    }
                    Err(e) => warn!(
                        node_id = %step.node_id,
                        error = %e,
                        "output params requested but output is not JSON"
                    ),
                }
            }
        }

        Ok(None)
    }
}

struct NodeCompleteProcessor;

#[async_trait]
impl Processor for NodeCompleteProcessor {
    fn name(&self) -> &'static str {
        "node-complete"
    }

    async fn process(
        &self,
        ctx: &mut ExecutionContext,
        step: &mut PipelineStep,
    ) -> Result<Option<ExecutionResult>, EngineError> {
        if let Some(result) = &step.result {
            ctx.listener
                .on_node_complete(ctx.state.execution_id, &step.node_id, result);
        }
        Ok(None)
    }
}

struct HistoryProcessor;

#[async_trait]
impl Processor for HistoryProcessor {
    fn name(&self) -> &'static str {
        "history"
    }

    async fn process(
        &self,
        ctx: &mut ExecutionContext,
        step: &mut PipelineStep,
    ) -> Result<Option<ExecutionResult>, EngineError> {
        if let Some(result) = &step.result {
            ctx.state.record_step(step.node_id.clone(), result.clone());
        }
        Ok(None)
    }
}

/// Human-review checkpoint. Runs before the rubric so a review-driven reset
/// stops the rubric from scoring the abandoned node.
struct ReviewProcessor;

#[async_trait]
impl Processor for ReviewProcessor {
    fn name(&self) -> &'static str {
        "review"
    }

    async fn process(
        &self,
        ctx: &mut ExecutionContext,
        step: &mut PipelineStep,
    ) -> Result<Option<ExecutionResult>, EngineError> {
        let Node::Standard {
            review: Some(config),
            ..
        } = &step.node
        else {
            return Ok(None);
        };
        let Some(result) = &step.result else {
            return Ok(None);
        };

        // Implicit approval paths.
        if config.mode == ReviewMode::Disabled
            || (config.mode == ReviewMode::Optional && result.status == NodeStatus::Success)
        {
            return Ok(None);
        }

        let decision = ctx
            .services
            .review_handler
            .request_review(
                &step.node_id,
                &step.node,
                result,
                &ctx.state,
                &ctx.state.history,
                config,
                &ctx.workflow,
            )
            .await?;

        match decision {
            ReviewDecision::Approve { edited_state } => {
                if let Some(edited) = edited_state {
                    ctx.state.apply_edits(&edited);
                    if ctx.state.current_node != step.node_id {
                        step.redirected = true;
                    }
                }
                Ok(None)
            }
            ReviewDecision::Backtrack {
                target_step,
                edited_state,
                edited_prompt,
                reason,
            } => {
                if let Some(edited) = edited_state {
                    ctx.state.apply_edits(&edited);
                }
                if let Some(prompt) = edited_prompt {
                    ctx.state
                        .set(keys::prompt_override(&target_step), json!(prompt));
                }
                info!(
                    from = %step.node_id,
                    to = %target_step,
                    reason = %reason,
                    "manual review backtrack"
                );
                ctx.state.record_backtrack(
                    step.node_id.clone(),
                    target_step.clone(),
                    reason,
                    BacktrackType::Manual,
                    None,
                );
                if let Some(event) = ctx.state.history.last().and_then(|h| h.as_backtrack()) {
                    ctx.listener.on_backtrack(ctx.state.execution_id, event);
                }
                ctx.state.current_node = target_step;
                step.redirected = true;
                Ok(None)
            }
            ReviewDecision::Reject { reason } => Ok(Some(ExecutionResult::Rejected {
                reason,
                state: Box::new(ctx.state.clone()),
            })),
        }
    }
}

/// Scores the node output against its rubric and applies the auto-backtrack
/// policy. Skipped when review already moved the traversal. A matching
/// `Score` transition rule on the node suppresses auto-backtracking — the
/// transition processor will route on the score instead.
struct RubricProcessor;

#[async_trait]
impl Processor for RubricProcessor {
    fn name(&self) -> &'static str {
        "rubric"
    }

    async fn process(
        &self,
        ctx: &mut ExecutionContext,
        step: &mut PipelineStep,
    ) -> Result<Option<ExecutionResult>, EngineError> {
        if step.redirected {
            return Ok(None);
        }
        let Some(rubric_id) = step.node.rubric_id().map(String::from) else {
            return Ok(None);
        };
        let Some(engine) = ctx.services.rubric_engine.clone() else {
            return Ok(None);
        };
        let Some(output) = step.result.as_ref().and_then(|r| r.output.clone()) else {
            return Ok(None);
        };

        let evaluation = engine
            .evaluate(&rubric_id, &step.node_id, &output, &ctx.state.context)
            .await?;
        debug!(
            node_id = %step.node_id,
            rubric = %rubric_id,
            score = evaluation.score,
            passed = evaluation.passed,
            "rubric evaluated"
        );
        ctx.state.rubric_evaluation = Some(evaluation.clone());

        if evaluation.passed {
            return Ok(None);
        }

        // Score-rule precedence: an explicit score route on the node wins
        // over the automatic policy.
        if score_rule_target(&step.node, evaluation.score).is_some() {
            debug!(node_id = %step.node_id, "score rule present; auto-backtrack suppressed");
            return Ok(None);
        }

        let Some(decision) = decide_backtrack(
            evaluation.score,
            &step.node_id,
            &ctx.state.history,
            &ctx.workflow,
        ) else {
            return Ok(None);
        };

        // Merge the advice keys the retried node will see.
        ctx.state.set(
            keys::BACKTRACK_REASON,
            json!(format!(
                "rubric '{rubric_id}' scored {:.1} ({:?})",
                evaluation.score, decision.severity
            )),
        );
        if !evaluation.failed_criteria.is_empty() {
            ctx.state
                .set(keys::FAILED_CRITERIA, json!(evaluation.failed_criteria));
        } else {
            ctx.state.set(
                keys::IMPROVEMENT_SUGGESTIONS,
                json!(evaluation.suggestions),
            );
        }
        let mut recommendations: Vec<String> = ctx
            .state
            .get_str(keys::RECOMMENDATIONS)
            .map(|prior| vec![prior.to_string()])
            .unwrap_or_default();
        recommendations.extend(evaluation.suggestions.iter().cloned());
        ctx.state
            .set(keys::RECOMMENDATIONS, json!(recommendations.join("\n")));

        if decision.severity == BacktrackSeverity::Minor {
            let attempt = ctx
                .state
                .get(keys::RETRY_ATTEMPT)
                .and_then(Value::as_u64)
                .unwrap_or(0)
                + 1;
            ctx.state.set(keys::RETRY_ATTEMPT, json!(attempt));
        }

        info!(
            from = %step.node_id,
            to = %decision.target,
            score = evaluation.score,
            severity = ?decision.severity,
            "automatic rubric backtrack"
        );
        metrics::counter!("conductor_auto_backtracks_total").increment(1);

        ctx.state.record_backtrack(
            step.node_id.clone(),
            decision.target.clone(),
            format!("rubric score {:.1}", evaluation.score),
            BacktrackType::Automatic,
            Some(evaluation.score),
        );
        if let Some(event) = ctx.state.history.last().and_then(|h| h.as_backtrack()) {
            ctx.listener.on_backtrack(ctx.state.execution_id, event);
        }

        ctx.state.current_node = decision.target;
        step.redirected = true;
        Ok(None)
    }
}

/// Selects the next node from the transition rules. A redirected step skips
/// evaluation — the loop re-enters at the target a prior processor set.
struct TransitionProcessor;

#[async_trait]
impl Processor for TransitionProcessor {
    fn name(&self) -> &'static str {
        "transition"
    }

    async fn process(
        &self,
        ctx: &mut ExecutionContext,
        step: &mut PipelineStep,
    ) -> Result<Option<ExecutionResult>, EngineError> {
        if step.redirected {
            return Ok(None);
        }
        let Some(result) = &step.result else {
            return Ok(None);
        };

        // A plan failure may carry its own routing target.
        if result.status == NodeStatus::Failure {
            if let Some(target) = result
                .metadata
                .get(keys::PLAN_FAILURE_TARGET)
                .and_then(Value::as_str)
            {
                debug!(node_id = %step.node_id, target = %target, "routing via plan failure target");
                ctx.state.current_node = target.to_string();
                return Ok(None);
            }
        }

        match evaluate_transitions(
            &step.node_id,
            &step.node,
            result,
            &mut ctx.state,
            &mut ctx.retry_counts,
        ) {
            Some(target) => {
                debug!(from = %step.node_id, to = %target, "transition");
                ctx.state.current_node = target;
                Ok(None)
            }
            None => Err(EngineError::NoValidTransition(step.node_id.clone())),
        }
    }
}
