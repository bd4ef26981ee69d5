// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! Tool-call plan model for the plan sub-engine.
//!
//! A plan is an ordered sequence of tool-call steps, either authored statically
//! on the node or produced by an external [`Planner`](crate::domain::handlers::Planner).
//! Step execution is tracked in place (`Pending → Running → Succeeded | Failed`)
//! so a paused execution can persist the plan mid-flight and resume it later.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// Default upper bound on plan length when the node's constraints leave it unset.
pub const DEFAULT_MAX_STEPS: u32 = 10;
/// Default upper bound on replanning rounds.
pub const DEFAULT_MAX_REPLANS: u32 = 3;

/// Where a plan came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PlanSource {
    Static,
    Dynamic,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PlanStepStatus {
    Pending,
    Running,
    Succeeded,
    Failed,
}

/// One tool call within a plan.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlanStep {
    pub index: usize,
    pub tool_name: String,
    #[serde(default)]
    pub arguments: Value,
    #[serde(default)]
    pub description: String,
    #[serde(default = "PlanStep::default_status")]
    pub status: PlanStepStatus,
    #[serde(default)]
    pub output: Option<Value>,
}

impl PlanStep {
    fn default_status() -> PlanStepStatus {
        PlanStepStatus::Pending
    }

    pub fn new(index: usize, tool_name: impl Into<String>, arguments: Value) -> Self {
        Self {
            index,
            tool_name: tool_name.into(),
            arguments,
            description: String::new(),
            status: PlanStepStatus::Pending,
            output: None,
        }
    }
}

/// Execution-budget constraints applied to a plan.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlanConstraints {
    #[serde(default = "default_max_steps")]
    pub max_steps: u32,
    #[serde(default = "default_max_replans")]
    pub max_replans: u32,
    /// Wall-clock limit for the whole plan, in milliseconds. 0 = unbounded.
    #[serde(default)]
    pub max_duration_ms: u64,
    #[serde(default = "default_allow_replan")]
    pub allow_replan: bool,
    #[serde(default)]
    pub max_token_budget: Option<u64>,
}

fn default_max_steps() -> u32 {
    DEFAULT_MAX_STEPS
}

fn default_max_replans() -> u32 {
    DEFAULT_MAX_REPLANS
}

fn default_allow_replan() -> bool {
    true
}

impl Default for PlanConstraints {
    fn default() -> Self {
        Self {
            max_steps: DEFAULT_MAX_STEPS,
            max_replans: DEFAULT_MAX_REPLANS,
            max_duration_ms: 0,
            allow_replan: true,
            max_token_budget: None,
        }
    }
}

/// An ordered tool-call plan attached to a `Standard` node execution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Plan {
    pub plan_id: Uuid,
    pub node_id: String,
    pub source: PlanSource,
    pub steps: Vec<PlanStep>,
    #[serde(default)]
    pub constraints: PlanConstraints,
}

impl Plan {
    pub fn new(node_id: impl Into<String>, source: PlanSource, steps: Vec<PlanStep>) -> Self {
        Self {
            plan_id: Uuid::new_v4(),
            node_id: node_id.into(),
            source,
            steps,
            constraints: PlanConstraints::default(),
        }
    }

    pub fn with_constraints(mut self, constraints: PlanConstraints) -> Self {
        self.constraints = constraints;
        self
    }

    /// First step that has not yet succeeded, if any.
    pub fn next_pending(&self) -> Option<&PlanStep> {
        self.steps
            .iter()
            .find(|s| matches!(s.status, PlanStepStatus::Pending | PlanStepStatus::Running))
    }

    pub fn is_complete(&self) -> bool {
        self.steps.iter().all(|s| s.status == PlanStepStatus::Succeeded)
    }

    /// Reset every step to `Pending`, clearing outputs. Used when a revised
    /// plan re-executes from step 0.
    pub fn reset(&mut self) {
        for step in &mut self.steps {
            step.status = PlanStepStatus::Pending;
            step.output = None;
        }
    }
}

/// Context handed to the planner when a step fails and a revision is requested.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RevisionContext {
    pub failed_step_index: usize,
    pub failed_tool: String,
    pub failure_reason: String,
    pub completed_steps: usize,
}

impl RevisionContext {
    pub fn from_failure(step: &PlanStep, reason: impl Into<String>, completed: usize) -> Self {
        Self {
            failed_step_index: step.index,
            failed_tool: step.tool_name.clone(),
            failure_reason: reason.into(),
            completed_steps: completed,
        }
    }
}

/// Decision supplied when resuming an execution paused for plan review.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResumeDecision {
    pub approved: bool,
    /// Optional replacement steps; applied before execution when approved.
    #[serde(default)]
    pub modifications: Option<Vec<PlanStep>>,
}

/// Plan lifecycle events published to registered observers.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum PlanEvent {
    PlanCreated {
        plan_id: Uuid,
        node_id: String,
        source: PlanSource,
        step_count: usize,
    },
    StepStarted {
        plan_id: Uuid,
        index: usize,
        tool_name: String,
    },
    StepCompleted {
        plan_id: Uuid,
        index: usize,
        succeeded: bool,
    },
    PlanRevised {
        plan_id: Uuid,
        revision: u32,
        step_count: usize,
    },
    PlanCompleted {
        plan_id: Uuid,
        node_id: String,
        succeeded: bool,
    },
}
