// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! Workflow Domain Model
//!
//! Defines the workflow aggregate: a directed graph of typed nodes linked by
//! ordered transition rules, traversed by the conductor engine from a start
//! node to an `End` node.
//!
//! # Design Principles
//!
//! 1. **Immutability:** Workflow definitions are immutable once loaded
//! 2. **Type Safety:** Node kinds, transition rules, and actions are sum types
//!    with explicit dispatch — no open-ended polymorphism
//! 3. **Self-Validating:** The constructor enforces the graph invariants
//!    (start node exists, every transition target exists)

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;

use crate::domain::plan::{Plan, PlanConstraints};
use crate::domain::tenant::TenantId;

// ============================================================================
// Aggregate Root: Workflow
// ============================================================================

/// Workflow aggregate root, identified by `(tenant_id, workflow_id, version)`.
///
/// # Invariants
/// - `nodes[start_node]` exists
/// - every transition target referenced by any node exists in `nodes`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Workflow {
    pub tenant_id: TenantId,
    pub workflow_id: String,
    pub version: u32,
    /// Insertion-ordered node map; iteration order is the declaration order.
    pub nodes: IndexMap<String, Node>,
    pub start_node: String,
    /// Agent configurations referenced by standard nodes and branches.
    #[serde(default)]
    pub agents: HashMap<String, AgentConfig>,
    /// Rubric references (`rubric_id → rubric source location`).
    #[serde(default)]
    pub rubrics: HashMap<String, String>,
}

impl Workflow {
    /// Create a workflow with graph validation.
    pub fn new(
        tenant_id: TenantId,
        workflow_id: impl Into<String>,
        version: u32,
        start_node: impl Into<String>,
        nodes: IndexMap<String, Node>,
    ) -> Result<Self, WorkflowError> {
        let workflow = Self {
            tenant_id,
            workflow_id: workflow_id.into(),
            version,
            nodes,
            start_node: start_node.into(),
            agents: HashMap::new(),
            rubrics: HashMap::new(),
        };
        workflow.validate()?;
        Ok(workflow)
    }

    pub fn with_agent(mut self, agent_id: impl Into<String>, config: AgentConfig) -> Self {
        self.agents.insert(agent_id.into(), config);
        self
    }

    pub fn with_rubric(mut self, rubric_id: impl Into<String>, reference: impl Into<String>) -> Self {
        self.rubrics.insert(rubric_id.into(), reference.into());
        self
    }

    fn validate(&self) -> Result<(), WorkflowError> {
        if self.nodes.is_empty() {
            return Err(WorkflowError::NoNodes);
        }
        if !self.nodes.contains_key(&self.start_node) {
            return Err(WorkflowError::StartNodeNotFound(self.start_node.clone()));
        }
        for (node_id, node) in &self.nodes {
            for target in node.referenced_targets() {
                if !self.nodes.contains_key(&target) {
                    return Err(WorkflowError::TransitionTargetNotFound {
                        from_node: node_id.clone(),
                        target,
                    });
                }
            }
        }
        Ok(())
    }

    pub fn get_node(&self, node_id: &str) -> Option<&Node> {
        self.nodes.get(node_id)
    }

    /// The rubric carried by a node, if its kind supports one.
    pub fn node_rubric(&self, node_id: &str) -> Option<&str> {
        self.get_node(node_id).and_then(Node::rubric_id)
    }
}

// ============================================================================
// Value Objects: Nodes
// ============================================================================

/// Exit status carried by an `End` node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ExitStatus {
    Success,
    Failure,
    Cancel,
}

/// A vertex in the workflow graph. Dispatched to a type-specific executor.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Node {
    /// Terminal node; reaching it completes the execution.
    End { exit_status: ExitStatus },

    /// Agent-call node, optionally rubric-scored, reviewed, and plan-driven.
    Standard {
        #[serde(default)]
        agent_id: Option<String>,
        #[serde(default)]
        prompt: Option<String>,
        #[serde(default)]
        rubric_id: Option<String>,
        #[serde(default)]
        review: Option<ReviewConfig>,
        #[serde(default)]
        planning: PlanningConfig,
        #[serde(default)]
        static_plan: Option<Plan>,
        /// Transition target taken when plan creation/execution is exhausted.
        #[serde(default)]
        plan_failure_target: Option<String>,
        /// JSON fields lifted from the agent output into context.
        #[serde(default)]
        output_params: Vec<String>,
        #[serde(default)]
        transitions: Vec<TransitionRule>,
    },

    /// Concurrent branches with optional consensus voting over the results.
    Parallel {
        branches: Vec<Branch>,
        #[serde(default)]
        consensus: Option<ConsensusConfig>,
        #[serde(default)]
        transitions: Vec<TransitionRule>,
    },

    /// Spawns each target as an independent child execution and completes
    /// immediately; a later `Join` collects the results.
    Fork {
        targets: Vec<String>,
        #[serde(default)]
        wait_for_all: bool,
        #[serde(default)]
        transitions: Vec<TransitionRule>,
    },

    /// Awaits fork children and merges their outputs.
    Join {
        await_targets: Vec<String>,
        #[serde(default)]
        merge_strategy: MergeStrategy,
        /// Context key the merged output is written to. Default `fork_results`.
        #[serde(default)]
        output_field: Option<String>,
        /// Per-future await timeout in milliseconds; 0 = unbounded.
        #[serde(default)]
        timeout_ms: u64,
        #[serde(default)]
        fail_on_any_error: bool,
        #[serde(default)]
        transitions: Vec<TransitionRule>,
    },

    /// Loop header: counts iterations and breaks to the configured exit.
    Loop {
        #[serde(default)]
        break_conditions: Vec<BreakCondition>,
        max_iterations: u32,
        #[serde(default)]
        transitions: Vec<TransitionRule>,
    },

    /// Runs a nested workflow with context mapping in both directions.
    SubWorkflow {
        workflow_id: String,
        #[serde(default)]
        input_mapping: HashMap<String, String>,
        #[serde(default)]
        output_mapping: HashMap<String, String>,
        #[serde(default)]
        transitions: Vec<TransitionRule>,
    },

    /// Dispatches side effects to registered external handlers.
    Action {
        actions: Vec<ActionSpec>,
        #[serde(default)]
        transitions: Vec<TransitionRule>,
    },

    /// Delegates to a registered generic handler by executor type.
    Generic {
        executor_type: String,
        #[serde(default)]
        config: HashMap<String, Value>,
        #[serde(default)]
        rubric_id: Option<String>,
        #[serde(default)]
        transitions: Vec<TransitionRule>,
    },
}

impl Node {
    pub fn transitions(&self) -> &[TransitionRule] {
        match self {
            Node::End { .. } => &[],
            Node::Standard { transitions, .. }
            | Node::Parallel { transitions, .. }
            | Node::Fork { transitions, .. }
            | Node::Join { transitions, .. }
            | Node::Loop { transitions, .. }
            | Node::SubWorkflow { transitions, .. }
            | Node::Action { transitions, .. }
            | Node::Generic { transitions, .. } => transitions,
        }
    }

    pub fn rubric_id(&self) -> Option<&str> {
        match self {
            Node::Standard { rubric_id, .. } | Node::Generic { rubric_id, .. } => {
                rubric_id.as_deref()
            }
            _ => None,
        }
    }

    pub fn is_end(&self) -> bool {
        matches!(self, Node::End { .. })
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Node::End { .. } => "end",
            Node::Standard { .. } => "standard",
            Node::Parallel { .. } => "parallel",
            Node::Fork { .. } => "fork",
            Node::Join { .. } => "join",
            Node::Loop { .. } => "loop",
            Node::SubWorkflow { .. } => "sub_workflow",
            Node::Action { .. } => "action",
            Node::Generic { .. } => "generic",
        }
    }

    /// Every node id this node can hand control to (graph validation).
    fn referenced_targets(&self) -> Vec<String> {
        let mut targets: Vec<String> = self
            .transitions()
            .iter()
            .flat_map(TransitionRule::referenced_targets)
            .collect();
        match self {
            Node::Fork { targets: forked, .. } => targets.extend(forked.iter().cloned()),
            Node::Standard {
                plan_failure_target: Some(t),
                ..
            } => targets.push(t.clone()),
            _ => {}
        }
        targets
    }
}

// ============================================================================
// Value Objects: Transitions
// ============================================================================

/// Ordered predicate on `(state, result)` producing the next node id.
/// Rules are evaluated in declared order; the first non-null target wins.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "on", rename_all = "snake_case")]
pub enum TransitionRule {
    Success {
        target: String,
    },
    Failure {
        #[serde(default)]
        retry_count: u32,
        #[serde(default)]
        retry_target: Option<String>,
        else_target: String,
    },
    Score {
        conditions: Vec<ScoreCondition>,
    },
}

impl TransitionRule {
    fn referenced_targets(&self) -> Vec<String> {
        match self {
            TransitionRule::Success { target } => vec![target.clone()],
            TransitionRule::Failure {
                retry_target,
                else_target,
                ..
            } => {
                let mut v = vec![else_target.clone()];
                if let Some(t) = retry_target {
                    v.push(t.clone());
                }
                v
            }
            TransitionRule::Score { conditions } => {
                conditions.iter().map(|c| c.target.clone()).collect()
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ScoreOperator {
    Gt,
    Gte,
    Lt,
    Lte,
    Range,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScoreCondition {
    pub operator: ScoreOperator,
    #[serde(default)]
    pub value: f64,
    /// Inclusive interval used by `Range`.
    #[serde(default)]
    pub range: Option<(f64, f64)>,
    pub target: String,
}

impl ScoreCondition {
    pub fn matches(&self, score: f64) -> bool {
        match self.operator {
            ScoreOperator::Gt => score > self.value,
            ScoreOperator::Gte => score >= self.value,
            ScoreOperator::Lt => score < self.value,
            ScoreOperator::Lte => score <= self.value,
            ScoreOperator::Range => self
                .range
                .map(|(lo, hi)| score >= lo && score <= hi)
                .unwrap_or(false),
        }
    }
}

// ============================================================================
// Value Objects: Node Configuration
// ============================================================================

/// Actions dispatched by an `Action` node. The `Send` handler model is the
/// authoritative form; commands are resolved through a registry populated at
/// wiring time, never from workflow text.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum ActionSpec {
    Send { handler_id: String, payload: Value },
    Execute { command_id: String },
}

/// Configuration for one branch of a `Parallel` node.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Branch {
    pub id: String,
    pub agent_id: String,
    #[serde(default)]
    pub prompt: Option<String>,
    #[serde(default)]
    pub rubric_id: Option<String>,
    #[serde(default = "default_weight")]
    pub weight: f64,
}

fn default_weight() -> f64 {
    1.0
}

/// Agent configuration as referenced from a workflow definition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    pub agent_id: String,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub system_prompt: Option<String>,
    #[serde(default)]
    pub parameters: HashMap<String, Value>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ReviewMode {
    Disabled,
    Optional,
    Required,
}

/// Human-review checkpoint configuration on a `Standard` node.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReviewConfig {
    pub mode: ReviewMode,
    #[serde(default)]
    pub allow_backtrack: bool,
    #[serde(default)]
    pub allow_edit: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PlanningMode {
    Disabled,
    Static,
    Dynamic,
}

impl Default for PlanningMode {
    fn default() -> Self {
        Self::Disabled
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlanningConfig {
    #[serde(default)]
    pub mode: PlanningMode,
    #[serde(default)]
    pub constraints: PlanConstraints,
    /// Pause the execution for plan approval before running the steps.
    #[serde(default)]
    pub review_before_execute: bool,
}

impl Default for PlanningConfig {
    fn default() -> Self {
        Self {
            mode: PlanningMode::Disabled,
            constraints: PlanConstraints::default(),
            review_before_execute: false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ConsensusStrategy {
    MajorityVote,
    Unanimous,
    WeightedVote,
    JudgeDecides,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConsensusConfig {
    pub strategy: ConsensusStrategy,
    #[serde(default)]
    pub threshold: Option<f64>,
    /// Agent consulted by the `JudgeDecides` strategy.
    #[serde(default)]
    pub judge_agent_id: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MergeStrategy {
    CollectAll,
    FirstCompleted,
    Concatenate,
    MergeMaps,
    /// Behaves as `CollectAll`; post-processing is left to a downstream
    /// `Generic` node.
    Custom,
}

impl Default for MergeStrategy {
    fn default() -> Self {
        Self::CollectAll
    }
}

/// Break predicate evaluated by a `Loop` node against the runtime context.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "when", rename_all = "snake_case")]
pub enum BreakCondition {
    ContextEquals { key: String, value: Value },
    ContextTruthy { key: String },
    ContextExists { key: String },
}

impl BreakCondition {
    pub fn matches(&self, context: &HashMap<String, Value>) -> bool {
        match self {
            BreakCondition::ContextEquals { key, value } => {
                context.get(key).map(|v| v == value).unwrap_or(false)
            }
            BreakCondition::ContextTruthy { key } => match context.get(key) {
                Some(Value::Bool(b)) => *b,
                Some(Value::String(s)) => s == "true",
                Some(Value::Number(n)) => n.as_f64().map(|f| f != 0.0).unwrap_or(false),
                _ => false,
            },
            BreakCondition::ContextExists { key } => context.contains_key(key),
        }
    }
}

// ============================================================================
// Domain Errors
// ============================================================================

#[derive(Debug, thiserror::Error)]
pub enum WorkflowError {
    #[error("workflow must have at least one node")]
    NoNodes,

    #[error("start node '{0}' not found in workflow nodes")]
    StartNodeNotFound(String),

    #[error("transition target '{target}' not found (from node '{from_node}')")]
    TransitionTargetNotFound { from_node: String, target: String },
}
