// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! Runtime execution state.
//!
//! [`WorkflowState`] is the mutable, single-owner state of one execution: the
//! context map, the append-only history, the most recent rubric evaluation,
//! and the loop-break handoff slot. [`Snapshot`] is its immutable persisted
//! projection, carrying the lease columns used by the recovery sweeper.
//!
//! Context keys starting with `_` are system-reserved; the public projection
//! strips them unconditionally.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use uuid::Uuid;

use crate::domain::plan::Plan;
use crate::domain::rubric::RubricEvaluation;
use crate::domain::tenant::TenantId;
use crate::domain::workflow::ExitStatus;

// ============================================================================
// Identifiers
// ============================================================================

/// Unique identifier for one workflow execution, stable for its lifetime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ExecutionId(pub Uuid);

impl ExecutionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ExecutionId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for ExecutionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identity of one orchestrator process, used for snapshot leases.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ServerNodeId(pub Uuid);

impl ServerNodeId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl std::fmt::Display for ServerNodeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ============================================================================
// Reserved Context Keys
// ============================================================================

/// System-reserved context keys. Every reserved key starts with `_` except
/// the documented user-facing bookkeeping keys (`loop_exit_target`,
/// `retry_attempt`, backtrack advice keys).
pub mod keys {
    pub const TENANT_ID: &str = "_tenant_id";
    pub const EXECUTION_ID: &str = "_execution_id";
    pub const PLAN_ID: &str = "_plan_id";
    pub const PLAN_REVIEW_REQUIRED: &str = "_plan_review_required";
    pub const PLAN_STEPS: &str = "_plan_steps";
    pub const PLAN_FAILURE_TARGET: &str = "_plan_failure_target";
    pub const PLAN_RESUME_DECISION: &str = "_plan_resume_decision";

    pub const LOOP_EXIT_TARGET: &str = "loop_exit_target";
    pub const RETRY_ATTEMPT: &str = "retry_attempt";
    pub const BACKTRACK_REASON: &str = "backtrack_reason";
    pub const RECOMMENDATIONS: &str = "recommendations";
    pub const FAILED_CRITERIA: &str = "failed_criteria";
    pub const IMPROVEMENT_SUGGESTIONS: &str = "improvement_suggestions";
    pub const IMPROVEMENT_HINTS: &str = "improvement_hints";

    pub fn prompt_override(node_id: &str) -> String {
        format!("_prompt_override_{node_id}")
    }

    pub fn fork_context(node_id: &str) -> String {
        format!("_fork_context_{node_id}")
    }

    pub fn loop_iterations(node_id: &str) -> String {
        format!("_loop_iterations_{node_id}")
    }
}

// ============================================================================
// History
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BacktrackType {
    Manual,
    Automatic,
    Jump,
}

/// Append-only history entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "entry", rename_all = "snake_case")]
pub enum HistoryEntry {
    Step(ExecutionStep),
    Backtrack(BacktrackEvent),
}

impl HistoryEntry {
    pub fn as_step(&self) -> Option<&ExecutionStep> {
        match self {
            HistoryEntry::Step(s) => Some(s),
            HistoryEntry::Backtrack(_) => None,
        }
    }

    pub fn as_backtrack(&self) -> Option<&BacktrackEvent> {
        match self {
            HistoryEntry::Backtrack(b) => Some(b),
            HistoryEntry::Step(_) => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionStep {
    pub node_id: String,
    /// Context as it stood when the node completed.
    pub context_snapshot: HashMap<String, Value>,
    pub result: NodeResult,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BacktrackEvent {
    pub from: String,
    pub to: String,
    pub reason: String,
    pub backtrack_type: BacktrackType,
    #[serde(default)]
    pub rubric_score: Option<f64>,
    pub timestamp: DateTime<Utc>,
}

// ============================================================================
// Node Results
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum NodeStatus {
    Success,
    Failure,
    Pending,
    End,
}

/// Immutable outcome of one node dispatch.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeResult {
    pub status: NodeStatus,
    #[serde(default)]
    pub output: Option<String>,
    #[serde(default)]
    pub metadata: HashMap<String, Value>,
    #[serde(default)]
    pub error: Option<String>,
    pub timestamp: DateTime<Utc>,
}

impl NodeResult {
    pub fn success(output: impl Into<String>) -> Self {
        Self {
            status: NodeStatus::Success,
            output: Some(output.into()),
            metadata: HashMap::new(),
            error: None,
            timestamp: Utc::now(),
        }
    }

    pub fn success_empty() -> Self {
        Self {
            status: NodeStatus::Success,
            output: None,
            metadata: HashMap::new(),
            error: None,
            timestamp: Utc::now(),
        }
    }

    pub fn failure(error: impl Into<String>) -> Self {
        Self {
            status: NodeStatus::Failure,
            output: None,
            metadata: HashMap::new(),
            error: Some(error.into()),
            timestamp: Utc::now(),
        }
    }

    pub fn pending(output: impl Into<String>) -> Self {
        Self {
            status: NodeStatus::Pending,
            output: Some(output.into()),
            metadata: HashMap::new(),
            error: None,
            timestamp: Utc::now(),
        }
    }

    pub fn end() -> Self {
        Self {
            status: NodeStatus::End,
            output: None,
            metadata: HashMap::new(),
            error: None,
            timestamp: Utc::now(),
        }
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: Value) -> Self {
        self.metadata.insert(key.into(), value);
        self
    }

    pub fn with_output(mut self, output: impl Into<String>) -> Self {
        self.output = Some(output.into());
        self
    }
}

// ============================================================================
// Workflow State
// ============================================================================

/// Mutable runtime state of one execution. Single-owner: the traversal loop,
/// pipeline processors, and node executors for one execution all run on one
/// logical task. Fork children receive clones, never shared references.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowState {
    pub execution_id: ExecutionId,
    pub workflow_id: String,
    pub current_node: String,
    pub context: HashMap<String, Value>,
    pub history: Vec<HistoryEntry>,
    /// Most recent rubric evaluation; cleared before each node executes.
    #[serde(default)]
    pub rubric_evaluation: Option<RubricEvaluation>,
    /// Set by loop-break logic, consumed by transition evaluation.
    #[serde(default)]
    pub loop_break_target: Option<String>,
    /// Plan currently attached to the execution (paused-for-review or running).
    #[serde(default)]
    pub active_plan: Option<Plan>,
}

impl WorkflowState {
    pub fn new(workflow_id: impl Into<String>, start_node: impl Into<String>) -> Self {
        Self {
            execution_id: ExecutionId::new(),
            workflow_id: workflow_id.into(),
            current_node: start_node.into(),
            context: HashMap::new(),
            history: Vec::new(),
            rubric_evaluation: None,
            loop_break_target: None,
            active_plan: None,
        }
    }

    pub fn set(&mut self, key: impl Into<String>, value: Value) {
        self.context.insert(key.into(), value);
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.context.get(key)
    }

    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.context.get(key).and_then(Value::as_str)
    }

    /// User-visible context: every key starting with `_` is stripped.
    pub fn public_context(&self) -> HashMap<String, Value> {
        self.context
            .iter()
            .filter(|(k, _)| !k.starts_with('_'))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }

    pub fn record_step(&mut self, node_id: impl Into<String>, result: NodeResult) {
        self.history.push(HistoryEntry::Step(ExecutionStep {
            node_id: node_id.into(),
            context_snapshot: self.context.clone(),
            result,
            timestamp: Utc::now(),
        }));
    }

    pub fn record_backtrack(
        &mut self,
        from: impl Into<String>,
        to: impl Into<String>,
        reason: impl Into<String>,
        backtrack_type: BacktrackType,
        rubric_score: Option<f64>,
    ) {
        self.history.push(HistoryEntry::Backtrack(BacktrackEvent {
            from: from.into(),
            to: to.into(),
            reason: reason.into(),
            backtrack_type,
            rubric_score,
            timestamp: Utc::now(),
        }));
    }

    /// Copy the user-editable fields of another state into this one, in place.
    /// Used by review decisions carrying an edited state.
    pub fn apply_edits(&mut self, edited: &WorkflowState) {
        self.context = edited.context.clone();
        self.current_node = edited.current_node.clone();
        self.rubric_evaluation = edited.rubric_evaluation.clone();
    }

    /// Branch a child state for a fork target. The child starts a fresh
    /// history and execution id but inherits the parent's context.
    pub fn branch_for(&self, target: impl Into<String>) -> Self {
        Self {
            execution_id: ExecutionId::new(),
            workflow_id: self.workflow_id.clone(),
            current_node: target.into(),
            context: self.context.clone(),
            history: Vec::new(),
            rubric_evaluation: None,
            loop_break_target: None,
            active_plan: None,
        }
    }
}

// ============================================================================
// Snapshots
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SnapshotStatus {
    Checkpoint,
    Paused,
    Completed,
    Rejected,
    Failed,
}

impl SnapshotStatus {
    /// Terminal statuses release the lease (`server_node_id = None`).
    pub fn is_terminal(&self) -> bool {
        !matches!(self, SnapshotStatus::Checkpoint)
    }
}

/// Immutable persisted projection of a [`WorkflowState`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Snapshot {
    pub tenant_id: TenantId,
    pub workflow_id: String,
    pub execution_id: ExecutionId,
    pub current_node_id: Option<String>,
    pub context: HashMap<String, Value>,
    #[serde(default)]
    pub active_plan: Option<Plan>,
    #[serde(default)]
    pub rubric_evaluation: Option<RubricEvaluation>,
    pub status: SnapshotStatus,
    pub created_at: DateTime<Utc>,
    /// Lease owner; `None` once a terminal status is reached.
    pub server_node_id: Option<ServerNodeId>,
    pub last_heartbeat_at: DateTime<Utc>,
}

impl Snapshot {
    /// Project a snapshot from live state. Terminal statuses clear the lease.
    pub fn from_state(
        tenant_id: TenantId,
        state: &WorkflowState,
        status: SnapshotStatus,
        server_node_id: ServerNodeId,
    ) -> Self {
        Self {
            tenant_id,
            workflow_id: state.workflow_id.clone(),
            execution_id: state.execution_id,
            current_node_id: Some(state.current_node.clone()),
            context: state.context.clone(),
            active_plan: state.active_plan.clone(),
            rubric_evaluation: state.rubric_evaluation.clone(),
            status,
            created_at: Utc::now(),
            server_node_id: if status.is_terminal() {
                None
            } else {
                Some(server_node_id)
            },
            last_heartbeat_at: Utc::now(),
        }
    }

    /// Reconstruct runtime state for resume. History does not survive the
    /// snapshot boundary; resumed executions start a fresh history.
    pub fn to_state(&self) -> WorkflowState {
        WorkflowState {
            execution_id: self.execution_id,
            workflow_id: self.workflow_id.clone(),
            current_node: self.current_node_id.clone().unwrap_or_default(),
            context: self.context.clone(),
            history: Vec::new(),
            rubric_evaluation: self.rubric_evaluation.clone(),
            loop_break_target: None,
            active_plan: self.active_plan.clone(),
        }
    }
}

// ============================================================================
// Execution Results
// ============================================================================

/// Terminal outcome of a traversal. Always one of these four variants (P1).
#[derive(Debug)]
pub enum ExecutionResult {
    Completed {
        state: Box<WorkflowState>,
        exit_status: ExitStatus,
    },
    Paused {
        state: Box<WorkflowState>,
    },
    Rejected {
        reason: String,
        state: Box<WorkflowState>,
    },
    Failure {
        state: Box<WorkflowState>,
        error: crate::domain::error::EngineError,
    },
}

impl ExecutionResult {
    pub fn state(&self) -> &WorkflowState {
        match self {
            ExecutionResult::Completed { state, .. }
            | ExecutionResult::Paused { state }
            | ExecutionResult::Rejected { state, .. }
            | ExecutionResult::Failure { state, .. } => state,
        }
    }

    pub fn snapshot_status(&self) -> SnapshotStatus {
        match self {
            ExecutionResult::Completed { .. } => SnapshotStatus::Completed,
            ExecutionResult::Paused { .. } => SnapshotStatus::Paused,
            ExecutionResult::Rejected { .. } => SnapshotStatus::Rejected,
            ExecutionResult::Failure { .. } => SnapshotStatus::Failed,
        }
    }
}
