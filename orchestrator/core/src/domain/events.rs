// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! Execution events and the listener contract.
//!
//! Listener callbacks fire on the traversal task, in traversal order, and must
//! not block — the stock adapter forwards them onto a bounded broadcast
//! channel so slow observers lag instead of backing up the engine.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;

use crate::domain::plan::PlanEvent;
use crate::domain::state::{BacktrackEvent, ExecutionId, NodeResult, Snapshot};
use crate::domain::workflow::ExitStatus;

/// Domain events published on the execution event stream.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ExecutionEvent {
    ExecutionStarted {
        execution_id: ExecutionId,
        workflow_id: String,
        started_at: DateTime<Utc>,
    },
    NodeStarted {
        execution_id: ExecutionId,
        node_id: String,
        node_kind: String,
    },
    NodeCompleted {
        execution_id: ExecutionId,
        node_id: String,
        result: NodeResult,
    },
    AgentStarted {
        execution_id: ExecutionId,
        agent_id: String,
        node_id: String,
    },
    AgentCompleted {
        execution_id: ExecutionId,
        agent_id: String,
        node_id: String,
    },
    PlannerStarted {
        execution_id: ExecutionId,
        node_id: String,
        prompt: String,
    },
    PlannerCompleted {
        execution_id: ExecutionId,
        node_id: String,
        step_count: usize,
    },
    Checkpoint {
        execution_id: ExecutionId,
        node_id: String,
    },
    Backtracked {
        execution_id: ExecutionId,
        event: BacktrackEvent,
    },
    Plan {
        execution_id: ExecutionId,
        event: PlanEvent,
    },
    ConsensusEvaluated {
        execution_id: ExecutionId,
        node_id: String,
        reached: bool,
        winning_branch_id: Option<String>,
    },
    ExecutionCompleted {
        execution_id: ExecutionId,
        exit_status: ExitStatus,
        completed_at: DateTime<Utc>,
    },
    ExecutionPaused {
        execution_id: ExecutionId,
        node_id: String,
    },
    ExecutionRejected {
        execution_id: ExecutionId,
        reason: String,
    },
    /// User-visible failure event per the error-handling contract.
    ExecutionError {
        execution_id: ExecutionId,
        error_type: String,
        message: String,
        #[serde(default)]
        node_id: Option<String>,
    },
}

/// Observer callbacks delivered in traversal order. All default to no-ops so
/// implementations override only what they need. Implementations must be safe
/// for concurrent invocation from branch tasks.
#[allow(unused_variables)]
pub trait ExecutionListener: Send + Sync {
    fn on_node_start(&self, execution_id: ExecutionId, node_id: &str, node_kind: &str) {}

    fn on_node_complete(&self, execution_id: ExecutionId, node_id: &str, result: &NodeResult) {}

    fn on_agent_start(&self, execution_id: ExecutionId, node_id: &str, agent_id: &str) {}

    fn on_agent_complete(&self, execution_id: ExecutionId, node_id: &str, agent_id: &str) {}

    fn on_planner_start(&self, execution_id: ExecutionId, node_id: &str, prompt: &str) {}

    fn on_planner_complete(&self, execution_id: ExecutionId, node_id: &str, step_count: usize) {}

    fn on_checkpoint(&self, snapshot: &Snapshot) {}

    fn on_backtrack(&self, execution_id: ExecutionId, event: &BacktrackEvent) {}

    fn on_plan_event(&self, execution_id: ExecutionId, event: &PlanEvent) {}

    fn on_consensus(
        &self,
        execution_id: ExecutionId,
        node_id: &str,
        reached: bool,
        metadata: &HashMap<String, Value>,
    ) {
    }
}

/// Listener that ignores everything.
pub struct NoopListener;

impl ExecutionListener for NoopListener {}
