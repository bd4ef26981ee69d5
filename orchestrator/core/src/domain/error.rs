// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! Engine error taxonomy.
//!
//! Errors raised inside a node executor surface as `NodeResult::failure` and
//! flow through the node's `Failure` transition rules. Errors raised by the
//! traversal loop itself (missing node, no valid transition) are fatal for the
//! execution and produce `ExecutionResult::Failure` plus a terminal snapshot.

use thiserror::Error;

use crate::domain::repository::RepositoryError;

#[derive(Debug, Error)]
pub enum EngineError {
    /// `state.current_node` does not exist in the workflow's node map (fatal).
    #[error("node '{0}' not found in workflow")]
    NodeMissing(String),

    /// No transition rule yielded a target on a non-End node (fatal).
    #[error("no valid transition from node '{0}'")]
    NoValidTransition(String),

    /// A `Generic` node named an executor type nobody registered (fatal).
    #[error("no node executor registered for type '{0}'")]
    NodeExecutorNotFound(String),

    #[error("agent '{0}' not registered and no factory could build it")]
    AgentNotFound(String),

    /// Static plan unset, planner rejected, or planning disabled on the
    /// dynamic path. Routes via `plan_failure_target` when the node has one.
    #[error("plan creation failed: {0}")]
    PlanCreation(String),

    #[error("plan revision failed: {0}")]
    PlanRevision(String),

    /// Remote JSON-RPC error object in a tool response.
    #[error("json-rpc error {code}: {message}")]
    JsonRpc { code: i64, message: String },

    /// Plan step, join await, or JSON-RPC request exceeded its deadline.
    #[error("timeout waiting for {0}")]
    Timeout(String),

    /// JSON-RPC target client has no live emitter.
    #[error("client '{0}' is not connected")]
    NotConnected(String),

    /// Agent output failed sanitization (control characters, bidi overrides,
    /// or oversized payload).
    #[error("output validation failed: {0}")]
    OutputValidation(String),

    #[error("sub-workflow error: {0}")]
    SubWorkflow(String),

    #[error("action handler '{0}' not registered")]
    ActionHandlerNotFound(String),

    #[error("command '{0}' not registered")]
    CommandNotFound(String),

    /// Another orchestrator instance claimed this execution's lease; the
    /// original owner must stop without further writes.
    #[error("lease lost for execution {0}")]
    LeaseLost(String),

    #[error("review failed: {0}")]
    Review(String),

    #[error("rubric evaluation failed: {0}")]
    Rubric(String),

    #[error("agent call failed: {0}")]
    Agent(String),

    #[error(transparent)]
    Repository(#[from] RepositoryError),

    #[error("illegal state: {0}")]
    IllegalState(String),
}

impl EngineError {
    /// Stable machine-readable discriminant for event payloads.
    pub fn error_type(&self) -> &'static str {
        match self {
            Self::NodeMissing(_) => "node_missing",
            Self::NoValidTransition(_) => "no_valid_transition",
            Self::NodeExecutorNotFound(_) => "node_executor_not_found",
            Self::AgentNotFound(_) => "agent_not_found",
            Self::PlanCreation(_) => "plan_creation",
            Self::PlanRevision(_) => "plan_revision",
            Self::JsonRpc { .. } => "json_rpc",
            Self::Timeout(_) => "timeout",
            Self::NotConnected(_) => "not_connected",
            Self::OutputValidation(_) => "output_validation",
            Self::SubWorkflow(_) => "sub_workflow",
            Self::ActionHandlerNotFound(_) => "action_handler_not_found",
            Self::CommandNotFound(_) => "command_not_found",
            Self::LeaseLost(_) => "lease_lost",
            Self::Review(_) => "review",
            Self::Rubric(_) => "rubric",
            Self::Agent(_) => "agent",
            Self::Repository(_) => "repository",
            Self::IllegalState(_) => "illegal_state",
        }
    }
}
