// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! External collaborator contracts.
//!
//! Everything side-effectful escapes the engine through one of these traits:
//! action handlers, review handlers, planners, tool execution, and template
//! resolution. Handlers are registered by id and must be safe for concurrent
//! calls — one handler instance may serve many executions at once.

use async_trait::async_trait;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;

use crate::domain::error::EngineError;
use crate::domain::plan::{Plan, PlanConstraints, RevisionContext};
use crate::domain::state::{HistoryEntry, NodeResult, WorkflowState};
use crate::domain::tenant::TenantId;
use crate::domain::workflow::{Node, ReviewConfig, Workflow};

// ============================================================================
// Actions & Commands
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActionResult {
    pub success: bool,
    pub message: String,
    #[serde(default)]
    pub data: Option<Value>,
    #[serde(default)]
    pub error: Option<String>,
}

impl ActionResult {
    pub fn ok(message: impl Into<String>) -> Self {
        Self {
            success: true,
            message: message.into(),
            data: None,
            error: None,
        }
    }

    pub fn failed(error: impl Into<String>) -> Self {
        let error = error.into();
        Self {
            success: false,
            message: error.clone(),
            data: None,
            error: Some(error),
        }
    }
}

#[async_trait]
pub trait ActionHandler: Send + Sync {
    fn handler_id(&self) -> &str;

    async fn execute(
        &self,
        payload: &Value,
        context: &HashMap<String, Value>,
    ) -> Result<ActionResult, EngineError>;
}

/// Registry of `Send` action handlers, keyed by handler id.
#[derive(Default)]
pub struct ActionHandlerRegistry {
    handlers: DashMap<String, Arc<dyn ActionHandler>>,
}

impl ActionHandlerRegistry {
    pub fn new() -> Self {
        Self {
            handlers: DashMap::new(),
        }
    }

    pub fn register(&self, handler: Arc<dyn ActionHandler>) {
        self.handlers.insert(handler.handler_id().to_string(), handler);
    }

    pub fn get(&self, handler_id: &str) -> Option<Arc<dyn ActionHandler>> {
        self.handlers.get(handler_id).map(|e| e.value().clone())
    }
}

/// Commands runnable from `Execute(command_id)` actions. Populated at wiring
/// time only; workflow text can never introduce a new command.
#[derive(Default)]
pub struct CommandRegistry {
    commands: DashMap<String, Arc<dyn ActionHandler>>,
}

impl CommandRegistry {
    pub fn new() -> Self {
        Self {
            commands: DashMap::new(),
        }
    }

    pub fn register(&self, command_id: impl Into<String>, handler: Arc<dyn ActionHandler>) {
        self.commands.insert(command_id.into(), handler);
    }

    pub fn get(&self, command_id: &str) -> Option<Arc<dyn ActionHandler>> {
        self.commands.get(command_id).map(|e| e.value().clone())
    }
}

// ============================================================================
// Review
// ============================================================================

/// Decision returned by a review handler.
#[derive(Debug, Clone)]
pub enum ReviewDecision {
    Approve {
        edited_state: Option<WorkflowState>,
    },
    Backtrack {
        target_step: String,
        edited_state: Option<WorkflowState>,
        edited_prompt: Option<String>,
        reason: String,
    },
    Reject {
        reason: String,
    },
}

#[async_trait]
pub trait ReviewHandler: Send + Sync {
    #[allow(clippy::too_many_arguments)]
    async fn request_review(
        &self,
        node_id: &str,
        node: &Node,
        result: &NodeResult,
        state: &WorkflowState,
        history: &[HistoryEntry],
        config: &ReviewConfig,
        workflow: &Workflow,
    ) -> Result<ReviewDecision, EngineError>;
}

/// Default review handler: approves everything untouched.
pub struct AlwaysApproveReviewHandler;

#[async_trait]
impl ReviewHandler for AlwaysApproveReviewHandler {
    async fn request_review(
        &self,
        _node_id: &str,
        _node: &Node,
        _result: &NodeResult,
        _state: &WorkflowState,
        _history: &[HistoryEntry],
        _config: &ReviewConfig,
        _workflow: &Workflow,
    ) -> Result<ReviewDecision, EngineError> {
        Ok(ReviewDecision::Approve { edited_state: None })
    }
}

// ============================================================================
// Planning & Tools
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolDescriptor {
    pub name: String,
    #[serde(default)]
    pub description: String,
    /// JSON-RPC client that serves this tool.
    pub client_id: String,
}

/// Tenant-scoped tool catalog consulted by the dynamic planner.
pub trait ToolRegistry: Send + Sync {
    fn list_tools(&self, tenant_id: &TenantId) -> Vec<ToolDescriptor>;

    fn find_tool(&self, tenant_id: &TenantId, tool_name: &str) -> Option<ToolDescriptor>;
}

#[derive(Debug, Clone)]
pub struct PlanRequest {
    pub node_id: String,
    pub prompt: String,
    pub tools: Vec<ToolDescriptor>,
    pub context: HashMap<String, Value>,
    pub constraints: PlanConstraints,
}

#[async_trait]
pub trait Planner: Send + Sync {
    async fn create_plan(&self, request: PlanRequest) -> Result<Plan, EngineError>;

    async fn revise_plan(
        &self,
        plan: &Plan,
        revision: RevisionContext,
    ) -> Result<Plan, EngineError>;
}

/// Executes a single plan-step tool call. The production implementation
/// routes through the JSON-RPC session manager; tests use in-process fakes.
#[async_trait]
pub trait ToolExecutor: Send + Sync {
    async fn execute_tool(
        &self,
        tenant_id: &TenantId,
        tool_name: &str,
        arguments: &Value,
    ) -> Result<Value, EngineError>;
}

/// Handler backing a `Generic` node, looked up by `executor_type`. Receives
/// the node's config dictionary plus a read-only view of the context; output
/// flows back through the returned [`NodeResult`].
#[async_trait]
pub trait GenericNodeHandler: Send + Sync {
    async fn execute(
        &self,
        node_id: &str,
        config: &HashMap<String, Value>,
        context: &HashMap<String, Value>,
    ) -> Result<NodeResult, EngineError>;
}

// ============================================================================
// Templates
// ============================================================================

/// Resolves `{name}` placeholders against the runtime context. Unresolved
/// placeholders stay literal.
pub trait TemplateResolver: Send + Sync {
    fn resolve(&self, template: &str, context: &HashMap<String, Value>) -> String;
}
