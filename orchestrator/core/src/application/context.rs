// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! Execution context and collaborator wiring.
//!
//! [`Collaborators`] is the immutable bundle of engine dependencies shared by
//! every execution; [`ExecutionContext`] adds the per-execution mutable state
//! (workflow state, fork handles, retry counters) and is single-owner: one
//! logical task drives one context for the execution's whole lifetime.

use async_trait::async_trait;
use dashmap::DashMap;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::task::JoinHandle;

use crate::domain::agent::{AgentFactory, AgentRegistry};
use crate::domain::error::EngineError;
use crate::domain::events::{ExecutionListener, NoopListener};
use crate::domain::handlers::{
    ActionHandlerRegistry, AlwaysApproveReviewHandler, CommandRegistry, GenericNodeHandler,
    Planner, ReviewHandler, TemplateResolver, ToolDescriptor, ToolExecutor, ToolRegistry,
};
use crate::domain::repository::{WorkflowRepository, WorkflowStateRepository};
use crate::domain::rubric::RubricEngine;
use crate::domain::state::{ServerNodeId, WorkflowState};
use crate::domain::tenant::TenantId;
use crate::domain::workflow::Workflow;
use crate::infrastructure::config::EngineConfig;
use crate::infrastructure::template::BraceTemplateResolver;
use crate::infrastructure::tools::InMemoryToolRegistry;

// ============================================================================
// Collaborators
// ============================================================================

/// Immutable dependency bundle. One instance serves every execution in the
/// process; all members are safe for concurrent use.
pub struct Collaborators {
    pub workflows: Arc<dyn WorkflowRepository>,
    pub states: Arc<dyn WorkflowStateRepository>,
    pub agents: Arc<AgentRegistry>,
    pub agent_factory: Option<Arc<dyn AgentFactory>>,
    pub planner: Option<Arc<dyn Planner>>,
    pub tool_registry: Arc<dyn ToolRegistry>,
    pub tool_executor: Arc<dyn ToolExecutor>,
    pub templates: Arc<dyn TemplateResolver>,
    pub rubric_engine: Option<Arc<dyn RubricEngine>>,
    pub review_handler: Arc<dyn ReviewHandler>,
    pub action_handlers: Arc<ActionHandlerRegistry>,
    pub commands: Arc<CommandRegistry>,
    pub generic_handlers: DashMap<String, Arc<dyn GenericNodeHandler>>,
    pub config: EngineConfig,
    pub server_node_id: ServerNodeId,
}

impl Collaborators {
    pub fn new(
        workflows: Arc<dyn WorkflowRepository>,
        states: Arc<dyn WorkflowStateRepository>,
    ) -> Self {
        Self {
            workflows,
            states,
            agents: Arc::new(AgentRegistry::new()),
            agent_factory: None,
            planner: None,
            tool_registry: Arc::new(InMemoryToolRegistry::new()),
            tool_executor: Arc::new(UnconfiguredToolExecutor),
            templates: Arc::new(BraceTemplateResolver::new()),
            rubric_engine: None,
            review_handler: Arc::new(AlwaysApproveReviewHandler),
            action_handlers: Arc::new(ActionHandlerRegistry::new()),
            commands: Arc::new(CommandRegistry::new()),
            generic_handlers: DashMap::new(),
            config: EngineConfig::default(),
            server_node_id: ServerNodeId::new(),
        }
    }

    pub fn with_agents(mut self, agents: Arc<AgentRegistry>) -> Self {
        self.agents = agents;
        self
    }

    pub fn with_agent_factory(mut self, factory: Arc<dyn AgentFactory>) -> Self {
        self.agent_factory = Some(factory);
        self
    }

    pub fn with_planner(mut self, planner: Arc<dyn Planner>) -> Self {
        self.planner = Some(planner);
        self
    }

    pub fn with_tool_registry(mut self, registry: Arc<dyn ToolRegistry>) -> Self {
        self.tool_registry = registry;
        self
    }

    pub fn with_tool_executor(mut self, executor: Arc<dyn ToolExecutor>) -> Self {
        self.tool_executor = executor;
        self
    }

    pub fn with_rubric_engine(mut self, engine: Arc<dyn RubricEngine>) -> Self {
        self.rubric_engine = Some(engine);
        self
    }

    pub fn with_review_handler(mut self, handler: Arc<dyn ReviewHandler>) -> Self {
        self.review_handler = handler;
        self
    }

    pub fn with_config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_server_node_id(mut self, server_node_id: ServerNodeId) -> Self {
        self.server_node_id = server_node_id;
        self
    }

    pub fn register_generic_handler(
        &self,
        executor_type: impl Into<String>,
        handler: Arc<dyn GenericNodeHandler>,
    ) {
        self.generic_handlers.insert(executor_type.into(), handler);
    }
}

/// Placeholder wired by default; surfaces a configuration error instead of
/// silently succeeding when a workflow reaches for tools.
struct UnconfiguredToolExecutor;

#[async_trait]
impl ToolExecutor for UnconfiguredToolExecutor {
    async fn execute_tool(
        &self,
        _tenant_id: &TenantId,
        tool_name: &str,
        _arguments: &Value,
    ) -> Result<Value, EngineError> {
        Err(EngineError::PlanCreation(format!(
            "no tool executor configured (requested tool '{tool_name}')"
        )))
    }
}

// ============================================================================
// Fork Bookkeeping
// ============================================================================

/// Outcome of one fork child execution.
#[derive(Debug, Clone)]
pub struct ForkResult {
    pub target: String,
    pub output: Option<Value>,
    pub error: Option<String>,
    pub duration_ms: u64,
}

impl ForkResult {
    pub fn success(target: impl Into<String>, output: Option<Value>, duration_ms: u64) -> Self {
        Self {
            target: target.into(),
            output,
            error: None,
            duration_ms,
        }
    }

    pub fn failure(target: impl Into<String>, error: impl Into<String>, duration_ms: u64) -> Self {
        Self {
            target: target.into(),
            output: None,
            error: Some(error.into()),
            duration_ms,
        }
    }

    pub fn is_success(&self) -> bool {
        self.error.is_none()
    }
}

/// In-flight fork children for one fork node, in target declaration order.
pub struct ForkContext {
    pub handles: Vec<(String, JoinHandle<ForkResult>)>,
}

// ============================================================================
// Execution Context
// ============================================================================

/// Per-execution mutable bundle. Not shared across tasks; fork children get
/// branched state clones, never references into this context.
pub struct ExecutionContext {
    pub tenant_id: TenantId,
    pub workflow: Arc<Workflow>,
    pub state: WorkflowState,
    pub services: Arc<Collaborators>,
    pub listener: Arc<dyn ExecutionListener>,
    /// fork node id → spawned children awaiting a `Join`.
    pub fork_contexts: HashMap<String, ForkContext>,
    /// Per-node failure retry counters consumed by `Failure` rules.
    pub retry_counts: HashMap<String, u32>,
    /// Sub-workflow nesting depth, bounded to stop runaway recursion.
    pub depth: u32,
}

/// Hard cap on sub-workflow nesting.
pub const MAX_SUBWORKFLOW_DEPTH: u32 = 8;

impl ExecutionContext {
    pub fn new(
        workflow: Arc<Workflow>,
        state: WorkflowState,
        services: Arc<Collaborators>,
        listener: Arc<dyn ExecutionListener>,
    ) -> Self {
        let tenant_id = workflow.tenant_id.clone();
        Self {
            tenant_id,
            workflow,
            state,
            services,
            listener,
            fork_contexts: HashMap::new(),
            retry_counts: HashMap::new(),
            depth: 0,
        }
    }

    pub fn noop_listener() -> Arc<dyn ExecutionListener> {
        Arc::new(NoopListener)
    }

    /// Resolve a prompt template, honoring a `_prompt_override_<node>` key.
    pub fn resolve_prompt(&self, node_id: &str, template: Option<&str>) -> String {
        let override_key = crate::domain::state::keys::prompt_override(node_id);
        let template = match self.state.get_str(&override_key) {
            Some(overridden) => overridden.to_string(),
            None => template.unwrap_or_default().to_string(),
        };
        self.services.templates.resolve(&template, &self.state.context)
    }

    /// Tools visible to this execution's tenant.
    pub fn available_tools(&self) -> Vec<ToolDescriptor> {
        self.services.tool_registry.list_tools(&self.tenant_id)
    }
}
