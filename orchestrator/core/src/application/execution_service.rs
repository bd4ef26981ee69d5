// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! Execution Service
//!
//! Public entry point for running workflows: accepts start/resume requests,
//! dispatches each execution onto the runtime as its own task, publishes
//! lifecycle events on the bus, and projects the user-visible context for
//! API consumers. One task per execution — blocking on a remote response in
//! one execution never stalls another.

use dashmap::DashMap;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::application::context::Collaborators;
use crate::application::executor::WorkflowExecutor;
use crate::domain::error::EngineError;
use crate::domain::events::ExecutionEvent;
use crate::domain::plan::ResumeDecision;
use crate::domain::state::{
    keys, ExecutionId, ExecutionResult, Snapshot, SnapshotStatus, WorkflowState,
};
use crate::domain::tenant::TenantId;
use crate::domain::workflow::Workflow;
use crate::infrastructure::event_bus::{
    BroadcastListener, EventBus, EventReceiver, ExecutionEventReceiver,
};

pub struct StartExecutionRequest {
    pub tenant_id: TenantId,
    pub workflow_id: String,
    pub initial_context: HashMap<String, Value>,
}

pub struct ExecutionService {
    services: Arc<Collaborators>,
    bus: EventBus,
    running: DashMap<ExecutionId, JoinHandle<ExecutionResult>>,
}

impl ExecutionService {
    pub fn new(services: Arc<Collaborators>, bus: EventBus) -> Arc<Self> {
        Arc::new(Self {
            services,
            bus,
            running: DashMap::new(),
        })
    }

    pub fn event_bus(&self) -> &EventBus {
        &self.bus
    }

    pub fn subscribe(&self) -> EventReceiver {
        self.bus.subscribe()
    }

    pub fn subscribe_execution(&self, execution_id: ExecutionId) -> ExecutionEventReceiver {
        self.bus.subscribe_execution(execution_id)
    }

    /// Accept a start request and dispatch the execution asynchronously.
    /// Returns the execution id immediately.
    pub async fn start(
        self: &Arc<Self>,
        request: StartExecutionRequest,
    ) -> Result<ExecutionId, EngineError> {
        let workflow = self
            .services
            .workflows
            .find_by_id(&request.tenant_id, &request.workflow_id)
            .await?
            .ok_or_else(|| {
                EngineError::IllegalState(format!(
                    "workflow '{}' not found for tenant {}",
                    request.workflow_id, request.tenant_id
                ))
            })?;

        let mut state = WorkflowState::new(&workflow.workflow_id, &workflow.start_node);
        state.context = request.initial_context;
        let execution_id = state.execution_id;

        info!(
            execution_id = %execution_id,
            tenant_id = %request.tenant_id,
            workflow_id = %request.workflow_id,
            "accepted execution request"
        );

        self.dispatch(Arc::new(workflow), state);
        Ok(execution_id)
    }

    /// Resume a paused execution, optionally carrying a plan-review decision.
    pub async fn resume(
        self: &Arc<Self>,
        tenant_id: &TenantId,
        execution_id: ExecutionId,
        decision: Option<ResumeDecision>,
    ) -> Result<(), EngineError> {
        let snapshot = self
            .services
            .states
            .find_by_execution_id(tenant_id, execution_id)
            .await?
            .ok_or_else(|| {
                EngineError::IllegalState(format!("no snapshot for execution {execution_id}"))
            })?;

        if snapshot.status != SnapshotStatus::Paused {
            return Err(EngineError::IllegalState(format!(
                "execution {execution_id} is {:?}, not paused",
                snapshot.status
            )));
        }

        let workflow = self
            .services
            .workflows
            .find_by_id(tenant_id, &snapshot.workflow_id)
            .await?
            .ok_or_else(|| {
                EngineError::IllegalState(format!(
                    "workflow '{}' vanished for tenant {tenant_id}",
                    snapshot.workflow_id
                ))
            })?;

        let mut state = snapshot.to_state();
        if let Some(decision) = decision {
            state.set(
                keys::PLAN_RESUME_DECISION,
                serde_json::to_value(&decision)
                    .map_err(|e| EngineError::IllegalState(e.to_string()))?,
            );
        }

        info!(execution_id = %execution_id, node = %state.current_node, "resuming paused execution");
        self.dispatch(Arc::new(workflow), state);
        Ok(())
    }

    /// Resume an execution claimed by the recovery sweeper.
    pub async fn resume_claimed(self: &Arc<Self>, snapshot: Snapshot) -> Result<(), EngineError> {
        let workflow = self
            .services
            .workflows
            .find_by_id(&snapshot.tenant_id, &snapshot.workflow_id)
            .await?
            .ok_or_else(|| {
                EngineError::IllegalState(format!(
                    "claimed execution {} references unknown workflow '{}'",
                    snapshot.execution_id, snapshot.workflow_id
                ))
            })?;

        info!(
            execution_id = %snapshot.execution_id,
            node = snapshot.current_node_id.as_deref().unwrap_or("-"),
            "resuming claimed execution"
        );
        self.dispatch(Arc::new(workflow), snapshot.to_state());
        Ok(())
    }

    /// User-visible projection of a persisted execution context: every key
    /// starting with `_` is stripped, unconditionally.
    pub async fn public_context(
        &self,
        tenant_id: &TenantId,
        execution_id: ExecutionId,
    ) -> Result<HashMap<String, Value>, EngineError> {
        let snapshot = self
            .services
            .states
            .find_by_execution_id(tenant_id, execution_id)
            .await?
            .ok_or_else(|| {
                EngineError::IllegalState(format!("no snapshot for execution {execution_id}"))
            })?;

        Ok(snapshot
            .context
            .into_iter()
            .filter(|(k, _)| !k.starts_with('_'))
            .collect())
    }

    /// Await a dispatched execution's terminal result (test and admin hook).
    pub async fn wait(&self, execution_id: ExecutionId) -> Option<ExecutionResult> {
        let (_, handle) = self.running.remove(&execution_id)?;
        handle.await.ok()
    }

    pub fn running_count(&self) -> usize {
        self.running.len()
    }

    fn dispatch(self: &Arc<Self>, workflow: Arc<Workflow>, state: WorkflowState) {
        let execution_id = state.execution_id;
        let service = Arc::clone(self);

        self.bus.publish(ExecutionEvent::ExecutionStarted {
            execution_id,
            workflow_id: workflow.workflow_id.clone(),
            started_at: chrono::Utc::now(),
        });

        // Housekeeping: drop handles of executions nobody waited on.
        self.running.retain(|_, handle| !handle.is_finished());

        let handle = tokio::spawn(async move {
            let listener = Arc::new(BroadcastListener::new(service.bus.clone()));
            let executor = WorkflowExecutor::new(service.services.clone());
            let result = executor.execute_from(workflow, state, listener).await;
            service.publish_terminal(execution_id, &result);
            result
        });

        self.running.insert(execution_id, handle);
    }

    fn publish_terminal(&self, execution_id: ExecutionId, result: &ExecutionResult) {
        match result {
            ExecutionResult::Completed { exit_status, .. } => {
                self.bus.publish(ExecutionEvent::ExecutionCompleted {
                    execution_id,
                    exit_status: *exit_status,
                    completed_at: chrono::Utc::now(),
                });
            }
            ExecutionResult::Paused { state } => {
                self.bus.publish(ExecutionEvent::ExecutionPaused {
                    execution_id,
                    node_id: state.current_node.clone(),
                });
            }
            ExecutionResult::Rejected { reason, .. } => {
                self.bus.publish(ExecutionEvent::ExecutionRejected {
                    execution_id,
                    reason: reason.clone(),
                });
            }
            ExecutionResult::Failure { state, error } => {
                warn!(execution_id = %execution_id, error = %error, "execution ended in failure");
                self.bus.publish(ExecutionEvent::ExecutionError {
                    execution_id,
                    error_type: error.error_type().to_string(),
                    message: error.to_string(),
                    node_id: Some(state.current_node.clone()),
                });
            }
        }
    }
}

impl StartExecutionRequest {
    pub fn new(tenant_id: impl Into<String>, workflow_id: impl Into<String>) -> Self {
        Self {
            tenant_id: TenantId::new(tenant_id),
            workflow_id: workflow_id.into(),
            initial_context: HashMap::new(),
        }
    }

    pub fn with_context(mut self, key: impl Into<String>, value: Value) -> Self {
        self.initial_context.insert(key.into(), value);
        self
    }

    pub fn with_input(mut self, input: impl Into<String>) -> Self {
        self.initial_context.insert("input".into(), json!(input.into()));
        self
    }
}
