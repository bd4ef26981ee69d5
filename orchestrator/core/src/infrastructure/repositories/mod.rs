// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Repository Implementations
//!
//! Infrastructure implementations of the tenant-scoped repository traits from
//! the domain layer.
//!
//! # Available Implementations
//!
//! - **PostgresWorkflowRepository / PostgresWorkflowStateRepository** —
//!   production persistence; definitions and snapshots stored as JSONB with
//!   lease columns on the snapshot row.
//! - **InMemoryWorkflowRepository / InMemoryWorkflowStateRepository** —
//!   lock-guarded HashMaps for development and tests. The lease
//!   compare-and-set happens under a single mutex guard, matching the
//!   atomicity the Postgres conditional UPDATE provides.

pub mod postgres;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use crate::domain::repository::{RepositoryError, WorkflowRepository, WorkflowStateRepository};
use crate::domain::state::{ExecutionId, ServerNodeId, Snapshot, SnapshotStatus};
use crate::domain::tenant::TenantId;
use crate::domain::workflow::Workflow;

pub use postgres::{PostgresWorkflowRepository, PostgresWorkflowStateRepository};

// ============================================================================
// In-Memory Workflow Repository
// ============================================================================

#[derive(Clone, Default)]
pub struct InMemoryWorkflowRepository {
    workflows: Arc<Mutex<HashMap<(TenantId, String), Workflow>>>,
}

impl InMemoryWorkflowRepository {
    pub fn new() -> Self {
        Self {
            workflows: Arc::new(Mutex::new(HashMap::new())),
        }
    }
}

#[async_trait]
impl WorkflowRepository for InMemoryWorkflowRepository {
    async fn save(&self, tenant_id: &TenantId, workflow: &Workflow) -> Result<(), RepositoryError> {
        let mut workflows = self.workflows.lock().unwrap();
        workflows.insert(
            (tenant_id.clone(), workflow.workflow_id.clone()),
            workflow.clone(),
        );
        Ok(())
    }

    async fn find_by_id(
        &self,
        tenant_id: &TenantId,
        workflow_id: &str,
    ) -> Result<Option<Workflow>, RepositoryError> {
        let workflows = self.workflows.lock().unwrap();
        Ok(workflows
            .get(&(tenant_id.clone(), workflow_id.to_string()))
            .cloned())
    }

    async fn find_all(&self, tenant_id: &TenantId) -> Result<Vec<Workflow>, RepositoryError> {
        let workflows = self.workflows.lock().unwrap();
        Ok(workflows
            .iter()
            .filter(|((t, _), _)| t == tenant_id)
            .map(|(_, w)| w.clone())
            .collect())
    }

    async fn exists(
        &self,
        tenant_id: &TenantId,
        workflow_id: &str,
    ) -> Result<bool, RepositoryError> {
        let workflows = self.workflows.lock().unwrap();
        Ok(workflows.contains_key(&(tenant_id.clone(), workflow_id.to_string())))
    }

    async fn delete(
        &self,
        tenant_id: &TenantId,
        workflow_id: &str,
    ) -> Result<bool, RepositoryError> {
        let mut workflows = self.workflows.lock().unwrap();
        Ok(workflows
            .remove(&(tenant_id.clone(), workflow_id.to_string()))
            .is_some())
    }
}

// ============================================================================
// In-Memory Workflow State Repository
// ============================================================================

#[derive(Clone, Default)]
pub struct InMemoryWorkflowStateRepository {
    snapshots: Arc<Mutex<HashMap<(TenantId, ExecutionId), Snapshot>>>,
}

impl InMemoryWorkflowStateRepository {
    pub fn new() -> Self {
        Self {
            snapshots: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Test hook: age a snapshot's heartbeat to simulate a halted owner.
    pub fn age_heartbeat(
        &self,
        tenant_id: &TenantId,
        execution_id: ExecutionId,
        to: DateTime<Utc>,
    ) {
        let mut snapshots = self.snapshots.lock().unwrap();
        if let Some(snapshot) = snapshots.get_mut(&(tenant_id.clone(), execution_id)) {
            snapshot.last_heartbeat_at = to;
        }
    }
}

#[async_trait]
impl WorkflowStateRepository for InMemoryWorkflowStateRepository {
    async fn save(&self, tenant_id: &TenantId, snapshot: &Snapshot) -> Result<(), RepositoryError> {
        let mut snapshots = self.snapshots.lock().unwrap();
        let key = (tenant_id.clone(), snapshot.execution_id);

        // A non-terminal row owned by another live node must not be stomped:
        // the stale owner observes the changed lease and aborts.
        if let (Some(stored), Some(incoming)) = (snapshots.get(&key), snapshot.server_node_id) {
            if !stored.status.is_terminal() {
                if let Some(owner) = stored.server_node_id {
                    if owner != incoming {
                        return Err(RepositoryError::LeaseConflict {
                            execution_id: snapshot.execution_id,
                            owner,
                        });
                    }
                }
            }
        }

        snapshots.insert(key, snapshot.clone());
        Ok(())
    }

    async fn find_by_execution_id(
        &self,
        tenant_id: &TenantId,
        execution_id: ExecutionId,
    ) -> Result<Option<Snapshot>, RepositoryError> {
        let snapshots = self.snapshots.lock().unwrap();
        Ok(snapshots.get(&(tenant_id.clone(), execution_id)).cloned())
    }

    async fn find_paused(&self, tenant_id: &TenantId) -> Result<Vec<Snapshot>, RepositoryError> {
        let snapshots = self.snapshots.lock().unwrap();
        Ok(snapshots
            .iter()
            .filter(|((t, _), s)| t == tenant_id && s.status == SnapshotStatus::Paused)
            .map(|(_, s)| s.clone())
            .collect())
    }

    async fn update_heartbeats(
        &self,
        server_node_id: ServerNodeId,
    ) -> Result<u64, RepositoryError> {
        let mut snapshots = self.snapshots.lock().unwrap();
        let now = Utc::now();
        let mut touched = 0;
        for snapshot in snapshots.values_mut() {
            if !snapshot.status.is_terminal() && snapshot.server_node_id == Some(server_node_id) {
                snapshot.last_heartbeat_at = now;
                touched += 1;
            }
        }
        Ok(touched)
    }

    async fn claim_stale_executions(
        &self,
        server_node_id: ServerNodeId,
        stale_before: DateTime<Utc>,
    ) -> Result<Vec<Snapshot>, RepositoryError> {
        // One guard for the whole scan: predicate re-evaluation and the
        // ownership write are a single atomic step, so concurrent sweepers
        // cannot both claim the same row.
        let mut snapshots = self.snapshots.lock().unwrap();
        let now = Utc::now();
        let mut claimed = Vec::new();
        for snapshot in snapshots.values_mut() {
            if !snapshot.status.is_terminal()
                && snapshot.last_heartbeat_at < stale_before
                && snapshot.server_node_id != Some(server_node_id)
            {
                snapshot.server_node_id = Some(server_node_id);
                snapshot.last_heartbeat_at = now;
                claimed.push(snapshot.clone());
            }
        }
        Ok(claimed)
    }
}
