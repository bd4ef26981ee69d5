// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

// Repository Pattern - Storage Backend Abstraction
//
// Tenant-scoped persistence contracts for workflow definitions and state
// snapshots. In-memory and Postgres implementations are interchangeable; the
// engine only ever sees these traits. Lease bookkeeping (heartbeats, stale
// claims) lives on the snapshot repository because leases are columns of the
// snapshot row.

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::domain::state::{ExecutionId, ServerNodeId, Snapshot};
use crate::domain::tenant::TenantId;
use crate::domain::workflow::Workflow;

/// Repository interface for workflow definitions.
#[async_trait]
pub trait WorkflowRepository: Send + Sync {
    async fn save(&self, tenant_id: &TenantId, workflow: &Workflow) -> Result<(), RepositoryError>;

    async fn find_by_id(
        &self,
        tenant_id: &TenantId,
        workflow_id: &str,
    ) -> Result<Option<Workflow>, RepositoryError>;

    async fn find_all(&self, tenant_id: &TenantId) -> Result<Vec<Workflow>, RepositoryError>;

    async fn exists(&self, tenant_id: &TenantId, workflow_id: &str)
        -> Result<bool, RepositoryError>;

    async fn delete(
        &self,
        tenant_id: &TenantId,
        workflow_id: &str,
    ) -> Result<bool, RepositoryError>;
}

/// Repository interface for execution state snapshots, including the lease
/// operations used by the heartbeat and recovery jobs.
#[async_trait]
pub trait WorkflowStateRepository: Send + Sync {
    /// Persist a snapshot. Implementations must reject the write with
    /// [`RepositoryError::LeaseConflict`] when the stored row is non-terminal
    /// and owned by a different server node — a stale owner must never stomp
    /// a claimed execution.
    async fn save(&self, tenant_id: &TenantId, snapshot: &Snapshot) -> Result<(), RepositoryError>;

    async fn find_by_execution_id(
        &self,
        tenant_id: &TenantId,
        execution_id: ExecutionId,
    ) -> Result<Option<Snapshot>, RepositoryError>;

    async fn find_paused(&self, tenant_id: &TenantId) -> Result<Vec<Snapshot>, RepositoryError>;

    /// Refresh `last_heartbeat_at` on every non-terminal snapshot owned by
    /// `server_node_id`. Returns the number of rows touched.
    async fn update_heartbeats(
        &self,
        server_node_id: ServerNodeId,
    ) -> Result<u64, RepositoryError>;

    /// Atomically claim every non-terminal snapshot whose heartbeat is older
    /// than `stale_before`, setting `server_node_id` to the claimant. Spans
    /// all tenants; returned snapshots carry their tenant. Safe under
    /// concurrent sweepers: a row is claimed by at most one of them.
    async fn claim_stale_executions(
        &self,
        server_node_id: ServerNodeId,
        stale_before: DateTime<Utc>,
    ) -> Result<Vec<Snapshot>, RepositoryError>;
}

/// Repository errors
#[derive(Debug, thiserror::Error)]
pub enum RepositoryError {
    #[error("entity not found: {0}")]
    NotFound(String),

    #[error("database error: {0}")]
    Database(String),

    #[error("serialization error: {0}")]
    Serialization(String),

    /// The snapshot row is owned by another live server node.
    #[error("lease conflict: execution {execution_id} owned by {owner}")]
    LeaseConflict {
        execution_id: ExecutionId,
        owner: ServerNodeId,
    },
}

impl From<sqlx::Error> for RepositoryError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::RowNotFound => RepositoryError::NotFound("row not found".to_string()),
            _ => RepositoryError::Database(err.to_string()),
        }
    }
}

impl From<serde_json::Error> for RepositoryError {
    fn from(err: serde_json::Error) -> Self {
        RepositoryError::Serialization(err.to_string())
    }
}
