// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! PostgreSQL Repositories
//!
//! Production persistence for workflow definitions and execution snapshots.
//!
//! # Schema
//!
//! ```sql
//! CREATE TABLE workflows (
//!     tenant_id    TEXT        NOT NULL,
//!     workflow_id  TEXT        NOT NULL,
//!     version      INTEGER     NOT NULL,
//!     definition   JSONB       NOT NULL,
//!     updated_at   TIMESTAMPTZ NOT NULL DEFAULT NOW(),
//!     PRIMARY KEY (tenant_id, workflow_id)
//! );
//!
//! CREATE TABLE workflow_snapshots (
//!     tenant_id         TEXT        NOT NULL,
//!     execution_id      UUID        NOT NULL,
//!     workflow_id       TEXT        NOT NULL,
//!     current_node_id   TEXT,
//!     context           JSONB       NOT NULL,
//!     active_plan       JSONB,
//!     rubric_evaluation JSONB,
//!     status            TEXT        NOT NULL,
//!     created_at        TIMESTAMPTZ NOT NULL,
//!     server_node_id    UUID,
//!     last_heartbeat_at TIMESTAMPTZ NOT NULL,
//!     PRIMARY KEY (tenant_id, execution_id)
//! );
//! ```
//!
//! # Lease Semantics
//!
//! - Non-terminal saves are conditional on the stored row being unowned,
//!   owned by the writer, or terminal — a stale owner's write matches zero
//!   rows and surfaces as [`RepositoryError::LeaseConflict`].
//! - `claim_stale_executions` is a single `UPDATE … RETURNING`: under
//!   read-committed isolation the second of two racing sweepers re-evaluates
//!   the predicate against the committed row and silently skips it.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgPool;
use sqlx::Row;

use crate::domain::repository::{RepositoryError, WorkflowRepository, WorkflowStateRepository};
use crate::domain::state::{ExecutionId, ServerNodeId, Snapshot, SnapshotStatus};
use crate::domain::tenant::TenantId;
use crate::domain::workflow::Workflow;

const TERMINAL_STATUSES: [&str; 4] = ["paused", "completed", "rejected", "failed"];

fn status_str(status: SnapshotStatus) -> &'static str {
    match status {
        SnapshotStatus::Checkpoint => "checkpoint",
        SnapshotStatus::Paused => "paused",
        SnapshotStatus::Completed => "completed",
        SnapshotStatus::Rejected => "rejected",
        SnapshotStatus::Failed => "failed",
    }
}

fn status_from_str(s: &str) -> Result<SnapshotStatus, RepositoryError> {
    match s {
        "checkpoint" => Ok(SnapshotStatus::Checkpoint),
        "paused" => Ok(SnapshotStatus::Paused),
        "completed" => Ok(SnapshotStatus::Completed),
        "rejected" => Ok(SnapshotStatus::Rejected),
        "failed" => Ok(SnapshotStatus::Failed),
        other => Err(RepositoryError::Serialization(format!(
            "unknown snapshot status '{other}'"
        ))),
    }
}

fn snapshot_from_row(row: &sqlx::postgres::PgRow) -> Result<Snapshot, RepositoryError> {
    let status: String = row.get("status");
    let context: serde_json::Value = row.get("context");
    let active_plan: Option<serde_json::Value> = row.get("active_plan");
    let rubric_evaluation: Option<serde_json::Value> = row.get("rubric_evaluation");

    Ok(Snapshot {
        tenant_id: TenantId::new(row.get::<String, _>("tenant_id")),
        workflow_id: row.get("workflow_id"),
        execution_id: ExecutionId(row.get("execution_id")),
        current_node_id: row.get("current_node_id"),
        context: serde_json::from_value(context)?,
        active_plan: active_plan.map(serde_json::from_value).transpose()?,
        rubric_evaluation: rubric_evaluation.map(serde_json::from_value).transpose()?,
        status: status_from_str(&status)?,
        created_at: row.get("created_at"),
        server_node_id: row
            .get::<Option<uuid::Uuid>, _>("server_node_id")
            .map(ServerNodeId),
        last_heartbeat_at: row.get("last_heartbeat_at"),
    })
}

// ============================================================================
// Workflow Definitions
// ============================================================================

pub struct PostgresWorkflowRepository {
    pool: PgPool,
}

impl PostgresWorkflowRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl WorkflowRepository for PostgresWorkflowRepository {
    async fn save(&self, tenant_id: &TenantId, workflow: &Workflow) -> Result<(), RepositoryError> {
        let definition = serde_json::to_value(workflow)?;
        sqlx::query(
            r#"
            INSERT INTO workflows (tenant_id, workflow_id, version, definition, updated_at)
            VALUES ($1, $2, $3, $4, NOW())
            ON CONFLICT (tenant_id, workflow_id) DO UPDATE SET
                version = EXCLUDED.version,
                definition = EXCLUDED.definition,
                updated_at = NOW()
            "#,
        )
        .bind(tenant_id.as_str())
        .bind(&workflow.workflow_id)
        .bind(workflow.version as i32)
        .bind(definition)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn find_by_id(
        &self,
        tenant_id: &TenantId,
        workflow_id: &str,
    ) -> Result<Option<Workflow>, RepositoryError> {
        let row = sqlx::query(
            "SELECT definition FROM workflows WHERE tenant_id = $1 AND workflow_id = $2",
        )
        .bind(tenant_id.as_str())
        .bind(workflow_id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(|r| {
            let definition: serde_json::Value = r.get("definition");
            serde_json::from_value(definition).map_err(RepositoryError::from)
        })
        .transpose()
    }

    async fn find_all(&self, tenant_id: &TenantId) -> Result<Vec<Workflow>, RepositoryError> {
        let rows = sqlx::query(
            "SELECT definition FROM workflows WHERE tenant_id = $1 ORDER BY workflow_id",
        )
        .bind(tenant_id.as_str())
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter()
            .map(|r| {
                let definition: serde_json::Value = r.get("definition");
                serde_json::from_value(definition).map_err(RepositoryError::from)
            })
            .collect()
    }

    async fn exists(
        &self,
        tenant_id: &TenantId,
        workflow_id: &str,
    ) -> Result<bool, RepositoryError> {
        let row = sqlx::query(
            "SELECT 1 AS one FROM workflows WHERE tenant_id = $1 AND workflow_id = $2",
        )
        .bind(tenant_id.as_str())
        .bind(workflow_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.is_some())
    }

    async fn delete(
        &self,
        tenant_id: &TenantId,
        workflow_id: &str,
    ) -> Result<bool, RepositoryError> {
        let result =
            sqlx::query("DELETE FROM workflows WHERE tenant_id = $1 AND workflow_id = $2")
                .bind(tenant_id.as_str())
                .bind(workflow_id)
                .execute(&self.pool)
                .await?;
        Ok(result.rows_affected() > 0)
    }
}

// ============================================================================
// Execution Snapshots
// ============================================================================

pub struct PostgresWorkflowStateRepository {
    pool: PgPool,
}

impl PostgresWorkflowStateRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl WorkflowStateRepository for PostgresWorkflowStateRepository {
    async fn save(&self, tenant_id: &TenantId, snapshot: &Snapshot) -> Result<(), RepositoryError> {
        let context = serde_json::to_value(&snapshot.context)?;
        let active_plan = snapshot
            .active_plan
            .as_ref()
            .map(serde_json::to_value)
            .transpose()?;
        let rubric_evaluation = snapshot
            .rubric_evaluation
            .as_ref()
            .map(serde_json::to_value)
            .transpose()?;

        // The upsert's WHERE clause is the lease guard: it matches when the
        // stored row is unowned, owned by the writer, or already terminal.
        let result = sqlx::query(
            r#"
            INSERT INTO workflow_snapshots (
                tenant_id, execution_id, workflow_id, current_node_id,
                context, active_plan, rubric_evaluation, status,
                created_at, server_node_id, last_heartbeat_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
            ON CONFLICT (tenant_id, execution_id) DO UPDATE SET
                current_node_id = EXCLUDED.current_node_id,
                context = EXCLUDED.context,
                active_plan = EXCLUDED.active_plan,
                rubric_evaluation = EXCLUDED.rubric_evaluation,
                status = EXCLUDED.status,
                created_at = EXCLUDED.created_at,
                server_node_id = EXCLUDED.server_node_id,
                last_heartbeat_at = EXCLUDED.last_heartbeat_at
            WHERE workflow_snapshots.server_node_id IS NULL
               OR workflow_snapshots.server_node_id = $10
               OR workflow_snapshots.status = ANY($12)
            "#,
        )
        .bind(tenant_id.as_str())
        .bind(snapshot.execution_id.0)
        .bind(&snapshot.workflow_id)
        .bind(&snapshot.current_node_id)
        .bind(context)
        .bind(active_plan)
        .bind(rubric_evaluation)
        .bind(status_str(snapshot.status))
        .bind(snapshot.created_at)
        .bind(snapshot.server_node_id.map(|n| n.0))
        .bind(snapshot.last_heartbeat_at)
        .bind(&TERMINAL_STATUSES[..])
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            // Conflicting row exists and the guard filtered the update out:
            // somebody else owns the lease now.
            let owner = sqlx::query(
                "SELECT server_node_id FROM workflow_snapshots WHERE tenant_id = $1 AND execution_id = $2",
            )
            .bind(tenant_id.as_str())
            .bind(snapshot.execution_id.0)
            .fetch_optional(&self.pool)
            .await?
            .and_then(|r| r.get::<Option<uuid::Uuid>, _>("server_node_id"))
            .map(ServerNodeId);

            return Err(RepositoryError::LeaseConflict {
                execution_id: snapshot.execution_id,
                owner: owner.unwrap_or(ServerNodeId(uuid::Uuid::nil())),
            });
        }

        Ok(())
    }

    async fn find_by_execution_id(
        &self,
        tenant_id: &TenantId,
        execution_id: ExecutionId,
    ) -> Result<Option<Snapshot>, RepositoryError> {
        let row = sqlx::query(
            "SELECT * FROM workflow_snapshots WHERE tenant_id = $1 AND execution_id = $2",
        )
        .bind(tenant_id.as_str())
        .bind(execution_id.0)
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(snapshot_from_row).transpose()
    }

    async fn find_paused(&self, tenant_id: &TenantId) -> Result<Vec<Snapshot>, RepositoryError> {
        let rows = sqlx::query(
            "SELECT * FROM workflow_snapshots WHERE tenant_id = $1 AND status = 'paused' ORDER BY created_at",
        )
        .bind(tenant_id.as_str())
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(snapshot_from_row).collect()
    }

    async fn update_heartbeats(
        &self,
        server_node_id: ServerNodeId,
    ) -> Result<u64, RepositoryError> {
        let result = sqlx::query(
            r#"
            UPDATE workflow_snapshots
            SET last_heartbeat_at = NOW()
            WHERE server_node_id = $1 AND status <> ALL($2)
            "#,
        )
        .bind(server_node_id.0)
        .bind(&TERMINAL_STATUSES[..])
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    async fn claim_stale_executions(
        &self,
        server_node_id: ServerNodeId,
        stale_before: DateTime<Utc>,
    ) -> Result<Vec<Snapshot>, RepositoryError> {
        // Single conditional update: the predicate and the ownership write
        // commit together, so racing sweepers cannot double-claim a row.
        let rows = sqlx::query(
            r#"
            UPDATE workflow_snapshots
            SET server_node_id = $1, last_heartbeat_at = NOW()
            WHERE status <> ALL($2)
              AND last_heartbeat_at < $3
              AND (server_node_id IS NULL OR server_node_id <> $1)
            RETURNING *
            "#,
        )
        .bind(server_node_id.0)
        .bind(&TERMINAL_STATUSES[..])
        .bind(stale_before)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(snapshot_from_row).collect()
    }
}
