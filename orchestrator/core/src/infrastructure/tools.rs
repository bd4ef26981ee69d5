// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! Tool routing over the split-pipe channel.
//!
//! Plan steps and action handlers never talk to tool sidecars directly; every
//! invocation is routed through the orchestrator. The registry maps tenant
//! tools onto the JSON-RPC client that serves them, and the executor turns a
//! step into a `tools/call` request on that client's session.

use async_trait::async_trait;
use dashmap::DashMap;
use serde_json::{json, Value};
use std::sync::Arc;
use tracing::debug;

use crate::domain::error::EngineError;
use crate::domain::handlers::{ToolDescriptor, ToolExecutor, ToolRegistry};
use crate::domain::tenant::TenantId;
use crate::infrastructure::rpc::RpcSessionManager;

/// In-memory tenant-scoped tool catalog.
#[derive(Default)]
pub struct InMemoryToolRegistry {
    tools: DashMap<TenantId, Vec<ToolDescriptor>>,
}

impl InMemoryToolRegistry {
    pub fn new() -> Self {
        Self {
            tools: DashMap::new(),
        }
    }

    pub fn register(&self, tenant_id: TenantId, tool: ToolDescriptor) {
        self.tools.entry(tenant_id).or_default().push(tool);
    }
}

impl ToolRegistry for InMemoryToolRegistry {
    fn list_tools(&self, tenant_id: &TenantId) -> Vec<ToolDescriptor> {
        self.tools
            .get(tenant_id)
            .map(|e| e.value().clone())
            .unwrap_or_default()
    }

    fn find_tool(&self, tenant_id: &TenantId, tool_name: &str) -> Option<ToolDescriptor> {
        self.tools
            .get(tenant_id)
            .and_then(|e| e.value().iter().find(|t| t.name == tool_name).cloned())
    }
}

/// Executes plan-step tool calls as `tools/call` JSON-RPC requests against
/// the tenant-owned sidecar that registered the tool.
pub struct SessionToolExecutor {
    sessions: RpcSessionManager,
    registry: Arc<dyn ToolRegistry>,
}

impl SessionToolExecutor {
    pub fn new(sessions: RpcSessionManager, registry: Arc<dyn ToolRegistry>) -> Self {
        Self { sessions, registry }
    }
}

#[async_trait]
impl ToolExecutor for SessionToolExecutor {
    async fn execute_tool(
        &self,
        tenant_id: &TenantId,
        tool_name: &str,
        arguments: &Value,
    ) -> Result<Value, EngineError> {
        let tool = self
            .registry
            .find_tool(tenant_id, tool_name)
            .ok_or_else(|| {
                EngineError::PlanCreation(format!(
                    "tool '{tool_name}' not registered for tenant {tenant_id}"
                ))
            })?;

        debug!(tenant_id = %tenant_id, tool = %tool_name, client = %tool.client_id, "dispatching tool call");

        self.sessions
            .send_request(
                &tool.client_id,
                "tools/call",
                json!({ "name": tool_name, "arguments": arguments }),
                None,
            )
            .await
    }
}
