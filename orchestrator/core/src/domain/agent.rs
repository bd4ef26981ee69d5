// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! Agent contract and registry.
//!
//! Agents are external collaborators (LLM-backed or otherwise); the engine
//! only knows the [`Agent`] trait. The registry is shared across executions
//! and must be safe for concurrent registration and lookup.

use async_trait::async_trait;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;

use crate::domain::error::EngineError;
use crate::domain::plan::PlanStep;
use crate::domain::workflow::AgentConfig;

/// Response variants an agent may produce. `ToolRequest` and `PlanProposal`
/// are only meaningful inside planning mode and are rejected elsewhere.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum AgentResponse {
    Text {
        content: String,
        #[serde(default)]
        metadata: HashMap<String, Value>,
    },
    Error {
        message: String,
    },
    ToolRequest {
        tool_name: String,
        arguments: Value,
    },
    PlanProposal {
        steps: Vec<PlanStep>,
    },
}

#[async_trait]
pub trait Agent: Send + Sync {
    async fn execute(
        &self,
        prompt: &str,
        context: &HashMap<String, Value>,
    ) -> Result<AgentResponse, EngineError>;
}

/// Builds agents from workflow-embedded configs. LLM provider wiring lives
/// outside the engine; tests supply deterministic fakes.
pub trait AgentFactory: Send + Sync {
    fn create(&self, config: &AgentConfig) -> Result<Arc<dyn Agent>, EngineError>;
}

/// Concurrent agent registry shared across executions.
#[derive(Default)]
pub struct AgentRegistry {
    agents: DashMap<String, Arc<dyn Agent>>,
}

impl AgentRegistry {
    pub fn new() -> Self {
        Self {
            agents: DashMap::new(),
        }
    }

    pub fn has_agent(&self, agent_id: &str) -> bool {
        self.agents.contains_key(agent_id)
    }

    pub fn register(&self, agent_id: impl Into<String>, agent: Arc<dyn Agent>) {
        self.agents.insert(agent_id.into(), agent);
    }

    pub fn get(&self, agent_id: &str) -> Option<Arc<dyn Agent>> {
        self.agents.get(agent_id).map(|e| e.value().clone())
    }

    pub fn len(&self) -> usize {
        self.agents.len()
    }

    pub fn is_empty(&self) -> bool {
        self.agents.is_empty()
    }
}
