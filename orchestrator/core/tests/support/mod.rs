// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Shared fakes and wiring helpers for the integration tests.

#![allow(dead_code)]

use async_trait::async_trait;
use serde_json::{json, Value};
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};

use aegis_conductor_core::application::context::Collaborators;
use aegis_conductor_core::domain::agent::{Agent, AgentResponse};
use aegis_conductor_core::domain::error::EngineError;
use aegis_conductor_core::domain::handlers::ToolExecutor;
use aegis_conductor_core::domain::rubric::{RubricEngine, RubricEvaluation};
use aegis_conductor_core::domain::tenant::TenantId;
use aegis_conductor_core::domain::workflow::{
    ExitStatus, Node, PlanningConfig, TransitionRule, Workflow,
};
use aegis_conductor_core::infrastructure::repositories::{
    InMemoryWorkflowRepository, InMemoryWorkflowStateRepository,
};

pub const TENANT: &str = "tenant-1";

// ============================================================================
// Workflow Builders
// ============================================================================

pub fn end_node() -> Node {
    Node::End {
        exit_status: ExitStatus::Success,
    }
}

pub fn agent_node(agent_id: &str, prompt: &str, target: &str) -> Node {
    Node::Standard {
        agent_id: Some(agent_id.into()),
        prompt: Some(prompt.into()),
        rubric_id: None,
        review: None,
        planning: PlanningConfig::default(),
        static_plan: None,
        plan_failure_target: None,
        output_params: vec![],
        transitions: vec![TransitionRule::Success {
            target: target.into(),
        }],
    }
}

pub fn rubric_node(agent_id: &str, rubric_id: &str, target: &str) -> Node {
    Node::Standard {
        agent_id: Some(agent_id.into()),
        prompt: Some("work".into()),
        rubric_id: Some(rubric_id.into()),
        review: None,
        planning: PlanningConfig::default(),
        static_plan: None,
        plan_failure_target: None,
        output_params: vec![],
        transitions: vec![TransitionRule::Success {
            target: target.into(),
        }],
    }
}

pub fn tenant() -> TenantId {
    TenantId::from(TENANT)
}

// ============================================================================
// Fakes
// ============================================================================

/// Agent that always answers the same text.
pub struct FixedAgent {
    pub content: String,
}

impl FixedAgent {
    pub fn new(content: impl Into<String>) -> Arc<Self> {
        Arc::new(Self {
            content: content.into(),
        })
    }
}

#[async_trait]
impl Agent for FixedAgent {
    async fn execute(
        &self,
        _prompt: &str,
        _context: &HashMap<String, Value>,
    ) -> Result<AgentResponse, EngineError> {
        Ok(AgentResponse::Text {
            content: self.content.clone(),
            metadata: HashMap::new(),
        })
    }
}

/// Agent that replays a scripted queue of responses, then repeats the last.
pub struct ScriptedAgent {
    responses: Mutex<VecDeque<AgentResponse>>,
    fallback: String,
}

impl ScriptedAgent {
    pub fn new(responses: Vec<AgentResponse>) -> Arc<Self> {
        Arc::new(Self {
            responses: Mutex::new(responses.into()),
            fallback: "done".into(),
        })
    }
}

#[async_trait]
impl Agent for ScriptedAgent {
    async fn execute(
        &self,
        _prompt: &str,
        _context: &HashMap<String, Value>,
    ) -> Result<AgentResponse, EngineError> {
        let next = self.responses.lock().unwrap().pop_front();
        Ok(next.unwrap_or(AgentResponse::Text {
            content: self.fallback.clone(),
            metadata: HashMap::new(),
        }))
    }
}

/// Agent that records the prompt it was called with.
pub struct RecordingAgent {
    pub prompts: Mutex<Vec<String>>,
    pub content: String,
}

impl RecordingAgent {
    pub fn new(content: impl Into<String>) -> Arc<Self> {
        Arc::new(Self {
            prompts: Mutex::new(vec![]),
            content: content.into(),
        })
    }
}

#[async_trait]
impl Agent for RecordingAgent {
    async fn execute(
        &self,
        prompt: &str,
        _context: &HashMap<String, Value>,
    ) -> Result<AgentResponse, EngineError> {
        self.prompts.lock().unwrap().push(prompt.to_string());
        Ok(AgentResponse::Text {
            content: self.content.clone(),
            metadata: HashMap::new(),
        })
    }
}

/// Rubric engine replaying scripted evaluations per node id; unscripted
/// nodes pass with a score of 95.
pub struct ScriptedRubricEngine {
    scripts: Mutex<HashMap<String, VecDeque<RubricEvaluation>>>,
}

impl ScriptedRubricEngine {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            scripts: Mutex::new(HashMap::new()),
        })
    }

    pub fn script(self: &Arc<Self>, node_id: &str, evaluations: Vec<RubricEvaluation>) {
        self.scripts
            .lock()
            .unwrap()
            .insert(node_id.to_string(), evaluations.into());
    }
}

pub fn evaluation(rubric_id: &str, score: f64, passed: bool) -> RubricEvaluation {
    RubricEvaluation {
        rubric_id: rubric_id.into(),
        score,
        passed,
        failed_criteria: if passed {
            vec![]
        } else {
            vec!["coherence".into()]
        },
        suggestions: if passed {
            vec![]
        } else {
            vec!["tighten the argument".into()]
        },
    }
}

#[async_trait]
impl RubricEngine for ScriptedRubricEngine {
    async fn evaluate(
        &self,
        rubric_id: &str,
        node_id: &str,
        _output: &str,
        _context: &HashMap<String, Value>,
    ) -> Result<RubricEvaluation, EngineError> {
        let next = self
            .scripts
            .lock()
            .unwrap()
            .get_mut(node_id)
            .and_then(|queue| queue.pop_front());
        Ok(next.unwrap_or_else(|| evaluation(rubric_id, 95.0, true)))
    }
}

/// Tool executor that echoes the call; optionally fails the first N calls
/// to a given tool.
pub struct EchoToolExecutor {
    failures: Mutex<HashMap<String, u32>>,
    pub calls: Mutex<Vec<String>>,
}

impl EchoToolExecutor {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            failures: Mutex::new(HashMap::new()),
            calls: Mutex::new(vec![]),
        })
    }

    pub fn fail_first(self: &Arc<Self>, tool_name: &str, times: u32) {
        self.failures
            .lock()
            .unwrap()
            .insert(tool_name.to_string(), times);
    }
}

#[async_trait]
impl ToolExecutor for EchoToolExecutor {
    async fn execute_tool(
        &self,
        _tenant_id: &TenantId,
        tool_name: &str,
        arguments: &Value,
    ) -> Result<Value, EngineError> {
        self.calls.lock().unwrap().push(tool_name.to_string());
        let mut failures = self.failures.lock().unwrap();
        if let Some(remaining) = failures.get_mut(tool_name) {
            if *remaining > 0 {
                *remaining -= 1;
                return Err(EngineError::Timeout(tool_name.to_string()));
            }
        }
        Ok(json!({ "tool": tool_name, "echo": arguments }))
    }
}

// ============================================================================
// Wiring
// ============================================================================

pub struct TestWiring {
    pub workflows: Arc<InMemoryWorkflowRepository>,
    pub states: Arc<InMemoryWorkflowStateRepository>,
    pub collaborators: Collaborators,
}

pub fn wiring() -> TestWiring {
    let workflows = Arc::new(InMemoryWorkflowRepository::new());
    let states = Arc::new(InMemoryWorkflowStateRepository::new());
    let collaborators = Collaborators::new(workflows.clone(), states.clone());
    TestWiring {
        workflows,
        states,
        collaborators,
    }
}

pub async fn store_workflow(wiring: &TestWiring, workflow: &Workflow) {
    use aegis_conductor_core::domain::repository::WorkflowRepository;
    wiring
        .workflows
        .save(&tenant(), workflow)
        .await
        .expect("store workflow");
}
