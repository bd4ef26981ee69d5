// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! End-to-end traversal tests: linear flows, retry transitions, rubric
//! auto-backtracking, plan pause/resume, review decisions, loops, and
//! sub-workflows — all against in-memory repositories and fake collaborators.

mod support;

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use indexmap::indexmap;
use serde_json::json;

use aegis_conductor_core::application::context::ExecutionContext;
use aegis_conductor_core::application::executor::WorkflowExecutor;
use aegis_conductor_core::domain::agent::AgentResponse;
use aegis_conductor_core::domain::error::EngineError;
use aegis_conductor_core::domain::handlers::{ReviewDecision, ReviewHandler};
use aegis_conductor_core::domain::plan::{Plan, PlanSource, PlanStep, ResumeDecision};
use aegis_conductor_core::domain::state::{
    keys, BacktrackType, ExecutionResult, HistoryEntry, NodeResult, WorkflowState,
};
use aegis_conductor_core::domain::workflow::{
    BreakCondition, ExitStatus, Node, PlanningConfig, PlanningMode, ReviewConfig, ReviewMode,
    ScoreCondition, ScoreOperator, TransitionRule, Workflow,
};

use support::*;

fn steps_of(state: &WorkflowState) -> Vec<&str> {
    state
        .history
        .iter()
        .filter_map(HistoryEntry::as_step)
        .map(|s| s.node_id.as_str())
        .collect()
}

fn backtracks_of(state: &WorkflowState) -> Vec<(&str, &str, BacktrackType)> {
    state
        .history
        .iter()
        .filter_map(HistoryEntry::as_backtrack)
        .map(|b| (b.from.as_str(), b.to.as_str(), b.backtrack_type))
        .collect()
}

// ============================================================================
// Linear Execution
// ============================================================================

#[tokio::test]
async fn test_linear_two_step_workflow_completes() {
    let wiring = wiring();
    wiring
        .collaborators
        .agents
        .register("fake", FixedAgent::new("ok"));

    let workflow = Workflow::new(
        tenant(),
        "linear",
        1,
        "stepA",
        indexmap! {
            "stepA".to_string() => agent_node("fake", "do {input}", "end"),
            "end".to_string() => end_node(),
        },
    )
    .unwrap();

    let executor = WorkflowExecutor::new(Arc::new(wiring.collaborators));
    let result = executor
        .execute(
            Arc::new(workflow),
            HashMap::from([("input".to_string(), json!("x"))]),
            ExecutionContext::noop_listener(),
        )
        .await;

    let ExecutionResult::Completed { state, exit_status } = result else {
        panic!("expected Completed");
    };
    assert_eq!(exit_status, ExitStatus::Success);
    assert_eq!(state.get_str("stepA"), Some("ok"));
    assert_eq!(steps_of(&state), vec!["stepA", "end"]);
    assert!(backtracks_of(&state).is_empty());
}

#[tokio::test]
async fn test_prompt_template_and_override() {
    let wiring = wiring();
    let agent = RecordingAgent::new("done");
    wiring.collaborators.agents.register("fake", agent.clone());

    let workflow = Workflow::new(
        tenant(),
        "templated",
        1,
        "stepA",
        indexmap! {
            "stepA".to_string() => agent_node("fake", "summarize {topic}", "end"),
            "end".to_string() => end_node(),
        },
    )
    .unwrap();

    let executor = WorkflowExecutor::new(Arc::new(wiring.collaborators));
    let mut context = HashMap::from([("topic".to_string(), json!("geese"))]);
    context.insert(keys::prompt_override("stepA"), json!("override {topic}"));

    let result = executor
        .execute(Arc::new(workflow), context, ExecutionContext::noop_listener())
        .await;

    assert!(matches!(result, ExecutionResult::Completed { .. }));
    assert_eq!(agent.prompts.lock().unwrap().as_slice(), ["override geese"]);
}

#[tokio::test]
async fn test_output_params_lift_json_fields() {
    let wiring = wiring();
    wiring.collaborators.agents.register(
        "fake",
        FixedAgent::new(r#"{"title": "Geese Memo", "score": 88}"#),
    );

    let node = Node::Standard {
        agent_id: Some("fake".into()),
        prompt: None,
        rubric_id: None,
        review: None,
        planning: PlanningConfig::default(),
        static_plan: None,
        plan_failure_target: None,
        output_params: vec!["title".into()],
        transitions: vec![TransitionRule::Success { target: "end".into() }],
    };
    let workflow = Workflow::new(
        tenant(),
        "lifting",
        1,
        "stepA",
        indexmap! { "stepA".to_string() => node, "end".to_string() => end_node() },
    )
    .unwrap();

    let executor = WorkflowExecutor::new(Arc::new(wiring.collaborators));
    let result = executor
        .execute(Arc::new(workflow), HashMap::new(), ExecutionContext::noop_listener())
        .await;

    let ExecutionResult::Completed { state, .. } = result else {
        panic!("expected Completed");
    };
    assert_eq!(state.get_str("title"), Some("Geese Memo"));
    assert!(state.get("score").is_none(), "unlisted fields stay put");
}

#[tokio::test]
async fn test_missing_node_is_fatal() {
    let wiring = wiring();
    let workflow = Workflow::new(
        tenant(),
        "broken",
        1,
        "end",
        indexmap! { "end".to_string() => end_node() },
    )
    .unwrap();

    let executor = WorkflowExecutor::new(Arc::new(wiring.collaborators));
    let mut state = WorkflowState::new("broken", "ghost");
    state.current_node = "ghost".into();
    let result = executor
        .execute_from(Arc::new(workflow), state, ExecutionContext::noop_listener())
        .await;

    let ExecutionResult::Failure { error, .. } = result else {
        panic!("expected Failure");
    };
    assert!(matches!(error, EngineError::NodeMissing(_)));
}

// ============================================================================
// Failure Retries
// ============================================================================

#[tokio::test]
async fn test_failure_rule_retries_until_success() {
    let wiring = wiring();
    wiring.collaborators.agents.register(
        "flaky",
        ScriptedAgent::new(vec![
            AgentResponse::Error { message: "transient".into() },
            AgentResponse::Error { message: "transient".into() },
            AgentResponse::Text { content: "recovered".into(), metadata: HashMap::new() },
        ]),
    );

    let node = Node::Standard {
        agent_id: Some("flaky".into()),
        prompt: None,
        rubric_id: None,
        review: None,
        planning: PlanningConfig::default(),
        static_plan: None,
        plan_failure_target: None,
        output_params: vec![],
        transitions: vec![
            TransitionRule::Success { target: "end".into() },
            TransitionRule::Failure {
                retry_count: 3,
                retry_target: None,
                else_target: "dead".into(),
            },
        ],
    };
    let workflow = Workflow::new(
        tenant(),
        "retrying",
        1,
        "stepA",
        indexmap! {
            "stepA".to_string() => node,
            "dead".to_string() => Node::End { exit_status: ExitStatus::Failure },
            "end".to_string() => end_node(),
        },
    )
    .unwrap();

    let executor = WorkflowExecutor::new(Arc::new(wiring.collaborators));
    let result = executor
        .execute(Arc::new(workflow), HashMap::new(), ExecutionContext::noop_listener())
        .await;

    let ExecutionResult::Completed { state, exit_status } = result else {
        panic!("expected Completed");
    };
    assert_eq!(exit_status, ExitStatus::Success);
    // Two failed attempts, one success, one end.
    assert_eq!(steps_of(&state), vec!["stepA", "stepA", "stepA", "end"]);
}

#[tokio::test]
async fn test_failure_rule_exhaustion_takes_else_target() {
    let wiring = wiring();
    wiring.collaborators.agents.register(
        "dying",
        ScriptedAgent::new(vec![
            AgentResponse::Error { message: "no".into() },
            AgentResponse::Error { message: "still no".into() },
        ]),
    );

    let node = Node::Standard {
        agent_id: Some("dying".into()),
        prompt: None,
        rubric_id: None,
        review: None,
        planning: PlanningConfig::default(),
        static_plan: None,
        plan_failure_target: None,
        output_params: vec![],
        transitions: vec![
            TransitionRule::Success { target: "end".into() },
            TransitionRule::Failure {
                retry_count: 1,
                retry_target: None,
                else_target: "dead".into(),
            },
        ],
    };
    let workflow = Workflow::new(
        tenant(),
        "exhausted",
        1,
        "stepA",
        indexmap! {
            "stepA".to_string() => node,
            "dead".to_string() => Node::End { exit_status: ExitStatus::Failure },
            "end".to_string() => end_node(),
        },
    )
    .unwrap();

    let executor = WorkflowExecutor::new(Arc::new(wiring.collaborators));
    let result = executor
        .execute(Arc::new(workflow), HashMap::new(), ExecutionContext::noop_listener())
        .await;

    let ExecutionResult::Completed { exit_status, .. } = result else {
        panic!("expected Completed via failure end node");
    };
    assert_eq!(exit_status, ExitStatus::Failure);
}

// ============================================================================
// Rubric Auto-Backtracking
// ============================================================================

#[tokio::test]
async fn test_auto_backtrack_on_failed_rubric() {
    let wiring = wiring();
    wiring
        .collaborators
        .agents
        .register("writer", FixedAgent::new("draft text"));
    let rubrics = ScriptedRubricEngine::new();
    // B fails its first evaluation at 45, passes the second at 90.
    rubrics.script(
        "B",
        vec![evaluation("r2", 45.0, false), evaluation("r2", 90.0, true)],
    );
    let collaborators = wiring.collaborators.with_rubric_engine(rubrics);

    let workflow = Workflow::new(
        tenant(),
        "scored",
        1,
        "A",
        indexmap! {
            "A".to_string() => rubric_node("writer", "r1", "B"),
            "B".to_string() => rubric_node("writer", "r2", "end"),
            "end".to_string() => end_node(),
        },
    )
    .unwrap();

    let executor = WorkflowExecutor::new(Arc::new(collaborators));
    let result = executor
        .execute(Arc::new(workflow), HashMap::new(), ExecutionContext::noop_listener())
        .await;

    let ExecutionResult::Completed { state, exit_status } = result else {
        panic!("expected Completed");
    };
    assert_eq!(exit_status, ExitStatus::Success);

    let backtracks = backtracks_of(&state);
    assert_eq!(backtracks, vec![("B", "A", BacktrackType::Automatic)]);
    let event = state
        .history
        .iter()
        .filter_map(HistoryEntry::as_backtrack)
        .next()
        .unwrap();
    assert_eq!(event.rubric_score, Some(45.0));

    // Second pass resumes at A and runs through to the end.
    assert_eq!(steps_of(&state), vec!["A", "B", "A", "B", "end"]);
    assert!(state.get(keys::BACKTRACK_REASON).is_some());
}

#[tokio::test]
async fn test_minor_score_retries_current_node() {
    let wiring = wiring();
    wiring
        .collaborators
        .agents
        .register("writer", FixedAgent::new("draft"));
    let rubrics = ScriptedRubricEngine::new();
    rubrics.script(
        "A",
        vec![evaluation("r1", 65.0, false), evaluation("r1", 92.0, true)],
    );
    let collaborators = wiring.collaborators.with_rubric_engine(rubrics);

    let workflow = Workflow::new(
        tenant(),
        "minor",
        1,
        "A",
        indexmap! {
            "A".to_string() => rubric_node("writer", "r1", "end"),
            "end".to_string() => end_node(),
        },
    )
    .unwrap();

    let executor = WorkflowExecutor::new(Arc::new(collaborators));
    let result = executor
        .execute(Arc::new(workflow), HashMap::new(), ExecutionContext::noop_listener())
        .await;

    let ExecutionResult::Completed { state, .. } = result else {
        panic!("expected Completed");
    };
    assert_eq!(steps_of(&state), vec!["A", "A", "end"]);
    assert_eq!(state.get(keys::RETRY_ATTEMPT), Some(&json!(1)));
}

#[tokio::test]
async fn test_score_transition_suppresses_auto_backtrack() {
    let wiring = wiring();
    wiring
        .collaborators
        .agents
        .register("writer", FixedAgent::new("draft"));
    let rubrics = ScriptedRubricEngine::new();
    rubrics.script("A", vec![evaluation("r1", 45.0, false)]);
    let collaborators = wiring.collaborators.with_rubric_engine(rubrics);

    let node = Node::Standard {
        agent_id: Some("writer".into()),
        prompt: None,
        rubric_id: Some("r1".into()),
        review: None,
        planning: PlanningConfig::default(),
        static_plan: None,
        plan_failure_target: None,
        output_params: vec![],
        transitions: vec![
            TransitionRule::Score {
                conditions: vec![ScoreCondition {
                    operator: ScoreOperator::Lt,
                    value: 60.0,
                    range: None,
                    target: "rework".into(),
                }],
            },
            TransitionRule::Success { target: "end".into() },
        ],
    };
    let workflow = Workflow::new(
        tenant(),
        "score-routed",
        1,
        "A",
        indexmap! {
            "A".to_string() => node,
            "rework".to_string() => agent_node("writer", "fix it", "end"),
            "end".to_string() => end_node(),
        },
    )
    .unwrap();

    let executor = WorkflowExecutor::new(Arc::new(collaborators));
    let result = executor
        .execute(Arc::new(workflow), HashMap::new(), ExecutionContext::noop_listener())
        .await;

    let ExecutionResult::Completed { state, .. } = result else {
        panic!("expected Completed");
    };
    // The score rule routed the node; no AUTOMATIC backtrack was appended.
    assert!(backtracks_of(&state).is_empty());
    assert_eq!(steps_of(&state), vec!["A", "rework", "end"]);
}

// ============================================================================
// Review Semantics
// ============================================================================

struct ScriptedReviewHandler {
    decisions: Mutex<Vec<ReviewDecision>>,
}

impl ScriptedReviewHandler {
    fn new(decisions: Vec<ReviewDecision>) -> Arc<Self> {
        Arc::new(Self {
            decisions: Mutex::new(decisions),
        })
    }
}

#[async_trait]
impl ReviewHandler for ScriptedReviewHandler {
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
        let mut decisions = self.decisions.lock().unwrap();
        if decisions.is_empty() {
            return Ok(ReviewDecision::Approve { edited_state: None });
        }
        Ok(decisions.remove(0))
    }
}

fn reviewed_node(agent: &str, mode: ReviewMode, target: &str) -> Node {
    Node::Standard {
        agent_id: Some(agent.into()),
        prompt: None,
        rubric_id: None,
        review: Some(ReviewConfig {
            mode,
            allow_backtrack: true,
            allow_edit: true,
        }),
        planning: PlanningConfig::default(),
        static_plan: None,
        plan_failure_target: None,
        output_params: vec![],
        transitions: vec![TransitionRule::Success {
            target: target.into(),
        }],
    }
}

#[tokio::test]
async fn test_review_reject_short_circuits() {
    let wiring = wiring();
    wiring
        .collaborators
        .agents
        .register("writer", FixedAgent::new("draft"));
    let collaborators = wiring
        .collaborators
        .with_review_handler(ScriptedReviewHandler::new(vec![ReviewDecision::Reject {
            reason: "not good enough".into(),
        }]));

    let workflow = Workflow::new(
        tenant(),
        "reviewed",
        1,
        "A",
        indexmap! {
            "A".to_string() => reviewed_node("writer", ReviewMode::Required, "end"),
            "end".to_string() => end_node(),
        },
    )
    .unwrap();

    let executor = WorkflowExecutor::new(Arc::new(collaborators));
    let result = executor
        .execute(Arc::new(workflow), HashMap::new(), ExecutionContext::noop_listener())
        .await;

    let ExecutionResult::Rejected { reason, .. } = result else {
        panic!("expected Rejected");
    };
    assert_eq!(reason, "not good enough");
}

#[tokio::test]
async fn test_review_backtrack_with_edited_prompt() {
    let wiring = wiring();
    let agent = RecordingAgent::new("draft");
    wiring.collaborators.agents.register("writer", agent.clone());
    let collaborators = wiring
        .collaborators
        .with_review_handler(ScriptedReviewHandler::new(vec![ReviewDecision::Backtrack {
            target_step: "A".into(),
            edited_state: None,
            edited_prompt: Some("be sharper".into()),
            reason: "too vague".into(),
        }]));

    let workflow = Workflow::new(
        tenant(),
        "review-backtrack",
        1,
        "A",
        indexmap! {
            "A".to_string() => reviewed_node("writer", ReviewMode::Required, "end"),
            "end".to_string() => end_node(),
        },
    )
    .unwrap();

    let executor = WorkflowExecutor::new(Arc::new(collaborators));
    let result = executor
        .execute(Arc::new(workflow), HashMap::new(), ExecutionContext::noop_listener())
        .await;

    let ExecutionResult::Completed { state, .. } = result else {
        panic!("expected Completed");
    };
    assert_eq!(
        backtracks_of(&state),
        vec![("A", "A", BacktrackType::Manual)]
    );
    // Second visit used the reviewer's edited prompt.
    assert_eq!(agent.prompts.lock().unwrap().as_slice(), ["", "be sharper"]);
}

#[tokio::test]
async fn test_optional_review_skipped_on_success() {
    let wiring = wiring();
    wiring
        .collaborators
        .agents
        .register("writer", FixedAgent::new("fine"));
    // A handler that would reject — but optional review on success never asks.
    let collaborators = wiring
        .collaborators
        .with_review_handler(ScriptedReviewHandler::new(vec![ReviewDecision::Reject {
            reason: "should not be consulted".into(),
        }]));

    let workflow = Workflow::new(
        tenant(),
        "optional",
        1,
        "A",
        indexmap! {
            "A".to_string() => reviewed_node("writer", ReviewMode::Optional, "end"),
            "end".to_string() => end_node(),
        },
    )
    .unwrap();

    let executor = WorkflowExecutor::new(Arc::new(collaborators));
    let result = executor
        .execute(Arc::new(workflow), HashMap::new(), ExecutionContext::noop_listener())
        .await;
    assert!(matches!(result, ExecutionResult::Completed { .. }));
}

// ============================================================================
// Plan Pause / Resume
// ============================================================================

fn plan_node(review_before_execute: bool) -> Node {
    let plan = Plan::new(
        "planned",
        PlanSource::Static,
        vec![PlanStep::new(0, "search", json!({"q": "geese"}))],
    );
    Node::Standard {
        agent_id: None,
        prompt: Some("research".into()),
        rubric_id: None,
        review: None,
        planning: PlanningConfig {
            mode: PlanningMode::Static,
            constraints: Default::default(),
            review_before_execute,
        },
        static_plan: Some(plan),
        plan_failure_target: None,
        output_params: vec![],
        transitions: vec![TransitionRule::Success { target: "end".into() }],
    }
}

#[tokio::test]
async fn test_plan_review_pauses_then_resumes_to_completion() {
    let wiring = wiring();
    let tools = EchoToolExecutor::new();
    let collaborators = Arc::new(wiring.collaborators.with_tool_executor(tools.clone()));

    let workflow = Arc::new(
        Workflow::new(
            tenant(),
            "planned-wf",
            1,
            "planned",
            indexmap! {
                "planned".to_string() => plan_node(true),
                "end".to_string() => end_node(),
            },
        )
        .unwrap(),
    );

    let executor = WorkflowExecutor::new(collaborators.clone());
    let result = executor
        .execute(workflow.clone(), HashMap::new(), ExecutionContext::noop_listener())
        .await;

    let ExecutionResult::Paused { state } = result else {
        panic!("expected Paused");
    };
    assert_eq!(state.current_node, "planned", "pause keeps the current node");
    assert_eq!(state.get(keys::PLAN_REVIEW_REQUIRED), Some(&json!(true)));
    assert!(state.active_plan.is_some());
    assert!(tools.calls.lock().unwrap().is_empty(), "no step ran yet");

    // Approve and resume from the same node.
    let mut resumed = *state;
    resumed.set(
        keys::PLAN_RESUME_DECISION,
        serde_json::to_value(ResumeDecision {
            approved: true,
            modifications: None,
        })
        .unwrap(),
    );

    let executor = WorkflowExecutor::new(collaborators);
    let result = executor
        .execute_from(workflow, resumed, ExecutionContext::noop_listener())
        .await;

    let ExecutionResult::Completed { state, .. } = result else {
        panic!("expected Completed after resume");
    };
    assert_eq!(tools.calls.lock().unwrap().as_slice(), ["search"]);
    assert!(state.get_str("planned").unwrap().contains("search"));
    assert!(state.active_plan.is_none());
}

#[tokio::test]
async fn test_plan_replans_after_step_failure() {
    struct RetryPlanner;

    #[async_trait]
    impl aegis_conductor_core::domain::handlers::Planner for RetryPlanner {
        async fn create_plan(
            &self,
            request: aegis_conductor_core::domain::handlers::PlanRequest,
        ) -> Result<Plan, EngineError> {
            Ok(Plan::new(
                request.node_id,
                PlanSource::Dynamic,
                vec![PlanStep::new(0, "fetch", json!({}))],
            ))
        }

        async fn revise_plan(
            &self,
            plan: &Plan,
            _revision: aegis_conductor_core::domain::plan::RevisionContext,
        ) -> Result<Plan, EngineError> {
            Ok(Plan::new(
                plan.node_id.clone(),
                PlanSource::Dynamic,
                vec![PlanStep::new(0, "fetch", json!({"retry": true}))],
            ))
        }
    }

    let wiring = wiring();
    let tools = EchoToolExecutor::new();
    tools.fail_first("fetch", 1);
    let collaborators = Arc::new(
        wiring
            .collaborators
            .with_tool_executor(tools.clone())
            .with_planner(Arc::new(RetryPlanner)),
    );

    let node = Node::Standard {
        agent_id: None,
        prompt: Some("fetch things".into()),
        rubric_id: None,
        review: None,
        planning: PlanningConfig {
            mode: PlanningMode::Dynamic,
            constraints: Default::default(),
            review_before_execute: false,
        },
        static_plan: None,
        plan_failure_target: None,
        output_params: vec![],
        transitions: vec![TransitionRule::Success { target: "end".into() }],
    };
    let workflow = Workflow::new(
        tenant(),
        "replanning",
        1,
        "planned",
        indexmap! { "planned".to_string() => node, "end".to_string() => end_node() },
    )
    .unwrap();

    let executor = WorkflowExecutor::new(collaborators);
    let result = executor
        .execute(Arc::new(workflow), HashMap::new(), ExecutionContext::noop_listener())
        .await;

    assert!(matches!(result, ExecutionResult::Completed { .. }));
    // First attempt failed, revision re-ran the step.
    assert_eq!(tools.calls.lock().unwrap().as_slice(), ["fetch", "fetch"]);
}

#[tokio::test]
async fn test_exhausted_plan_routes_via_failure_target() {
    let wiring = wiring();
    let tools = EchoToolExecutor::new();
    tools.fail_first("fetch", 99);
    wiring
        .collaborators
        .agents
        .register("helper", FixedAgent::new("recovered"));
    let collaborators = Arc::new(wiring.collaborators.with_tool_executor(tools.clone()));

    let plan = Plan::new(
        "planned",
        PlanSource::Static,
        vec![PlanStep::new(0, "fetch", json!({}))],
    );
    let mut constraints = aegis_conductor_core::domain::plan::PlanConstraints::default();
    constraints.allow_replan = false;

    let node = Node::Standard {
        agent_id: None,
        prompt: None,
        rubric_id: None,
        review: None,
        planning: PlanningConfig {
            mode: PlanningMode::Static,
            constraints,
            review_before_execute: false,
        },
        static_plan: Some(plan),
        plan_failure_target: Some("recover".into()),
        output_params: vec![],
        transitions: vec![TransitionRule::Success { target: "end".into() }],
    };
    let workflow = Workflow::new(
        tenant(),
        "plan-fallback",
        1,
        "planned",
        indexmap! {
            "planned".to_string() => node,
            "recover".to_string() => agent_node("helper", "clean up", "end"),
            "end".to_string() => end_node(),
        },
    )
    .unwrap();

    let executor = WorkflowExecutor::new(collaborators);
    let result = executor
        .execute(Arc::new(workflow), HashMap::new(), ExecutionContext::noop_listener())
        .await;

    let ExecutionResult::Completed { state, .. } = result else {
        panic!("expected Completed via recovery path");
    };
    assert_eq!(steps_of(&state), vec!["planned", "recover", "end"]);
}

// ============================================================================
// Loops
// ============================================================================

#[tokio::test]
async fn test_loop_breaks_on_max_iterations() {
    let wiring = wiring();
    wiring
        .collaborators
        .agents
        .register("worker", FixedAgent::new("working"));

    let loop_node = Node::Loop {
        break_conditions: vec![BreakCondition::ContextTruthy { key: "done".into() }],
        max_iterations: 3,
        transitions: vec![TransitionRule::Success { target: "work".into() }],
    };
    let workflow = Workflow::new(
        tenant(),
        "looping",
        1,
        "work",
        indexmap! {
            "work".to_string() => agent_node("worker", "iterate", "check"),
            "check".to_string() => loop_node,
            "after".to_string() => end_node(),
        },
    )
    .unwrap();

    let executor = WorkflowExecutor::new(Arc::new(wiring.collaborators));
    let result = executor
        .execute(
            Arc::new(workflow),
            HashMap::from([(keys::LOOP_EXIT_TARGET.to_string(), json!("after"))]),
            ExecutionContext::noop_listener(),
        )
        .await;

    let ExecutionResult::Completed { state, .. } = result else {
        panic!("expected Completed");
    };
    assert_eq!(
        steps_of(&state),
        vec!["work", "check", "work", "check", "work", "check", "after"]
    );
}

#[tokio::test]
async fn test_loop_breaks_on_condition() {
    let wiring = wiring();
    // Agent output "done" is written to context under the node id; the break
    // condition watches that key.
    wiring
        .collaborators
        .agents
        .register("worker", FixedAgent::new("finished"));

    let loop_node = Node::Loop {
        break_conditions: vec![BreakCondition::ContextExists { key: "work".into() }],
        max_iterations: 10,
        transitions: vec![TransitionRule::Success { target: "work".into() }],
    };
    let workflow = Workflow::new(
        tenant(),
        "cond-loop",
        1,
        "work",
        indexmap! {
            "work".to_string() => agent_node("worker", "iterate", "check"),
            "check".to_string() => loop_node,
            "after".to_string() => end_node(),
        },
    )
    .unwrap();

    let executor = WorkflowExecutor::new(Arc::new(wiring.collaborators));
    let result = executor
        .execute(
            Arc::new(workflow),
            HashMap::from([(keys::LOOP_EXIT_TARGET.to_string(), json!("after"))]),
            ExecutionContext::noop_listener(),
        )
        .await;

    let ExecutionResult::Completed { state, .. } = result else {
        panic!("expected Completed");
    };
    // One pass through the body, then the condition broke the loop.
    assert_eq!(steps_of(&state), vec!["work", "check", "after"]);
}

// ============================================================================
// Sub-Workflows
// ============================================================================

#[tokio::test]
async fn test_sub_workflow_maps_inputs_and_outputs() {
    let wiring = wiring();
    wiring
        .collaborators
        .agents
        .register("childbot", FixedAgent::new("child says hi"));

    let child = Workflow::new(
        tenant(),
        "child-wf",
        1,
        "greet",
        indexmap! {
            "greet".to_string() => agent_node("childbot", "greet {name}", "end"),
            "end".to_string() => end_node(),
        },
    )
    .unwrap();
    store_workflow(&wiring, &child).await;

    let parent = Workflow::new(
        tenant(),
        "parent-wf",
        1,
        "nested",
        indexmap! {
            "nested".to_string() => Node::SubWorkflow {
                workflow_id: "child-wf".into(),
                input_mapping: HashMap::from([("name".to_string(), "user".to_string())]),
                output_mapping: HashMap::from([("greeting".to_string(), "greet".to_string())]),
                transitions: vec![TransitionRule::Success { target: "end".into() }],
            },
            "end".to_string() => end_node(),
        },
    )
    .unwrap();

    let executor = WorkflowExecutor::new(Arc::new(wiring.collaborators));
    let result = executor
        .execute(
            Arc::new(parent),
            HashMap::from([("user".to_string(), json!("Ada"))]),
            ExecutionContext::noop_listener(),
        )
        .await;

    let ExecutionResult::Completed { state, .. } = result else {
        panic!("expected Completed");
    };
    assert_eq!(state.get_str("greeting"), Some("child says hi"));
}

#[tokio::test]
async fn test_sub_workflow_missing_input_key_fails_node() {
    let wiring = wiring();
    let child = Workflow::new(
        tenant(),
        "child-wf",
        1,
        "end",
        indexmap! { "end".to_string() => end_node() },
    )
    .unwrap();
    store_workflow(&wiring, &child).await;

    let parent = Workflow::new(
        tenant(),
        "parent-wf",
        1,
        "nested",
        indexmap! {
            "nested".to_string() => Node::SubWorkflow {
                workflow_id: "child-wf".into(),
                input_mapping: HashMap::from([("name".to_string(), "missing".to_string())]),
                output_mapping: HashMap::new(),
                transitions: vec![
                    TransitionRule::Success { target: "end".into() },
                    TransitionRule::Failure {
                        retry_count: 0,
                        retry_target: None,
                        else_target: "dead".into(),
                    },
                ],
            },
            "dead".to_string() => Node::End { exit_status: ExitStatus::Failure },
            "end".to_string() => end_node(),
        },
    )
    .unwrap();

    let executor = WorkflowExecutor::new(Arc::new(wiring.collaborators));
    let result = executor
        .execute(Arc::new(parent), HashMap::new(), ExecutionContext::noop_listener())
        .await;

    let ExecutionResult::Completed { exit_status, .. } = result else {
        panic!("expected Completed via failure end");
    };
    assert_eq!(exit_status, ExitStatus::Failure);
}
