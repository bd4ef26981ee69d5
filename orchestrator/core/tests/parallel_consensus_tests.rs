// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Parallel-branch execution and consensus voting, end to end.

mod support;

use std::collections::HashMap;
use std::sync::Arc;

use indexmap::indexmap;
use serde_json::{json, Value};

use aegis_conductor_core::application::context::ExecutionContext;
use aegis_conductor_core::application::executor::WorkflowExecutor;
use aegis_conductor_core::domain::state::{ExecutionResult, HistoryEntry};
use aegis_conductor_core::domain::workflow::{
    Branch, ConsensusConfig, ConsensusStrategy, ExitStatus, Node, TransitionRule, Workflow,
};

use support::*;

fn branch(id: &str, agent_id: &str) -> Branch {
    Branch {
        id: id.into(),
        agent_id: agent_id.into(),
        prompt: Some("evaluate {input}".into()),
        rubric_id: None,
        weight: 1.0,
    }
}

fn parallel_node(
    branches: Vec<Branch>,
    strategy: ConsensusStrategy,
    threshold: Option<f64>,
    judge: Option<&str>,
) -> Node {
    Node::Parallel {
        branches,
        consensus: Some(ConsensusConfig {
            strategy,
            threshold,
            judge_agent_id: judge.map(String::from),
        }),
        transitions: vec![
            TransitionRule::Success { target: "approved".into() },
            TransitionRule::Failure {
                retry_count: 0,
                retry_target: None,
                else_target: "denied".into(),
            },
        ],
    }
}

fn consensus_workflow(node: Node) -> Workflow {
    Workflow::new(
        tenant(),
        "consensus-wf",
        1,
        "vote",
        indexmap! {
            "vote".to_string() => node,
            "approved".to_string() => end_node(),
            "denied".to_string() => Node::End { exit_status: ExitStatus::Failure },
        },
    )
    .unwrap()
}

#[tokio::test]
async fn test_majority_vote_picks_highest_scoring_approver() {
    let wiring = wiring();
    wiring.collaborators.agents.register("a1", FixedAgent::new("score: 85"));
    wiring.collaborators.agents.register("a2", FixedAgent::new("score: 40"));
    wiring.collaborators.agents.register("a3", FixedAgent::new("score: 90"));

    let node = parallel_node(
        vec![branch("b1", "a1"), branch("b2", "a2"), branch("b3", "a3")],
        ConsensusStrategy::MajorityVote,
        Some(0.5),
        None,
    );
    let workflow = consensus_workflow(node);

    let executor = WorkflowExecutor::new(Arc::new(wiring.collaborators));
    let result = executor
        .execute(
            Arc::new(workflow),
            HashMap::from([("input".to_string(), json!("draft"))]),
            ExecutionContext::noop_listener(),
        )
        .await;

    let ExecutionResult::Completed { state, exit_status } = result else {
        panic!("expected Completed");
    };
    assert_eq!(exit_status, ExitStatus::Success, "onConsensus route taken");

    // The winning branch is the highest-score APPROVE vote; its output is
    // the node output extracted into context.
    assert_eq!(state.get_str("vote"), Some("score: 90"));

    let vote_step = state
        .history
        .iter()
        .filter_map(HistoryEntry::as_step)
        .find(|s| s.node_id == "vote")
        .unwrap();
    assert_eq!(
        vote_step.result.metadata.get("winning_branch_id"),
        Some(&json!("b3"))
    );
    assert_eq!(
        vote_step.result.metadata.get("consensus_reached"),
        Some(&json!(true))
    );
}

#[tokio::test]
async fn test_unanimous_fails_on_single_rejection() {
    let wiring = wiring();
    wiring.collaborators.agents.register("yes1", FixedAgent::new("I approve this."));
    wiring.collaborators.agents.register("yes2", FixedAgent::new("Looks good, approve."));
    wiring.collaborators.agents.register("no1", FixedAgent::new("I must reject this."));

    let node = parallel_node(
        vec![branch("b1", "yes1"), branch("b2", "yes2"), branch("b3", "no1")],
        ConsensusStrategy::Unanimous,
        None,
        None,
    );
    let workflow = consensus_workflow(node);

    let executor = WorkflowExecutor::new(Arc::new(wiring.collaborators));
    let result = executor
        .execute(Arc::new(workflow), HashMap::new(), ExecutionContext::noop_listener())
        .await;

    let ExecutionResult::Completed { exit_status, .. } = result else {
        panic!("expected Completed");
    };
    assert_eq!(exit_status, ExitStatus::Failure, "onNoConsensus route taken");
}

#[tokio::test]
async fn test_weighted_vote_respects_branch_weights() {
    let wiring = wiring();
    wiring.collaborators.agents.register("heavy", FixedAgent::new("score: 90, approve"));
    wiring.collaborators.agents.register("light", FixedAgent::new("score: 10, reject"));

    let mut heavy = branch("b1", "heavy");
    heavy.weight = 3.0;
    let light = branch("b2", "light");

    let node = parallel_node(
        vec![heavy, light],
        ConsensusStrategy::WeightedVote,
        Some(0.5),
        None,
    );
    let workflow = consensus_workflow(node);

    let executor = WorkflowExecutor::new(Arc::new(wiring.collaborators));
    let result = executor
        .execute(Arc::new(workflow), HashMap::new(), ExecutionContext::noop_listener())
        .await;

    let ExecutionResult::Completed { exit_status, .. } = result else {
        panic!("expected Completed");
    };
    // (0.9 × 3) / 4 = 0.675 ≥ 0.5.
    assert_eq!(exit_status, ExitStatus::Success);
}

#[tokio::test]
async fn test_judge_decides_with_structured_verdict() {
    let wiring = wiring();
    wiring.collaborators.agents.register("a1", FixedAgent::new("draft alpha"));
    wiring.collaborators.agents.register("a2", FixedAgent::new("draft beta"));
    wiring.collaborators.agents.register(
        "the-judge",
        FixedAgent::new(
            r#"{"decision": "approve", "winning_branch": "b2", "reasoning": "beta is tighter", "final_output": "draft beta"}"#,
        ),
    );

    let node = parallel_node(
        vec![branch("b1", "a1"), branch("b2", "a2")],
        ConsensusStrategy::JudgeDecides,
        None,
        Some("the-judge"),
    );
    let workflow = consensus_workflow(node);

    let executor = WorkflowExecutor::new(Arc::new(wiring.collaborators));
    let result = executor
        .execute(Arc::new(workflow), HashMap::new(), ExecutionContext::noop_listener())
        .await;

    let ExecutionResult::Completed { state, exit_status } = result else {
        panic!("expected Completed");
    };
    assert_eq!(exit_status, ExitStatus::Success);
    assert_eq!(state.get_str("vote"), Some("draft beta"));

    let vote_step = state
        .history
        .iter()
        .filter_map(HistoryEntry::as_step)
        .find(|s| s.node_id == "vote")
        .unwrap();
    assert_eq!(
        vote_step.result.metadata.get("winning_branch_id"),
        Some(&json!("b2"))
    );
    assert_eq!(
        vote_step.result.metadata.get("consensus_reasoning"),
        Some(&json!("beta is tighter"))
    );
}

#[tokio::test]
async fn test_branch_rubric_drives_votes() {
    let wiring = wiring();
    wiring.collaborators.agents.register("a1", FixedAgent::new("plain output"));
    wiring.collaborators.agents.register("a2", FixedAgent::new("plain output"));

    let rubrics = ScriptedRubricEngine::new();
    rubrics.script("b1", vec![evaluation("quality", 20.0, false)]);
    rubrics.script("b2", vec![evaluation("quality", 95.0, true)]);
    let collaborators = wiring.collaborators.with_rubric_engine(rubrics);

    let mut b1 = branch("b1", "a1");
    b1.rubric_id = Some("quality".into());
    let mut b2 = branch("b2", "a2");
    b2.rubric_id = Some("quality".into());

    // Majority of 2 with threshold 1.0: both must approve; one rubric fails.
    let node = parallel_node(
        vec![b1, b2],
        ConsensusStrategy::MajorityVote,
        Some(1.0),
        None,
    );
    let workflow = consensus_workflow(node);

    let executor = WorkflowExecutor::new(Arc::new(collaborators));
    let result = executor
        .execute(Arc::new(workflow), HashMap::new(), ExecutionContext::noop_listener())
        .await;

    let ExecutionResult::Completed { state, exit_status } = result else {
        panic!("expected Completed");
    };
    assert_eq!(exit_status, ExitStatus::Failure);

    let vote_step = state
        .history
        .iter()
        .filter_map(HistoryEntry::as_step)
        .find(|s| s.node_id == "vote")
        .unwrap();
    let votes = vote_step.result.metadata.get("votes").unwrap();
    let decisions: Vec<&str> = votes
        .as_array()
        .unwrap()
        .iter()
        .map(|v| v["decision"].as_str().unwrap())
        .collect();
    assert_eq!(decisions, vec!["REJECT", "APPROVE"]);
}

#[tokio::test]
async fn test_parallel_without_consensus_collects_outputs() {
    let wiring = wiring();
    wiring.collaborators.agents.register("a1", FixedAgent::new("one"));
    wiring.collaborators.agents.register("a2", FixedAgent::new("two"));

    let node = Node::Parallel {
        branches: vec![branch("b1", "a1"), branch("b2", "a2")],
        consensus: None,
        transitions: vec![TransitionRule::Success { target: "approved".into() }],
    };
    let workflow = Workflow::new(
        tenant(),
        "no-consensus",
        1,
        "vote",
        indexmap! {
            "vote".to_string() => node,
            "approved".to_string() => end_node(),
        },
    )
    .unwrap();

    let executor = WorkflowExecutor::new(Arc::new(wiring.collaborators));
    let result = executor
        .execute(Arc::new(workflow), HashMap::new(), ExecutionContext::noop_listener())
        .await;

    let ExecutionResult::Completed { state, .. } = result else {
        panic!("expected Completed");
    };
    let collected: Value = serde_json::from_str(state.get_str("vote").unwrap()).unwrap();
    let ids: Vec<&str> = collected
        .as_array()
        .unwrap()
        .iter()
        .map(|v| v["branch_id"].as_str().unwrap())
        .collect();
    // Declaration order, not completion order.
    assert_eq!(ids, vec!["b1", "b2"]);
}
