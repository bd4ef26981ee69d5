// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Property tests for the engine's universal invariants: result totality,
//! append-only history, public-projection hygiene, snapshot round-trips, and
//! determinism of the rubric and consensus decision functions.

mod support;

use std::collections::HashMap;
use std::sync::Arc;

use indexmap::indexmap;
use proptest::prelude::*;
use serde_json::{json, Value};

use aegis_conductor_core::application::consensus::{
    evaluate_majority, evaluate_unanimous, evaluate_weighted, BranchVote, VoteDecision,
};
use aegis_conductor_core::application::context::ExecutionContext;
use aegis_conductor_core::application::executor::WorkflowExecutor;
use aegis_conductor_core::domain::rubric::{decide_backtrack, BacktrackSeverity};
use aegis_conductor_core::domain::state::{
    ExecutionResult, NodeResult, ServerNodeId, Snapshot, SnapshotStatus, WorkflowState,
};
use aegis_conductor_core::domain::workflow::Workflow;

use support::*;

fn context_key() -> impl Strategy<Value = String> {
    "[a-z_][a-z0-9_]{0,8}"
}

fn context_value() -> impl Strategy<Value = Value> {
    prop_oneof![
        "[ -~]{0,16}".prop_map(Value::from),
        any::<i64>().prop_map(Value::from),
        any::<bool>().prop_map(Value::from),
    ]
}

fn context_map() -> impl Strategy<Value = HashMap<String, Value>> {
    proptest::collection::hash_map(context_key(), context_value(), 0..8)
}

fn scored_workflow() -> Workflow {
    Workflow::new(
        tenant(),
        "scored",
        1,
        "draft",
        indexmap! {
            "draft".to_string() => rubric_node("writer", "r1", "refine"),
            "refine".to_string() => rubric_node("writer", "r2", "end"),
            "end".to_string() => end_node(),
        },
    )
    .unwrap()
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    // (P5) The public projection never leaks an underscore-prefixed key.
    #[test]
    fn prop_public_projection_excludes_reserved_keys(context in context_map()) {
        let mut state = WorkflowState::new("wf", "a");
        state.context = context;
        state.set("_always_reserved", json!(1));

        let public = state.public_context();
        prop_assert!(public.keys().all(|k| !k.starts_with('_')));
        // Nothing user-visible is lost.
        for (key, value) in &state.context {
            if !key.starts_with('_') {
                prop_assert_eq!(public.get(key), Some(value));
            }
        }
    }

    // (R1) Snapshot round-trips the user-visible fields of the state.
    #[test]
    fn prop_snapshot_round_trip(context in context_map(), node in "[a-z]{1,8}") {
        let mut state = WorkflowState::new("wf", node);
        state.context = context;

        let snapshot = Snapshot::from_state(
            tenant(),
            &state,
            SnapshotStatus::Checkpoint,
            ServerNodeId::new(),
        );
        let restored = snapshot.to_state();

        prop_assert_eq!(restored.execution_id, state.execution_id);
        prop_assert_eq!(&restored.workflow_id, &state.workflow_id);
        prop_assert_eq!(&restored.current_node, &state.current_node);
        prop_assert_eq!(&restored.context, &state.context);
    }

    // (P3) Terminal snapshots always release the lease.
    #[test]
    fn prop_terminal_snapshots_clear_lease(context in context_map()) {
        let mut state = WorkflowState::new("wf", "a");
        state.context = context;
        for status in [
            SnapshotStatus::Paused,
            SnapshotStatus::Completed,
            SnapshotStatus::Rejected,
            SnapshotStatus::Failed,
        ] {
            let snapshot =
                Snapshot::from_state(tenant(), &state, status, ServerNodeId::new());
            prop_assert!(snapshot.server_node_id.is_none());
        }
    }

    // (P2) History only ever grows, whatever mix of steps and backtracks.
    #[test]
    fn prop_history_is_append_only(ops in proptest::collection::vec(any::<bool>(), 1..20)) {
        let mut state = WorkflowState::new("wf", "a");
        let mut expected = 0usize;
        for is_step in ops {
            let before = state.history.len();
            if is_step {
                state.record_step("a", NodeResult::success("x"));
            } else {
                state.record_backtrack(
                    "a",
                    "b",
                    "because",
                    aegis_conductor_core::domain::state::BacktrackType::Automatic,
                    Some(42.0),
                );
            }
            expected += 1;
            prop_assert_eq!(state.history.len(), before + 1);
            prop_assert_eq!(state.history.len(), expected);
        }
    }

    // (R2) The backtrack decision is a pure function of its inputs, and its
    // severity bands match the documented thresholds.
    #[test]
    fn prop_backtrack_decision_is_deterministic(score in 0.0f64..100.0) {
        let workflow = scored_workflow();
        let mut state = WorkflowState::new("scored", "draft");
        state.record_step("draft", NodeResult::success("one"));
        state.record_step("refine", NodeResult::success("two"));

        let first = decide_backtrack(score, "refine", &state.history, &workflow);
        let second = decide_backtrack(score, "refine", &state.history, &workflow);
        prop_assert_eq!(&first, &second);

        match first {
            None => prop_assert!(score >= 80.0),
            Some(d) => match d.severity {
                BacktrackSeverity::Minor => {
                    prop_assert!((60.0..80.0).contains(&score));
                    prop_assert_eq!(d.target, "refine");
                }
                BacktrackSeverity::Moderate => {
                    prop_assert!((30.0..60.0).contains(&score));
                    prop_assert_eq!(d.target, "draft");
                }
                BacktrackSeverity::Critical => {
                    prop_assert!(score < 30.0);
                    prop_assert_eq!(d.target, "draft");
                }
            },
        }
    }

    // (R3) The counting strategies are deterministic given the votes.
    #[test]
    fn prop_consensus_strategies_deterministic(
        decisions in proptest::collection::vec(0u8..3, 1..8),
        threshold in proptest::option::of(0.0f64..1.0),
    ) {
        let votes: Vec<BranchVote> = decisions
            .iter()
            .enumerate()
            .map(|(i, d)| BranchVote {
                branch_id: format!("b{i}"),
                decision: match d {
                    0 => VoteDecision::Approve,
                    1 => VoteDecision::Reject,
                    _ => VoteDecision::Abstain,
                },
                score: 50.0 + (*d as f64) * 10.0,
                weight: 1.0 + (i as f64),
            })
            .collect();

        prop_assert_eq!(
            evaluate_majority(&votes, threshold),
            evaluate_majority(&votes, threshold)
        );
        prop_assert_eq!(evaluate_unanimous(&votes), evaluate_unanimous(&votes));
        prop_assert_eq!(
            evaluate_weighted(&votes, threshold),
            evaluate_weighted(&votes, threshold)
        );

        // Unanimity implies a majority at any threshold.
        if evaluate_unanimous(&votes) {
            prop_assert!(evaluate_majority(&votes, threshold));
        }
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(12))]

    // (P1) Execution always terminates in one of the four result variants.
    #[test]
    fn prop_execute_is_total(input in "[ -~]{0,24}") {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .expect("runtime");

        runtime.block_on(async move {
            let wiring = wiring();
            wiring
                .collaborators
                .agents
                .register("fake", FixedAgent::new("ok"));

            let workflow = Workflow::new(
                tenant(),
                "tiny",
                1,
                "stepA",
                indexmap! {
                    "stepA".to_string() => agent_node("fake", "{input}", "end"),
                    "end".to_string() => end_node(),
                },
            )
            .unwrap();

            let executor = WorkflowExecutor::new(Arc::new(wiring.collaborators));
            let result = executor
                .execute(
                    Arc::new(workflow),
                    HashMap::from([("input".to_string(), json!(input))]),
                    ExecutionContext::noop_listener(),
                )
                .await;

            // Matching is exhaustive: the result is always a concrete variant.
            match result {
                ExecutionResult::Completed { .. }
                | ExecutionResult::Paused { .. }
                | ExecutionResult::Rejected { .. }
                | ExecutionResult::Failure { .. } => {}
            }
        });
    }
}
