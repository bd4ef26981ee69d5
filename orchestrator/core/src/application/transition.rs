// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! Transition rule evaluation.
//!
//! Rules are scanned in declared order; the first one producing a target
//! wins. Loop bookkeeping runs first: a pending `loop_break_target` is
//! consumed before any rule is consulted. A `Loop` node whose rules yield
//! nothing falls back to the `loop_exit_target` context key.

use serde_json::Value;
use std::collections::HashMap;
use tracing::debug;

use crate::domain::rubric::RubricEvaluation;
use crate::domain::state::{keys, NodeResult, NodeStatus, WorkflowState};
use crate::domain::workflow::{Node, TransitionRule};

/// Self-reported score keys, consulted in this order when no rubric
/// evaluation is attached to the state.
const SCORE_KEYS: [&str; 4] = ["score", "final_score", "quality_score", "evaluation_score"];

/// Evaluate the node's transition rules. `retry_counts` tracks per-node
/// `Failure`-rule retries and is incremented when a retry is taken.
pub fn evaluate_transitions(
    node_id: &str,
    node: &Node,
    result: &NodeResult,
    state: &mut WorkflowState,
    retry_counts: &mut HashMap<String, u32>,
) -> Option<String> {
    // Loop bookkeeping first: a break target set by the loop executor wins.
    if let Some(target) = state.loop_break_target.take() {
        debug!(node_id = %node_id, target = %target, "consuming loop break target");
        return Some(target);
    }

    let score = score_for(state);

    for rule in node.transitions() {
        match rule {
            TransitionRule::Success { target } => {
                if result.status == NodeStatus::Success {
                    return Some(target.clone());
                }
            }
            TransitionRule::Failure {
                retry_count,
                retry_target,
                else_target,
            } => {
                if result.status == NodeStatus::Failure {
                    let attempts = retry_counts.entry(node_id.to_string()).or_insert(0);
                    if *attempts < *retry_count {
                        *attempts += 1;
                        let target = retry_target.clone().unwrap_or_else(|| node_id.to_string());
                        debug!(node_id = %node_id, attempt = *attempts, "failure retry");
                        return Some(target);
                    }
                    return Some(else_target.clone());
                }
            }
            TransitionRule::Score { conditions } => {
                if let Some(score) = score {
                    for condition in conditions {
                        if condition.matches(score) {
                            return Some(condition.target.clone());
                        }
                    }
                }
            }
        }
    }

    // Loop nodes with no matching rule exit through the configured target.
    if matches!(node, Node::Loop { .. }) {
        return state.get_str(keys::LOOP_EXIT_TARGET).map(String::from);
    }

    None
}

/// Target produced by the node's `Score` rules for a given score, if any.
/// Used by the rubric processor: a matching score rule suppresses
/// auto-backtracking for the node.
pub fn score_rule_target(node: &Node, score: f64) -> Option<String> {
    for rule in node.transitions() {
        if let TransitionRule::Score { conditions } = rule {
            for condition in conditions {
                if condition.matches(score) {
                    return Some(condition.target.clone());
                }
            }
        }
    }
    None
}

/// Score source priority: rubric evaluation on the state, then the known
/// self-reported context keys.
pub fn score_for(state: &WorkflowState) -> Option<f64> {
    if let Some(RubricEvaluation { score, .. }) = &state.rubric_evaluation {
        return Some(*score);
    }
    for key in SCORE_KEYS {
        if let Some(value) = state.get(key) {
            if let Some(score) = value_as_score(value) {
                return Some(score);
            }
        }
    }
    None
}

fn value_as_score(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}
