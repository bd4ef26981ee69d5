// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! Rubric scoring and the auto-backtrack decision function.
//!
//! Rubrics themselves (markdown schemas, criteria weights) are parsed and
//! evaluated by an external engine behind [`RubricEngine`]; the domain only
//! sees the resulting [`RubricEvaluation`]. The severity thresholds below are
//! part of the engine contract and must not drift:
//!
//! | Score | Action |
//! |---|---|
//! | `< 30` | Critical — restart at the earliest rubric-bearing step |
//! | `30 ≤ s < 60` | Moderate — jump to the previous phase (different rubric) |
//! | `60 ≤ s < 80` | Minor — retry the current node |
//! | `≥ 80` | none |

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;

use crate::domain::error::EngineError;
use crate::domain::state::HistoryEntry;
use crate::domain::workflow::Workflow;

/// Outcome of scoring a node result against a rubric. Scores are 0–100.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RubricEvaluation {
    pub rubric_id: String,
    pub score: f64,
    pub passed: bool,
    #[serde(default)]
    pub failed_criteria: Vec<String>,
    #[serde(default)]
    pub suggestions: Vec<String>,
}

/// External rubric engine contract. Implementations parse rubric definitions
/// out-of-band and score raw node output against them.
#[async_trait]
pub trait RubricEngine: Send + Sync {
    async fn evaluate(
        &self,
        rubric_id: &str,
        node_id: &str,
        output: &str,
        context: &HashMap<String, Value>,
    ) -> Result<RubricEvaluation, EngineError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BacktrackSeverity {
    Critical,
    Moderate,
    Minor,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BacktrackDecision {
    pub severity: BacktrackSeverity,
    pub target: String,
}

/// Pure decision function mapping a failed rubric score to a backtrack target.
///
/// Deterministic in `(score, current_node, history, workflow)`: the same
/// inputs always produce the same decision.
pub fn decide_backtrack(
    score: f64,
    current_node: &str,
    history: &[HistoryEntry],
    workflow: &Workflow,
) -> Option<BacktrackDecision> {
    if score >= 80.0 {
        return None;
    }

    if score >= 60.0 {
        // Minor: retry in place.
        return Some(BacktrackDecision {
            severity: BacktrackSeverity::Minor,
            target: current_node.to_string(),
        });
    }

    if score >= 30.0 {
        // Moderate: most recent step whose rubric differs from the current one.
        let current_rubric = workflow.node_rubric(current_node);
        let target = history
            .iter()
            .rev()
            .filter_map(HistoryEntry::as_step)
            .find(|step| {
                let rubric = workflow.node_rubric(&step.node_id);
                rubric.is_some() && rubric != current_rubric
            })
            .map(|step| step.node_id.clone());
        return target.map(|target| BacktrackDecision {
            severity: BacktrackSeverity::Moderate,
            target,
        });
    }

    // Critical: earliest rubric-bearing step, falling back to the start node.
    let target = history
        .iter()
        .filter_map(HistoryEntry::as_step)
        .find(|step| workflow.node_rubric(&step.node_id).is_some())
        .map(|step| step.node_id.clone())
        .unwrap_or_else(|| workflow.start_node.clone());
    Some(BacktrackDecision {
        severity: BacktrackSeverity::Critical,
        target,
    })
}
