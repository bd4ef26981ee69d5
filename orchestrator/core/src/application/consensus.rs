// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! Consensus evaluation over parallel branch results.
//!
//! Vote extraction walks a fixed priority ladder per branch: rubric metadata,
//! numeric score metadata, a score regex over the output text, a keyword
//! sniff, and finally a threshold fallback around a neutral score of 50.
//! The three vote-counting strategies are pure functions of the votes —
//! deterministic given the same inputs; only `JudgeDecides` consults an agent.

use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::OnceLock;
use tracing::{debug, warn};

use crate::domain::agent::{AgentRegistry, AgentResponse};
use crate::domain::error::EngineError;
use crate::domain::state::{NodeResult, NodeStatus};
use crate::domain::workflow::{ConsensusConfig, ConsensusStrategy};

/// Neutral score assumed when a branch reports nothing measurable.
const NEUTRAL_SCORE: f64 = 50.0;
/// Fallback approval threshold when the config leaves it unset.
const FALLBACK_THRESHOLD: f64 = 70.0;

fn score_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r#"(?i)(score|rating)[":\s]*([0-9]+(?:\.[0-9]+)?)"#).expect("static regex")
    })
}

// ============================================================================
// Votes
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum VoteDecision {
    Approve,
    Reject,
    Abstain,
}

/// Result of one parallel branch, as handed to consensus.
#[derive(Debug, Clone)]
pub struct BranchResult {
    pub branch_id: String,
    pub weight: f64,
    pub result: NodeResult,
    pub execution_time_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BranchVote {
    pub branch_id: String,
    pub decision: VoteDecision,
    pub score: f64,
    pub weight: f64,
}

/// Extract a vote from one branch result. Pure.
pub fn extract_vote(branch: &BranchResult, config: &ConsensusConfig) -> BranchVote {
    // A branch that failed outright votes to reject.
    if branch.result.status == NodeStatus::Failure {
        return BranchVote {
            branch_id: branch.branch_id.clone(),
            decision: VoteDecision::Reject,
            score: 0.0,
            weight: branch.weight,
        };
    }

    let metadata = &branch.result.metadata;
    let output = branch.result.output.as_deref().unwrap_or_default();

    // 1. Rubric verdict wins outright.
    if let Some(passed) = metadata.get("rubric_passed").and_then(Value::as_bool) {
        let score = metadata
            .get("rubric_score")
            .and_then(Value::as_f64)
            .unwrap_or(NEUTRAL_SCORE);
        return BranchVote {
            branch_id: branch.branch_id.clone(),
            decision: if passed {
                VoteDecision::Approve
            } else {
                VoteDecision::Reject
            },
            score,
            weight: branch.weight,
        };
    }

    // 2. Numeric score metadata, else 3. a score mention in the output text.
    let mut score = metadata.get("score").and_then(Value::as_f64);
    if score.is_none() {
        score = score_regex()
            .captures(output)
            .and_then(|caps| caps.get(2))
            .and_then(|m| m.as_str().parse().ok());
    }

    // 4. Keyword sniff on the lowercased output.
    let lower = output.to_lowercase();
    let decision = if ["approve", "accept", "pass"].iter().any(|k| lower.contains(k)) {
        Some(VoteDecision::Approve)
    } else if ["reject", "deny", "fail"].iter().any(|k| lower.contains(k)) {
        Some(VoteDecision::Reject)
    } else if ["abstain", "neutral"].iter().any(|k| lower.contains(k)) {
        Some(VoteDecision::Abstain)
    } else {
        None
    };

    // 5. Threshold fallback around the neutral score.
    let score = score.unwrap_or(NEUTRAL_SCORE);
    let decision = decision.unwrap_or_else(|| {
        let threshold = config.threshold.unwrap_or(FALLBACK_THRESHOLD);
        if score >= threshold {
            VoteDecision::Approve
        } else if score < threshold - 20.0 {
            VoteDecision::Reject
        } else {
            VoteDecision::Abstain
        }
    });

    BranchVote {
        branch_id: branch.branch_id.clone(),
        decision,
        score,
        weight: branch.weight,
    }
}

// ============================================================================
// Outcome
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConsensusOutcome {
    pub reached: bool,
    pub strategy: ConsensusStrategy,
    pub winning_branch_id: Option<String>,
    pub final_output: Option<String>,
    pub reasoning: Option<String>,
    pub votes: Vec<BranchVote>,
}

impl ConsensusOutcome {
    pub fn to_metadata(&self) -> HashMap<String, Value> {
        let mut metadata = HashMap::new();
        metadata.insert("consensus_reached".to_string(), json!(self.reached));
        metadata.insert(
            "consensus_strategy".to_string(),
            serde_json::to_value(self.strategy).unwrap_or(Value::Null),
        );
        if let Some(winner) = &self.winning_branch_id {
            metadata.insert("winning_branch_id".to_string(), json!(winner));
        }
        if let Some(reasoning) = &self.reasoning {
            metadata.insert("consensus_reasoning".to_string(), json!(reasoning));
        }
        metadata.insert(
            "votes".to_string(),
            serde_json::to_value(&self.votes).unwrap_or(Value::Null),
        );
        metadata
    }
}

/// Winning branch: the highest-scoring approving vote.
fn winning_branch<'a>(votes: &'a [BranchVote]) -> Option<&'a BranchVote> {
    votes
        .iter()
        .filter(|v| v.decision == VoteDecision::Approve)
        .max_by(|a, b| a.score.partial_cmp(&b.score).unwrap_or(std::cmp::Ordering::Equal))
}

fn output_of<'a>(branches: &'a [BranchResult], branch_id: &str) -> Option<&'a str> {
    branches
        .iter()
        .find(|b| b.branch_id == branch_id)
        .and_then(|b| b.result.output.as_deref())
}

/// Majority vote: approvals must reach `⌈total × threshold⌉` (threshold
/// defaults to 0.5). Pure and deterministic.
pub fn evaluate_majority(votes: &[BranchVote], threshold: Option<f64>) -> bool {
    if votes.is_empty() {
        return false;
    }
    let threshold = threshold.unwrap_or(0.5);
    let needed = (votes.len() as f64 * threshold).ceil() as usize;
    let approvals = votes
        .iter()
        .filter(|v| v.decision == VoteDecision::Approve)
        .count();
    approvals >= needed.max(1)
}

/// Unanimous: every branch approves. Pure and deterministic.
pub fn evaluate_unanimous(votes: &[BranchVote]) -> bool {
    !votes.is_empty() && votes.iter().all(|v| v.decision == VoteDecision::Approve)
}

/// Weighted vote: normalized approve mass over the approve+reject weight
/// total must reach the threshold (default 0.5). Abstainers sit out. Pure.
pub fn evaluate_weighted(votes: &[BranchVote], threshold: Option<f64>) -> bool {
    let threshold = threshold.unwrap_or(0.5);
    let approve_mass: f64 = votes
        .iter()
        .filter(|v| v.decision == VoteDecision::Approve)
        .map(|v| (v.score / 100.0) * v.weight)
        .sum();
    let counted_weight: f64 = votes
        .iter()
        .filter(|v| v.decision != VoteDecision::Abstain)
        .map(|v| v.weight)
        .sum();
    if counted_weight <= 0.0 {
        return false;
    }
    approve_mass / counted_weight >= threshold
}

// ============================================================================
// Evaluator
// ============================================================================

pub struct ConsensusEvaluator {
    agents: Arc<AgentRegistry>,
}

impl ConsensusEvaluator {
    pub fn new(agents: Arc<AgentRegistry>) -> Self {
        Self { agents }
    }

    pub async fn evaluate(
        &self,
        node_id: &str,
        branches: &[BranchResult],
        config: &ConsensusConfig,
        context: &HashMap<String, Value>,
    ) -> Result<ConsensusOutcome, EngineError> {
        let votes: Vec<BranchVote> = branches.iter().map(|b| extract_vote(b, config)).collect();

        let outcome = match config.strategy {
            ConsensusStrategy::MajorityVote => {
                self.counted_outcome(branches, votes, config.strategy, |v| {
                    evaluate_majority(v, config.threshold)
                })
            }
            ConsensusStrategy::Unanimous => {
                self.counted_outcome(branches, votes, config.strategy, evaluate_unanimous)
            }
            ConsensusStrategy::WeightedVote => {
                self.counted_outcome(branches, votes, config.strategy, |v| {
                    evaluate_weighted(v, config.threshold)
                })
            }
            ConsensusStrategy::JudgeDecides => {
                self.judge_outcome(node_id, branches, votes, config, context)
                    .await?
            }
        };

        debug!(
            node_id = %node_id,
            reached = outcome.reached,
            winner = outcome.winning_branch_id.as_deref().unwrap_or("-"),
            "consensus evaluated"
        );
        Ok(outcome)
    }

    fn counted_outcome(
        &self,
        branches: &[BranchResult],
        votes: Vec<BranchVote>,
        strategy: ConsensusStrategy,
        decide: impl Fn(&[BranchVote]) -> bool,
    ) -> ConsensusOutcome {
        let reached = decide(&votes);
        let winner = winning_branch(&votes).map(|v| v.branch_id.clone());
        let final_output = winner
            .as_deref()
            .and_then(|id| output_of(branches, id))
            .map(String::from);
        ConsensusOutcome {
            reached,
            strategy,
            winning_branch_id: winner,
            final_output,
            reasoning: None,
            votes,
        }
    }

    /// Hand the full vote table to a judge agent and parse its verdict.
    async fn judge_outcome(
        &self,
        node_id: &str,
        branches: &[BranchResult],
        votes: Vec<BranchVote>,
        config: &ConsensusConfig,
        context: &HashMap<String, Value>,
    ) -> Result<ConsensusOutcome, EngineError> {
        let judge_id = config.judge_agent_id.as_deref().ok_or_else(|| {
            EngineError::IllegalState(format!(
                "JUDGE_DECIDES on node '{node_id}' without judge_agent_id"
            ))
        })?;
        let judge = self
            .agents
            .get(judge_id)
            .ok_or_else(|| EngineError::AgentNotFound(judge_id.to_string()))?;

        let mut prompt = String::from(
            "You are the deciding judge over parallel agent results. \
             For each branch below, consider its vote, score, and output.\n\n",
        );
        for vote in &votes {
            let output = output_of(branches, &vote.branch_id).unwrap_or("");
            prompt.push_str(&format!(
                "Branch '{}': vote={:?}, score={:.1}\nOutput:\n{}\n\n",
                vote.branch_id, vote.decision, vote.score, output
            ));
        }
        prompt.push_str(
            "Respond in JSON with fields: decision (\"approve\" or \"reject\"), \
             winning_branch, reasoning, final_output.",
        );

        let response = judge.execute(&prompt, context).await?;
        let content = match response {
            AgentResponse::Text { content, .. } => content,
            AgentResponse::Error { message } => return Err(EngineError::Agent(message)),
            other => {
                return Err(EngineError::Agent(format!(
                    "judge returned unsupported response: {other:?}"
                )))
            }
        };

        let body = strip_code_fences(&content);
        let parsed: Option<Value> = serde_json::from_str(body.trim()).ok();
        let lower = body.to_lowercase();

        let reached = parsed
            .as_ref()
            .and_then(|v| v.get("decision"))
            .and_then(Value::as_str)
            .map(|d| d.eq_ignore_ascii_case("approve"))
            .unwrap_or_else(|| {
                // Fall back to sniffing the body when the JSON is mangled.
                if lower.contains("approve") {
                    true
                } else {
                    if !lower.contains("reject") {
                        warn!(node_id = %node_id, "judge verdict unparseable; treating as reject");
                    }
                    false
                }
            });

        let winning_branch_id = parsed
            .as_ref()
            .and_then(|v| v.get("winning_branch"))
            .and_then(Value::as_str)
            .map(String::from)
            .or_else(|| winning_branch(&votes).map(|v| v.branch_id.clone()));
        let reasoning = parsed
            .as_ref()
            .and_then(|v| v.get("reasoning"))
            .and_then(Value::as_str)
            .map(String::from);
        let final_output = parsed
            .as_ref()
            .and_then(|v| v.get("final_output"))
            .and_then(Value::as_str)
            .map(String::from)
            .or_else(|| {
                winning_branch_id
                    .as_deref()
                    .and_then(|id| output_of(branches, id))
                    .map(String::from)
            });

        Ok(ConsensusOutcome {
            reached,
            strategy: ConsensusStrategy::JudgeDecides,
            winning_branch_id,
            final_output,
            reasoning,
            votes,
        })
    }
}

/// LLMs habitually wrap JSON in markdown fences; unwrap before parsing.
fn strip_code_fences(text: &str) -> &str {
    let trimmed = text.trim();
    if let Some(rest) = trimmed.strip_prefix("```") {
        let rest = rest.trim_start_matches(|c: char| c.is_ascii_alphanumeric());
        if let Some(end) = rest.rfind("```") {
            return &rest[..end];
        }
        return rest;
    }
    trimmed
}
