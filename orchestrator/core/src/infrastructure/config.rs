// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! Engine configuration.
//!
//! All values carry the documented defaults so an empty config deserializes
//! to a working engine. Durations accept humantime strings (`"30s"`, `"2m"`).

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::domain::plan::{DEFAULT_MAX_REPLANS, DEFAULT_MAX_STEPS};
use crate::domain::validation::DEFAULT_MAX_OUTPUT_BYTES;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct EngineConfig {
    /// How often lease heartbeats fire.
    #[serde(default = "default_heartbeat_interval", with = "humantime_serde")]
    pub heartbeat_interval: Duration,

    /// How often the recovery sweeper runs.
    #[serde(default = "default_recovery_interval", with = "humantime_serde")]
    pub recovery_interval: Duration,

    /// Lease age before a snapshot is claimable by another instance.
    #[serde(default = "default_stale_threshold", with = "humantime_serde")]
    pub stale_threshold: Duration,

    #[serde(default)]
    pub mcp: McpConfig,

    #[serde(default)]
    pub plan: PlanDefaults,

    /// Byte cap applied to agent output before it enters context.
    #[serde(default = "default_max_output_bytes")]
    pub max_output_bytes: usize,

    /// Width of the per-workflow parallel-branch semaphore.
    #[serde(default = "default_branch_concurrency")]
    pub branch_concurrency: usize,

    /// Event bus broadcast capacity.
    #[serde(default = "default_event_capacity")]
    pub event_capacity: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct McpConfig {
    #[serde(default = "default_connection_timeout", with = "humantime_serde")]
    pub connection_timeout: Duration,

    #[serde(default = "default_read_timeout", with = "humantime_serde")]
    pub read_timeout: Duration,

    /// Per-client downstream push queue depth; overflow drops the oldest.
    #[serde(default = "default_emitter_queue_capacity")]
    pub emitter_queue_capacity: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct PlanDefaults {
    #[serde(default = "default_plan_max_steps")]
    pub max_steps: u32,

    #[serde(default = "default_plan_max_replans")]
    pub max_replans: u32,
}

fn default_heartbeat_interval() -> Duration {
    Duration::from_secs(30)
}

fn default_recovery_interval() -> Duration {
    Duration::from_secs(60)
}

fn default_stale_threshold() -> Duration {
    Duration::from_secs(90)
}

fn default_connection_timeout() -> Duration {
    Duration::from_secs(30)
}

fn default_read_timeout() -> Duration {
    Duration::from_secs(60)
}

fn default_emitter_queue_capacity() -> usize {
    256
}

fn default_plan_max_steps() -> u32 {
    DEFAULT_MAX_STEPS
}

fn default_plan_max_replans() -> u32 {
    DEFAULT_MAX_REPLANS
}

fn default_max_output_bytes() -> usize {
    DEFAULT_MAX_OUTPUT_BYTES
}

fn default_branch_concurrency() -> usize {
    10
}

fn default_event_capacity() -> usize {
    1024
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval: default_heartbeat_interval(),
            recovery_interval: default_recovery_interval(),
            stale_threshold: default_stale_threshold(),
            mcp: McpConfig::default(),
            plan: PlanDefaults::default(),
            max_output_bytes: default_max_output_bytes(),
            branch_concurrency: default_branch_concurrency(),
            event_capacity: default_event_capacity(),
        }
    }
}

impl Default for McpConfig {
    fn default() -> Self {
        Self {
            connection_timeout: default_connection_timeout(),
            read_timeout: default_read_timeout(),
            emitter_queue_capacity: default_emitter_queue_capacity(),
        }
    }
}

impl Default for PlanDefaults {
    fn default() -> Self {
        Self {
            max_steps: default_plan_max_steps(),
            max_replans: default_plan_max_replans(),
        }
    }
}
