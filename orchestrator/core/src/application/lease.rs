// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! Distributed lease heartbeat and recovery sweeper.
//!
//! Every non-terminal snapshot carries the owning instance's `server_node_id`
//! and a heartbeat timestamp. The heartbeat job refreshes owned rows; the
//! sweeper atomically claims rows whose heartbeat is older than the stale
//! threshold and replays them from their last checkpoint on this instance.
//! A sweeper never cancels a live owner — staleness is the only claim
//! condition, and a returning owner aborts on its next (rejected) save.

use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::application::context::Collaborators;
use crate::application::execution_service::ExecutionService;
use crate::domain::error::EngineError;
use crate::domain::state::ServerNodeId;

pub struct LeaseService {
    services: Arc<Collaborators>,
    execution_service: Arc<ExecutionService>,
}

/// Handles to the spawned background jobs; dropping the token stops both.
pub struct LeaseHandles {
    pub heartbeat: JoinHandle<()>,
    pub sweeper: JoinHandle<()>,
    cancel: CancellationToken,
}

impl LeaseHandles {
    pub fn shutdown(&self) {
        self.cancel.cancel();
    }
}

impl LeaseService {
    pub fn new(services: Arc<Collaborators>, execution_service: Arc<ExecutionService>) -> Arc<Self> {
        Arc::new(Self {
            services,
            execution_service,
        })
    }

    pub fn server_node_id(&self) -> ServerNodeId {
        self.services.server_node_id
    }

    /// Spawn the heartbeat and sweeper jobs at their configured intervals.
    pub fn spawn(self: &Arc<Self>) -> LeaseHandles {
        let cancel = CancellationToken::new();

        let heartbeat = {
            let service = Arc::clone(self);
            let cancel = cancel.clone();
            let interval = service.services.config.heartbeat_interval;
            tokio::spawn(async move {
                let mut ticker = tokio::time::interval(interval);
                ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
                loop {
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        _ = ticker.tick() => {
                            if let Err(e) = service.heartbeat_once().await {
                                warn!(error = %e, "lease heartbeat failed");
                            }
                        }
                    }
                }
            })
        };

        let sweeper = {
            let service = Arc::clone(self);
            let cancel = cancel.clone();
            let interval = service.services.config.recovery_interval;
            tokio::spawn(async move {
                let mut ticker = tokio::time::interval(interval);
                ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
                loop {
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        _ = ticker.tick() => {
                            if let Err(e) = service.sweep_once().await {
                                warn!(error = %e, "recovery sweep failed");
                            }
                        }
                    }
                }
            })
        };

        info!(
            server_node_id = %self.services.server_node_id,
            heartbeat = ?self.services.config.heartbeat_interval,
            recovery = ?self.services.config.recovery_interval,
            "lease jobs started"
        );

        LeaseHandles {
            heartbeat,
            sweeper,
            cancel,
        }
    }

    /// Refresh `last_heartbeat_at` on every snapshot this instance owns.
    pub async fn heartbeat_once(&self) -> Result<u64, EngineError> {
        let touched = self
            .services
            .states
            .update_heartbeats(self.services.server_node_id)
            .await?;
        if touched > 0 {
            debug!(touched, "lease heartbeats refreshed");
        }
        Ok(touched)
    }

    /// Claim every stale non-terminal snapshot and replay it from its last
    /// checkpoint. Returns the number of executions claimed.
    pub async fn sweep_once(&self) -> Result<usize, EngineError> {
        let stale_before = chrono::Utc::now()
            - chrono::Duration::from_std(self.services.config.stale_threshold)
                .unwrap_or_else(|_| chrono::Duration::seconds(90));

        let claimed = self
            .services
            .states
            .claim_stale_executions(self.services.server_node_id, stale_before)
            .await?;

        if claimed.is_empty() {
            return Ok(0);
        }

        info!(count = claimed.len(), "claimed stale executions");
        metrics::counter!("conductor_stale_claims_total").increment(claimed.len() as u64);

        let mut resumed = 0;
        for snapshot in claimed {
            let execution_id = snapshot.execution_id;
            match self.execution_service.resume_claimed(snapshot).await {
                Ok(()) => resumed += 1,
                Err(e) => {
                    warn!(execution_id = %execution_id, error = %e, "failed to resume claimed execution");
                }
            }
        }
        Ok(resumed)
    }
}
