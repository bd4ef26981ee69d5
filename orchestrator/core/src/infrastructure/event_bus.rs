// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

// Event Bus Implementation - Pub/Sub for Execution Events
//
// In-memory event streaming on tokio broadcast channels. Subscribers that
// fall behind observe `Lagged(n)` and lose the oldest events; publishing
// never blocks the traversal task. Events are lost on restart — durable
// history lives in snapshots, not here.

use std::collections::HashMap;
use std::sync::Arc;

use serde_json::Value;
use tokio::sync::broadcast;
use tracing::warn;

use crate::domain::events::{ExecutionEvent, ExecutionListener};
use crate::domain::plan::PlanEvent;
use crate::domain::state::{BacktrackEvent, ExecutionId, NodeResult, Snapshot};

/// Event bus for publishing and subscribing to execution events.
#[derive(Clone)]
pub struct EventBus {
    sender: Arc<broadcast::Sender<ExecutionEvent>>,
}

impl EventBus {
    /// Create a new event bus with the given channel capacity.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self {
            sender: Arc::new(sender),
        }
    }

    /// Create an event bus with the default capacity (1024).
    pub fn with_default_capacity() -> Self {
        Self::new(1024)
    }

    pub fn publish(&self, event: ExecutionEvent) {
        // send() only fails when there are no subscribers; that is fine.
        let _ = self.sender.send(event);
    }

    /// Subscribe to all execution events.
    pub fn subscribe(&self) -> EventReceiver {
        EventReceiver {
            receiver: self.sender.subscribe(),
        }
    }

    /// Subscribe filtered to a single execution.
    pub fn subscribe_execution(&self, execution_id: ExecutionId) -> ExecutionEventReceiver {
        ExecutionEventReceiver {
            receiver: self.sender.subscribe(),
            execution_id,
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

#[derive(Debug, thiserror::Error)]
pub enum EventBusError {
    #[error("event bus closed")]
    Closed,
    #[error("receiver lagged by {0} events")]
    Lagged(u64),
    #[error("no event available")]
    Empty,
}

pub struct EventReceiver {
    receiver: broadcast::Receiver<ExecutionEvent>,
}

impl EventReceiver {
    pub async fn recv(&mut self) -> Result<ExecutionEvent, EventBusError> {
        self.receiver.recv().await.map_err(|e| match e {
            broadcast::error::RecvError::Closed => EventBusError::Closed,
            broadcast::error::RecvError::Lagged(n) => {
                warn!("event receiver lagged by {} events", n);
                EventBusError::Lagged(n)
            }
        })
    }

    pub fn try_recv(&mut self) -> Result<ExecutionEvent, EventBusError> {
        self.receiver.try_recv().map_err(|e| match e {
            broadcast::error::TryRecvError::Empty => EventBusError::Empty,
            broadcast::error::TryRecvError::Closed => EventBusError::Closed,
            broadcast::error::TryRecvError::Lagged(n) => EventBusError::Lagged(n),
        })
    }
}

pub struct ExecutionEventReceiver {
    receiver: broadcast::Receiver<ExecutionEvent>,
    execution_id: ExecutionId,
}

impl ExecutionEventReceiver {
    /// Receive the next event belonging to the subscribed execution.
    pub async fn recv(&mut self) -> Result<ExecutionEvent, EventBusError> {
        loop {
            let event = self.receiver.recv().await.map_err(|e| match e {
                broadcast::error::RecvError::Closed => EventBusError::Closed,
                broadcast::error::RecvError::Lagged(n) => EventBusError::Lagged(n),
            })?;
            if event_execution_id(&event) == Some(self.execution_id) {
                return Ok(event);
            }
        }
    }
}

fn event_execution_id(event: &ExecutionEvent) -> Option<ExecutionId> {
    use ExecutionEvent::*;
    Some(match event {
        ExecutionStarted { execution_id, .. }
        | NodeStarted { execution_id, .. }
        | NodeCompleted { execution_id, .. }
        | AgentStarted { execution_id, .. }
        | AgentCompleted { execution_id, .. }
        | PlannerStarted { execution_id, .. }
        | PlannerCompleted { execution_id, .. }
        | Checkpoint { execution_id, .. }
        | Backtracked { execution_id, .. }
        | Plan { execution_id, .. }
        | ConsensusEvaluated { execution_id, .. }
        | ExecutionCompleted { execution_id, .. }
        | ExecutionPaused { execution_id, .. }
        | ExecutionRejected { execution_id, .. }
        | ExecutionError { execution_id, .. } => *execution_id,
    })
}

// ============================================================================
// Listener Adapter
// ============================================================================

/// Bridges the synchronous [`ExecutionListener`] callbacks onto the bus.
/// Publishing is non-blocking, so slow subscribers never back up traversal.
pub struct BroadcastListener {
    bus: EventBus,
}

impl BroadcastListener {
    pub fn new(bus: EventBus) -> Self {
        Self { bus }
    }
}

impl ExecutionListener for BroadcastListener {
    fn on_node_start(&self, execution_id: ExecutionId, node_id: &str, node_kind: &str) {
        self.bus.publish(ExecutionEvent::NodeStarted {
            execution_id,
            node_id: node_id.to_string(),
            node_kind: node_kind.to_string(),
        });
    }

    fn on_node_complete(&self, execution_id: ExecutionId, node_id: &str, result: &NodeResult) {
        self.bus.publish(ExecutionEvent::NodeCompleted {
            execution_id,
            node_id: node_id.to_string(),
            result: result.clone(),
        });
    }

    fn on_agent_start(&self, execution_id: ExecutionId, node_id: &str, agent_id: &str) {
        self.bus.publish(ExecutionEvent::AgentStarted {
            execution_id,
            agent_id: agent_id.to_string(),
            node_id: node_id.to_string(),
        });
    }

    fn on_agent_complete(&self, execution_id: ExecutionId, node_id: &str, agent_id: &str) {
        self.bus.publish(ExecutionEvent::AgentCompleted {
            execution_id,
            agent_id: agent_id.to_string(),
            node_id: node_id.to_string(),
        });
    }

    fn on_planner_start(&self, execution_id: ExecutionId, node_id: &str, prompt: &str) {
        self.bus.publish(ExecutionEvent::PlannerStarted {
            execution_id,
            node_id: node_id.to_string(),
            prompt: prompt.to_string(),
        });
    }

    fn on_planner_complete(&self, execution_id: ExecutionId, node_id: &str, step_count: usize) {
        self.bus.publish(ExecutionEvent::PlannerCompleted {
            execution_id,
            node_id: node_id.to_string(),
            step_count,
        });
    }

    fn on_checkpoint(&self, snapshot: &Snapshot) {
        self.bus.publish(ExecutionEvent::Checkpoint {
            execution_id: snapshot.execution_id,
            node_id: snapshot.current_node_id.clone().unwrap_or_default(),
        });
    }

    fn on_backtrack(&self, execution_id: ExecutionId, event: &BacktrackEvent) {
        self.bus.publish(ExecutionEvent::Backtracked {
            execution_id,
            event: event.clone(),
        });
    }

    fn on_plan_event(&self, execution_id: ExecutionId, event: &PlanEvent) {
        self.bus.publish(ExecutionEvent::Plan {
            execution_id,
            event: event.clone(),
        });
    }

    fn on_consensus(
        &self,
        execution_id: ExecutionId,
        node_id: &str,
        reached: bool,
        metadata: &HashMap<String, Value>,
    ) {
        let winning_branch_id = metadata
            .get("winning_branch_id")
            .and_then(Value::as_str)
            .map(String::from);
        self.bus.publish(ExecutionEvent::ConsensusEvaluated {
            execution_id,
            node_id: node_id.to_string(),
            reached,
            winning_branch_id,
        });
    }
}
