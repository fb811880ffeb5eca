//! Fire-and-forget orchestration events for an external messaging collaborator.

use serde::Serialize;
use serde_json::Value;
use std::sync::Arc;
use tokio::sync::mpsc;

/// Events emitted by the runtime. Delivery is best-effort and never blocks
/// the emitting path.
#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum OrchestratorEvent {
    InstanceCreated {
        instance_id: String,
        agent_id: String,
    },
    InstanceUpdated {
        instance_id: String,
        agent_id: String,
    },
    InstanceDeleted {
        instance_id: String,
        agent_id: String,
    },
    StatusChanged {
        instance_id: String,
        status: String,
        alert: Option<Value>,
    },
    ScalingEvent {
        agent_id: String,
        action: String,
        before: usize,
        after: usize,
        trigger_metric: String,
    },
    ModelCalled {
        instance_id: String,
        latency_ms: f64,
        tokens_used: u64,
    },
    ModelCallFailed {
        instance_id: String,
        error: String,
    },
}

pub trait EventSink: Send + Sync {
    fn emit(&self, event: OrchestratorEvent);
}

/// Discards events, logging them at debug level.
pub struct NullSink;

impl EventSink for NullSink {
    fn emit(&self, event: OrchestratorEvent) {
        tracing::debug!(?event, "event dropped (no sink configured)");
    }
}

/// Forwards events over an unbounded channel; the send never blocks. A closed
/// receiver downgrades emission to a no-op.
pub struct ChannelSink {
    tx: mpsc::UnboundedSender<OrchestratorEvent>,
}

impl ChannelSink {
    pub fn channel() -> (Arc<Self>, mpsc::UnboundedReceiver<OrchestratorEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Arc::new(Self { tx }), rx)
    }
}

impl EventSink for ChannelSink {
    fn emit(&self, event: OrchestratorEvent) {
        let _ = self.tx.send(event);
    }
}
