//! Change notifications published after a write commits.

use crate::error::AppError;
use async_trait::async_trait;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::broadcast;

#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ChangeEvent {
    /// `collection` or `global`.
    pub resource_type: String,
    pub resource: String,
    pub operation: String,
    pub record_id: Value,
    pub locale: String,
    pub payload: Value,
}

#[async_trait]
pub trait RealtimeSink: Send + Sync {
    async fn publish(&self, event: ChangeEvent) -> Result<(), AppError>;
}

/// In-process sink backed by a broadcast channel. Slow subscribers lag, they never block writers.
#[derive(Clone)]
pub struct BroadcastSink {
    tx: broadcast::Sender<ChangeEvent>,
}

impl BroadcastSink {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        BroadcastSink { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ChangeEvent> {
        self.tx.subscribe()
    }
}

#[async_trait]
impl RealtimeSink for BroadcastSink {
    async fn publish(&self, event: ChangeEvent) -> Result<(), AppError> {
        // No subscribers is not an error.
        let _ = self.tx.send(event);
        Ok(())
    }
}
