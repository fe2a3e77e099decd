//! Engine notifications, fanned out over a broadcast channel.

use crate::xfer::types::{QueueStatus, TransferItem};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

const EVENT_CAPACITY: usize = 256;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "camelCase")]
pub enum EngineEvent {
    Connected {
        key: String,
    },
    /// `manual` is true when the caller asked for the disconnect.
    Disconnected {
        key: String,
        manual: bool,
    },
    ConnectionError {
        key: String,
        message: String,
    },
    #[serde(rename_all = "camelCase")]
    Reconnecting {
        key: String,
        attempt: u32,
        delay_ms: u64,
    },
    PrimaryChanged {
        key: Option<String>,
    },
    QueueChanged {
        status: QueueStatus,
    },
    ItemStarted {
        item: TransferItem,
    },
    ItemCompleted {
        item: TransferItem,
    },
    /// The queue drained: nothing pending, nothing active.
    QueueComplete,
}

/// Cloneable sender side. Emitting with no subscribers is not an error.
#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<EngineEvent>,
}

impl EventBus {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(EVENT_CAPACITY);
        Self { tx }
    }

    pub fn emit(&self, event: EngineEvent) {
        let _ = self.tx.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.tx.subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}
