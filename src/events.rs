//! Observable order store.
//!
//! The order state machine publishes every committed change here; UI
//! collaborators and the sync loop subscribe instead of sharing mutable
//! state. Publishing never blocks and never fails when nobody listens.

use serde::Serialize;
use tokio::sync::broadcast;
use tracing::trace;

use crate::models::{Order, OrderStatus};

const EVENT_CHANNEL_CAPACITY: usize = 256;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum OrderEvent {
    Created {
        order: Order,
    },
    StatusChanged {
        from: OrderStatus,
        order: Order,
    },
    Cancelled {
        local_id: String,
    },
}

impl OrderEvent {
    pub fn local_id(&self) -> &str {
        match self {
            OrderEvent::Created { order } | OrderEvent::StatusChanged { order, .. } => {
                &order.local_id
            }
            OrderEvent::Cancelled { local_id } => local_id,
        }
    }
}

/// Publish/subscribe hub for [`OrderEvent`]s. Cheap to clone.
#[derive(Debug, Clone)]
pub struct OrderEvents {
    tx: broadcast::Sender<OrderEvent>,
}

impl Default for OrderEvents {
    fn default() -> Self {
        Self::new()
    }
}

impl OrderEvents {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<OrderEvent> {
        self.tx.subscribe()
    }

    pub fn publish(&self, event: OrderEvent) {
        let local_id = event.local_id().to_string();
        match self.tx.send(event) {
            Ok(receivers) => trace!(order_id = %local_id, receivers, "order event published"),
            Err(_) => trace!(order_id = %local_id, "order event dropped, no subscribers"),
        }
    }
}
