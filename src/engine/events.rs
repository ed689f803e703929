// GraphBot Engine — Event Bus
// At-least-once delivery of background results to the originating user.
// Producers enqueue into the store (durable) and fan out on a broadcast
// channel (realtime). Consumers mark rows delivered — a connected client
// after a successful push, or the context builder after rendering. Both may
// see the same event; event_id is the dedupe key. Producers never delete.

use std::sync::Arc;

use log::warn;
use tokio::sync::broadcast;

use crate::atoms::error::EngineResult;
use crate::atoms::types::SystemEvent;
use crate::engine::store::Store;

const BROADCAST_CAPACITY: usize = 256;

pub struct EventBus {
    store: Arc<Store>,
    tx: broadcast::Sender<SystemEvent>,
}

impl EventBus {
    pub fn new(store: Arc<Store>) -> Self {
        let (tx, _) = broadcast::channel(BROADCAST_CAPACITY);
        EventBus { store, tx }
    }

    /// Durable enqueue + realtime fan-out. Returns the event id.
    pub fn emit(&self, user_id: &str, kind: &str, payload: &serde_json::Value) -> EngineResult<i64> {
        let event_id = self.store.enqueue_event(user_id, kind, payload)?;
        let event = SystemEvent {
            event_id,
            user_id: user_id.to_string(),
            kind: kind.to_string(),
            payload: payload.clone(),
            delivered_at: None,
            created_at: String::new(),
        };
        // No live subscribers is the normal case; the store copy carries it.
        if self.tx.send(event).is_err() {
            log::debug!("[events] No realtime subscribers for {}", kind);
        }
        Ok(event_id)
    }

    /// Realtime feed for connected clients. A subscriber that pushed an
    /// event successfully should call `acknowledge`.
    pub fn subscribe(&self) -> broadcast::Receiver<SystemEvent> {
        self.tx.subscribe()
    }

    pub fn acknowledge(&self, event_ids: &[i64]) {
        if let Err(e) = self.store.mark_events_delivered(event_ids) {
            warn!("[events] Failed to acknowledge events: {}", e);
        }
    }
}
