//! Per-conversation event fan-out.
//!
//! One bounded broadcast channel per conversation. A subscriber joining at
//! time *t* sees events from *t* forward; a subscriber that cannot keep up
//! lags out and is dropped rather than stalling the emitter. Durable state is
//! on disk and can always be re-read through the transcript range API.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::Mutex as StdMutex;

use tokio::sync::broadcast;
use tokio::sync::mpsc;

use fws_protocol::Event;

const SUBSCRIBER_QUEUE: usize = 256;

#[derive(Clone, Default)]
pub struct EventHub {
    senders: Arc<StdMutex<HashMap<String, broadcast::Sender<Event>>>>,
}

impl EventHub {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn sender(&self, conversation_id: &str) -> broadcast::Sender<Event> {
        let mut senders = self.lock();
        senders
            .entry(conversation_id.to_string())
            .or_insert_with(|| broadcast::channel(SUBSCRIBER_QUEUE).0)
            .clone()
    }

    pub fn subscribe(&self, conversation_id: &str) -> broadcast::Receiver<Event> {
        self.sender(conversation_id).subscribe()
    }

    pub fn publish(&self, event: Event) {
        let sender = self.sender(&event.conversation_id);
        // No subscribers is fine; durable state is already persisted.
        let _ = sender.send(event);
    }

    /// Route a bridge's event stream into the per-conversation channels.
    pub fn spawn_router(&self, mut rx: mpsc::UnboundedReceiver<Event>) {
        let hub = self.clone();
        tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                hub.publish(event);
            }
        });
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, broadcast::Sender<Event>>> {
        match self.senders.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fws_protocol::EventMsg;
    use pretty_assertions::assert_eq;

    #[tokio::test]
    async fn subscribers_are_partitioned_by_conversation() {
        let hub = EventHub::new();
        let mut rx_a = hub.subscribe("a");
        let mut rx_b = hub.subscribe("b");

        hub.publish(Event {
            conversation_id: "a".into(),
            msg: EventMsg::Status {
                status: "ping".into(),
                message: None,
            },
        });

        let got = rx_a.recv().await.unwrap();
        assert_eq!(got.conversation_id, "a");
        assert!(rx_b.try_recv().is_err());
    }

    #[tokio::test]
    async fn router_moves_bridge_events_into_the_hub() {
        let hub = EventHub::new();
        let mut rx = hub.subscribe("c");
        let (tx, bridge_rx) = mpsc::unbounded_channel();
        hub.spawn_router(bridge_rx);

        tx.send(Event {
            conversation_id: "c".into(),
            msg: EventMsg::Status {
                status: "ok".into(),
                message: None,
            },
        })
        .unwrap();

        let got = rx.recv().await.unwrap();
        assert_eq!(got.conversation_id, "c");
    }
}
