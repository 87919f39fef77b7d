use serde_json::{json, Value};
use std::sync::{
    atomic::{AtomicU64, Ordering},
    Mutex,
};
use tokio::sync::mpsc;

use crate::{debug_log, ForegroundEvent};

struct ForegroundHandle {
    id: u64,
    sender: mpsc::UnboundedSender<Value>,
}

/// Enumerable set of live foreground contexts. Handles whose receiving end
/// is gone are pruned on the next send; zero reachable contexts is a normal
/// state, not an error.
pub(crate) struct ForegroundRegistry {
    contexts: Mutex<Vec<ForegroundHandle>>,
    next_id: AtomicU64,
}

impl ForegroundRegistry {
    pub(crate) fn new() -> Self {
        Self {
            contexts: Mutex::new(Vec::new()),
            next_id: AtomicU64::new(1),
        }
    }

    pub(crate) fn attach(&self) -> (u64, mpsc::UnboundedReceiver<Value>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        match self.contexts.lock() {
            Ok(mut contexts) => {
                contexts.push(ForegroundHandle { id, sender: tx });
                debug_log(&format!(
                    "foreground context {id} attached, {} total",
                    contexts.len()
                ));
            }
            Err(_) => debug_log("foreground registry lock poisoned on attach"),
        }
        (id, rx)
    }

    pub(crate) fn detach(&self, id: u64) {
        if let Ok(mut contexts) = self.contexts.lock() {
            contexts.retain(|ctx| ctx.id != id);
        }
    }

    pub(crate) fn context_count(&self) -> usize {
        self.contexts.lock().map(|contexts| contexts.len()).unwrap_or(0)
    }

    /// Fans `event` out to every live context. The event passes through a
    /// serialization round-trip first; if that fails, a minimal stand-in
    /// carrying only the event type is sent instead of throwing. Returns
    /// whether at least one context accepted the message.
    pub(crate) fn broadcast(&self, event: &ForegroundEvent) -> bool {
        let payload = match serde_json::to_value(event) {
            Ok(value) => value,
            Err(error) => {
                debug_log(&format!(
                    "event serialization failed for {}: {error}",
                    event.kind()
                ));
                json!({ "type": event.kind(), "error": "event serialization failed" })
            }
        };

        let mut contexts = match self.contexts.lock() {
            Ok(contexts) => contexts,
            Err(_) => {
                debug_log("foreground registry lock poisoned on broadcast");
                return false;
            }
        };
        let before = contexts.len();
        contexts.retain(|ctx| ctx.sender.send(payload.clone()).is_ok());
        let pruned = before.saturating_sub(contexts.len());
        if pruned > 0 {
            debug_log(&format!("pruned {pruned} dead foreground contexts"));
        }
        !contexts.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::ForegroundRegistry;
    use crate::{ForegroundEvent, NotificationRecord, NotificationSource};

    fn sample_record() -> NotificationRecord {
        NotificationRecord {
            id: "n1".to_string(),
            title: "Hi".to_string(),
            message: "there".to_string(),
            image_url: None,
            icon_url: None,
            url: None,
            tag: "n1".to_string(),
            timestamp: 1,
            source: NotificationSource::Stream,
        }
    }

    #[test]
    fn broadcast_without_contexts_reports_undelivered() {
        let registry = ForegroundRegistry::new();
        let event = ForegroundEvent::NotificationReceived(sample_record());
        assert!(!registry.broadcast(&event));
    }

    #[test]
    fn broadcast_reaches_every_attached_context() {
        let registry = ForegroundRegistry::new();
        let (_id_a, mut rx_a) = registry.attach();
        let (_id_b, mut rx_b) = registry.attach();

        let event = ForegroundEvent::NotificationReceived(sample_record());
        assert!(registry.broadcast(&event));

        for rx in [&mut rx_a, &mut rx_b] {
            let value = rx.try_recv().expect("event delivered");
            assert_eq!(value["type"], "NOTIFICATION_RECEIVED");
            assert_eq!(value["data"]["id"], "n1");
            assert_eq!(value["data"]["title"], "Hi");
        }
    }

    #[test]
    fn dropped_receivers_are_pruned() {
        let registry = ForegroundRegistry::new();
        let (_id, rx) = registry.attach();
        drop(rx);

        let event = ForegroundEvent::WebsocketDisconnected {
            reason: "test".to_string(),
        };
        assert!(!registry.broadcast(&event));
        assert_eq!(registry.context_count(), 0);
    }

    #[test]
    fn detach_removes_the_context() {
        let registry = ForegroundRegistry::new();
        let (id, _rx) = registry.attach();
        registry.detach(id);
        assert_eq!(registry.context_count(), 0);
    }
}
