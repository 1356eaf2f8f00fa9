//! Topic-keyed event fan-out.
//!
//! Domain code outside the gateway subscribes here to react to decoded
//! envelopes and connection lifecycle changes without the gateway knowing
//! about those domain types.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use steamcm_core::{Envelope, GcEnvelope};

/// An event published on the bus.
#[derive(Debug, Clone)]
pub struct Event {
    pub topic: String,
    pub envelope: Option<Arc<Envelope>>,
    pub gc: Option<Arc<GcEnvelope>>,
    pub detail: serde_json::Value,
}

impl Event {
    pub fn new(topic: impl Into<String>, detail: serde_json::Value) -> Self {
        Self {
            topic: topic.into(),
            envelope: None,
            gc: None,
            detail,
        }
    }

    pub fn message(envelope: Arc<Envelope>) -> Self {
        Self {
            topic: topics::MESSAGE.to_string(),
            envelope: Some(envelope),
            gc: None,
            detail: serde_json::Value::Null,
        }
    }

    pub fn gc_message(envelope: Arc<GcEnvelope>) -> Self {
        Self {
            topic: topics::GC_MESSAGE.to_string(),
            envelope: None,
            gc: Some(envelope),
            detail: serde_json::Value::Null,
        }
    }
}

pub type SubscriptionId = u64;

type Callback = Arc<dyn Fn(&Event) + Send + Sync>;

#[derive(Default)]
struct Subscriptions {
    by_topic: HashMap<String, Vec<(SubscriptionId, Callback)>>,
    next_id: SubscriptionId,
}

/// Thread-safe event bus. Callbacks run on the emitting task and must not
/// block.
#[derive(Default)]
pub struct EventBus {
    subs: Mutex<Subscriptions>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Subscribe to a topic. Returns an id for unsubscribing.
    pub fn subscribe(
        &self,
        topic: &str,
        callback: impl Fn(&Event) + Send + Sync + 'static,
    ) -> SubscriptionId {
        let mut subs = self.subs.lock().unwrap_or_else(|e| e.into_inner());
        subs.next_id += 1;
        let id = subs.next_id;
        subs.by_topic
            .entry(topic.to_string())
            .or_default()
            .push((id, Arc::new(callback)));
        id
    }

    /// Unsubscribe by id. Returns true if found.
    pub fn unsubscribe(&self, sub_id: SubscriptionId) -> bool {
        let mut subs = self.subs.lock().unwrap_or_else(|e| e.into_inner());
        for list in subs.by_topic.values_mut() {
            let before = list.len();
            list.retain(|(id, _)| *id != sub_id);
            if list.len() < before {
                return true;
            }
        }
        false
    }

    /// Deliver an event to every subscriber of its topic, in subscription
    /// order. A panicking subscriber is logged and skipped.
    pub fn emit(&self, event: &Event) {
        let callbacks: Vec<Callback> = {
            let subs = self.subs.lock().unwrap_or_else(|e| e.into_inner());
            match subs.by_topic.get(&event.topic) {
                Some(list) => list.iter().map(|(_, cb)| cb.clone()).collect(),
                None => return,
            }
        };

        for callback in callbacks {
            let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| callback(event)));
            if result.is_err() {
                tracing::error!(topic = %event.topic, "event subscriber panicked");
            }
        }
    }

    pub fn subscriber_count(&self, topic: &str) -> usize {
        let subs = self.subs.lock().unwrap_or_else(|e| e.into_inner());
        subs.by_topic.get(topic).map(|s| s.len()).unwrap_or(0)
    }
}

// Well-known event topics
pub mod topics {
    pub const CONNECT: &str = "connect";
    pub const DISCONNECT: &str = "disconnect";
    pub const LOGGED_ON: &str = "logged_on";
    pub const LOGGED_OFF: &str = "logged_off";
    pub const MESSAGE: &str = "message";
    pub const GC_MESSAGE: &str = "gc_message";
    pub const HEARTBEAT_LAG: &str = "heartbeat_lag";
}
