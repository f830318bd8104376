//! Subscription table and inbound message dispatch.
//!
//! Maps topic filters (with MQTT `+`/`#` wildcards) to registered
//! handlers. Each inbound message is delivered to exactly one handler —
//! the most specific matching filter. Unmatched messages are counted
//! and logged at debug, not silently lost.

use std::collections::HashMap;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};

use rumqttc::QoS;

/// Receives inbound messages for a subscription.
///
/// Blanket-implemented for closures, so `|topic, payload| { .. }` works
/// directly as a handler.
pub trait MessageHandler: Send + Sync {
    fn on_message(&self, topic: &str, payload: &[u8]);
}

impl<F> MessageHandler for F
where
    F: Fn(&str, &[u8]) + Send + Sync,
{
    fn on_message(&self, topic: &str, payload: &[u8]) {
        self(topic, payload)
    }
}

/// Handle returned by `register`, used to unsubscribe.
///
/// Carries a generation id: a handle for a subscription that has since
/// been replaced no longer removes anything.
#[derive(Debug, Clone)]
pub struct SubscriptionHandle {
    pub(crate) filter: String,
    generation: u64,
}

impl SubscriptionHandle {
    pub fn filter(&self) -> &str {
        &self.filter
    }
}

struct Entry {
    qos: QoS,
    generation: u64,
    handler: std::sync::Arc<dyn MessageHandler>,
}

/// Subscription-to-handler bindings with wildcard dispatch.
///
/// Transport-free: the broker-side subscribe/unsubscribe calls are made
/// by the facade through the `Channel`; the router only owns the local
/// table and the dispatch decision.
pub struct TopicRouter {
    table: Mutex<HashMap<String, Entry>>,
    next_generation: AtomicU64,
    unmatched: AtomicU64,
}

impl TopicRouter {
    pub fn new() -> Self {
        Self {
            table: Mutex::new(HashMap::new()),
            next_generation: AtomicU64::new(1),
            unmatched: AtomicU64::new(0),
        }
    }

    /// Register a handler for a topic filter.
    ///
    /// Re-registering the same filter atomically replaces the prior
    /// handler — the old handler receives no further deliveries once
    /// this returns.
    pub fn register(
        &self,
        filter: impl Into<String>,
        qos: QoS,
        handler: std::sync::Arc<dyn MessageHandler>,
    ) -> SubscriptionHandle {
        let filter = filter.into();
        let generation = self.next_generation.fetch_add(1, Ordering::SeqCst);
        self.table.lock().unwrap().insert(
            filter.clone(),
            Entry {
                qos,
                generation,
                handler,
            },
        );
        SubscriptionHandle { filter, generation }
    }

    /// Remove a registration. Returns whether anything was removed.
    ///
    /// Known race: a message already matched on the dispatch context may
    /// still reach the handler after `remove` returns.
    pub fn remove(&self, handle: &SubscriptionHandle) -> bool {
        let mut table = self.table.lock().unwrap();
        match table.get(&handle.filter) {
            Some(entry) if entry.generation == handle.generation => {
                table.remove(&handle.filter);
                true
            }
            _ => false,
        }
    }

    /// Deliver an inbound message to the most specific matching handler.
    ///
    /// Returns whether a handler was invoked. The handler runs outside
    /// the table lock, so it may re-enter the router.
    pub fn dispatch(&self, topic: &str, payload: &[u8]) -> bool {
        let handler = {
            let table = self.table.lock().unwrap();
            table
                .iter()
                .filter(|(filter, _)| topic_matches(filter, topic))
                .max_by_key(|(filter, _)| specificity(filter))
                .map(|(_, entry)| entry.handler.clone())
        };

        match handler {
            Some(handler) => {
                handler.on_message(topic, payload);
                true
            }
            None => {
                self.unmatched.fetch_add(1, Ordering::Relaxed);
                tracing::debug!(topic = %topic, "no subscription matches inbound message");
                false
            }
        }
    }

    /// Number of inbound messages dropped for lack of a matching filter.
    pub fn unmatched_count(&self) -> u64 {
        self.unmatched.load(Ordering::Relaxed)
    }

    /// Current (filter, qos) pairs, for replaying subscriptions to the
    /// broker after a reconnect.
    pub fn snapshot(&self) -> Vec<(String, QoS)> {
        self.table
            .lock()
            .unwrap()
            .iter()
            .map(|(filter, entry)| (filter.clone(), entry.qos))
            .collect()
    }

    pub fn is_empty(&self) -> bool {
        self.table.lock().unwrap().is_empty()
    }
}

impl Default for TopicRouter {
    fn default() -> Self {
        Self::new()
    }
}

/// MQTT topic filter matching: `+` matches one level, `#` (final level
/// only) matches any remaining levels including none.
pub fn topic_matches(filter: &str, topic: &str) -> bool {
    let mut filter_parts = filter.split('/');
    let mut topic_parts = topic.split('/');

    loop {
        match (filter_parts.next(), topic_parts.next()) {
            (Some("#"), _) => return true,
            (Some("+"), Some(_)) => {}
            (Some(f), Some(t)) if f == t => {}
            (None, None) => return true,
            _ => return false,
        }
    }
}

/// Specificity rank for picking one handler among several matches:
/// more literal levels first, then fewer multi-level wildcards, then
/// longer filters (exact filters rank above all wildcard forms of the
/// same depth).
fn specificity(filter: &str) -> (usize, isize, usize) {
    let literals = filter
        .split('/')
        .filter(|level| *level != "+" && *level != "#")
        .count();
    let hash_penalty = -(filter.split('/').filter(|level| *level == "#").count() as isize);
    let levels = filter.split('/').count();
    (literals, hash_penalty, levels)
}
