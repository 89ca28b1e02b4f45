use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use serde_json::Value;
use tracing::warn;

use crate::error::Result;

pub type HandlerId = u64;

/// Callback invoked with the payload of every envelope on its topic.
pub type Handler = Arc<dyn Fn(&Value) -> Result<()> + Send + Sync>;

/// Outcome of one fan-out.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct DispatchReport {
    pub delivered: usize,
    pub failed: usize,
}

/// Topic to ordered handler list.
#[derive(Default)]
pub struct SubscriptionRegistry {
    next_id: AtomicU64,
    topics: Mutex<HashMap<String, Vec<(HandlerId, Handler)>>>,
}

impl SubscriptionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, Vec<(HandlerId, Handler)>>> {
        self.topics.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn subscribe<F>(&self, topic: &str, handler: F) -> HandlerId
    where
        F: Fn(&Value) -> Result<()> + Send + Sync + 'static,
    {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst) + 1;
        self.lock()
            .entry(topic.to_string())
            .or_default()
            .push((id, Arc::new(handler)));
        id
    }

    /// Removes exactly the handler with `id`. Returns whether it existed.
    pub fn unsubscribe(&self, id: HandlerId) -> bool {
        let mut topics = self.lock();
        let mut removed = false;
        topics.retain(|_, handlers| {
            if let Some(pos) = handlers.iter().position(|(hid, _)| *hid == id) {
                handlers.remove(pos);
                removed = true;
            }
            !handlers.is_empty()
        });
        removed
    }

    /// Invokes every handler of `topic` in subscription order. Errors and
    /// panics are logged per handler and never stop the fan-out.
    pub fn dispatch(&self, topic: &str, payload: &Value) -> DispatchReport {
        // Handlers run without the lock so they may (un)subscribe.
        let handlers: Vec<(HandlerId, Handler)> = self.lock().get(topic).cloned().unwrap_or_default();

        let mut report = DispatchReport::default();
        for (id, handler) in handlers {
            match catch_unwind(AssertUnwindSafe(|| handler(payload))) {
                Ok(Ok(())) => report.delivered += 1,
                Ok(Err(err)) => {
                    warn!(topic, handler = id, error = %err, "Realtime handler failed");
                    report.failed += 1;
                }
                Err(_) => {
                    warn!(topic, handler = id, "Realtime handler panicked");
                    report.failed += 1;
                }
            }
        }
        report
    }

    pub fn handler_count(&self, topic: &str) -> usize {
        self.lock().get(topic).map_or(0, Vec::len)
    }

    pub fn has_handlers(&self, topic: &str) -> bool {
        self.handler_count(topic) > 0
    }

    pub fn topics(&self) -> Vec<String> {
        let mut topics: Vec<String> = self.lock().keys().cloned().collect();
        topics.sort();
        topics
    }

    pub fn clear(&self) {
        self.lock().clear();
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::SyncError;
    use serde_json::json;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn test_fan_out_in_subscription_order() {
        let registry = SubscriptionRegistry::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        for name in ["a", "b"] {
            let seen = seen.clone();
            registry.subscribe("order_update", move |p| {
                seen.lock().unwrap().push(format!("{}:{}", name, p["id"]));
                Ok(())
            });
        }
        let report = registry.dispatch("order_update", &json!({"id": 1}));
        assert_eq!(report.delivered, 2);
        assert_eq!(*seen.lock().unwrap(), vec!["a:1", "b:1"]);
    }

    #[test]
    fn test_failing_and_panicking_handlers_are_isolated() {
        let registry = SubscriptionRegistry::new();
        let calls = Arc::new(AtomicUsize::new(0));
        registry.subscribe("t", |_| Err(SyncError::Internal("nope".into())));
        registry.subscribe("t", |_| panic!("handler bug"));
        let c = calls.clone();
        registry.subscribe("t", move |_| {
            c.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });

        let report = registry.dispatch("t", &Value::Null);
        assert_eq!(report, DispatchReport { delivered: 1, failed: 2 });
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_unsubscribe_removes_exactly_one() {
        let registry = SubscriptionRegistry::new();
        let first = registry.subscribe("t", |_| Ok(()));
        let _second = registry.subscribe("t", |_| Ok(()));
        assert!(registry.unsubscribe(first));
        assert!(!registry.unsubscribe(first));
        assert_eq!(registry.handler_count("t"), 1);
    }

    #[test]
    fn test_unknown_topic_dispatches_nothing() {
        let registry = SubscriptionRegistry::new();
        assert_eq!(registry.dispatch("mystery", &Value::Null), DispatchReport::default());
    }

    #[test]
    fn test_clear_drops_everything() {
        let registry = SubscriptionRegistry::new();
        registry.subscribe("a", |_| Ok(()));
        registry.subscribe("b", |_| Ok(()));
        assert_eq!(registry.topics(), vec!["a", "b"]);
        registry.clear();
        assert!(registry.is_empty());
    }
}
