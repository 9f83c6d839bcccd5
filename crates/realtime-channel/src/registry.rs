//! Subscription registry
//!
//! One handler per event name, kept in registration order. The registry
//! outlives individual links: after every (re)connect the channel re-arms
//! each entry on the new link in the order returned by `events()`.

use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;

use serde_json::Value;
use tracing::error;

/// Handler invoked with the payload of each delivered event.
pub type EventHandler = Arc<dyn Fn(&Value) + Send + Sync>;

#[derive(Default)]
pub struct Registry {
    entries: Vec<(String, EventHandler)>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `handler` for `event`. Re-registering replaces the handler
    /// and keeps the original position. Returns `true` when the event was not
    /// registered before.
    pub fn upsert(&mut self, event: &str, handler: EventHandler) -> bool {
        match self.entries.iter_mut().find(|(name, _)| name == event) {
            Some(entry) => {
                entry.1 = handler;
                false
            }
            None => {
                self.entries.push((event.to_string(), handler));
                true
            }
        }
    }

    /// Returns `true` when an entry was removed.
    pub fn remove(&mut self, event: &str) -> bool {
        let before = self.entries.len();
        self.entries.retain(|(name, _)| name != event);
        self.entries.len() != before
    }

    /// Registered event names in registration order.
    pub fn events(&self) -> Vec<String> {
        self.entries.iter().map(|(name, _)| name.clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Run the handler for `event`. A panicking handler is logged and does
    /// not take the channel down. Returns `false` when nothing is registered.
    pub fn dispatch(&self, event: &str, payload: &Value) -> bool {
        let Some((_, handler)) = self.entries.iter().find(|(name, _)| name == event) else {
            return false;
        };
        if catch_unwind(AssertUnwindSafe(|| handler(payload))).is_err() {
            error!(event = %event, "event handler panicked");
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    fn recorder() -> (EventHandler, Arc<Mutex<Vec<Value>>>) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let handler: EventHandler = Arc::new(move |payload: &Value| {
            sink.lock().unwrap().push(payload.clone());
        });
        (handler, seen)
    }

    #[test]
    fn keeps_registration_order() {
        let mut registry = Registry::new();
        let (h, _) = recorder();
        registry.upsert("b", h.clone());
        registry.upsert("a", h.clone());
        registry.upsert("c", h.clone());
        assert_eq!(registry.events(), vec!["b", "a", "c"]);

        // replacing keeps position
        assert!(!registry.upsert("b", h));
        assert_eq!(registry.events(), vec!["b", "a", "c"]);
    }

    #[test]
    fn replace_swaps_handler() {
        let mut registry = Registry::new();
        let (first, first_seen) = recorder();
        let (second, second_seen) = recorder();
        registry.upsert("x", first);
        registry.upsert("x", second);

        registry.dispatch("x", &Value::from(1));
        assert!(first_seen.lock().unwrap().is_empty());
        assert_eq!(second_seen.lock().unwrap().len(), 1);
    }

    #[test]
    fn remove_reports_presence() {
        let mut registry = Registry::new();
        let (h, _) = recorder();
        registry.upsert("x", h);
        assert!(registry.remove("x"));
        assert!(!registry.remove("x"));
        assert!(registry.is_empty());
    }

    #[test]
    fn dispatch_unknown_event_is_false() {
        let registry = Registry::new();
        assert!(!registry.dispatch("nope", &Value::Null));
    }

    #[test]
    fn panicking_handler_is_contained() {
        let mut registry = Registry::new();
        registry.upsert("boom", Arc::new(|_: &Value| panic!("handler bug")));
        let (h, seen) = recorder();
        registry.upsert("ok", h);

        assert!(registry.dispatch("boom", &Value::Null));
        assert!(registry.dispatch("ok", &Value::from("still here")));
        assert_eq!(seen.lock().unwrap().len(), 1);
    }
}
