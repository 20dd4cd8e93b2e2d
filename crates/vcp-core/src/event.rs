use parking_lot::RwLock;
use serde_json::Value;
use std::collections::HashMap;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use tracing::{debug, warn};
use uuid::Uuid;

/// A handler invoked synchronously for every event emitted under its name.
pub type EventHandler = Arc<dyn Fn(&Value) + Send + Sync>;

/// Token returned by [`EventBus::on`]; pass it to [`EventBus::off`] to stop
/// receiving events.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Subscription {
    pub id: Uuid,
    pub event: String,
}

/// Namespaced publish/subscribe bus shared by plugins and the host.
///
/// Event names follow `<pluginName>:<event>` or `system:<event>`. The
/// convention is not enforced here; callers that want to flag violations use
/// [`is_conventional_name`]. Delivery is synchronous, in registration order,
/// to subscribers of the exact name only.
#[derive(Clone, Default)]
pub struct EventBus {
    handlers: Arc<RwLock<HashMap<String, Vec<(Uuid, EventHandler)>>>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on<F>(&self, event: &str, handler: F) -> Subscription
    where
        F: Fn(&Value) + Send + Sync + 'static,
    {
        let id = Uuid::new_v4();
        self.handlers
            .write()
            .entry(event.to_string())
            .or_default()
            .push((id, Arc::new(handler)));
        debug!(event, %id, "event subscription added");
        Subscription {
            id,
            event: event.to_string(),
        }
    }

    /// Remove a subscription. Returns false if it was already gone.
    pub fn off(&self, subscription: &Subscription) -> bool {
        let mut handlers = self.handlers.write();
        let Some(list) = handlers.get_mut(&subscription.event) else {
            return false;
        };
        let before = list.len();
        list.retain(|(id, _)| *id != subscription.id);
        let removed = list.len() != before;
        if list.is_empty() {
            handlers.remove(&subscription.event);
        }
        removed
    }

    /// Deliver `payload` to every current subscriber of `event`.
    ///
    /// Handlers run after the lock is released, so they may subscribe or
    /// unsubscribe freely. A panicking handler is logged and skipped; the
    /// remaining handlers still run. Returns the number of handlers that
    /// completed normally.
    pub fn emit(&self, event: &str, payload: &Value) -> usize {
        let snapshot: Vec<(Uuid, EventHandler)> = match self.handlers.read().get(event) {
            Some(list) => list.clone(),
            None => return 0,
        };

        let mut delivered = 0;
        for (id, handler) in snapshot {
            match catch_unwind(AssertUnwindSafe(|| handler(payload))) {
                Ok(()) => delivered += 1,
                Err(_) => warn!(event, %id, "event handler panicked, continuing delivery"),
            }
        }
        delivered
    }

    pub fn subscriber_count(&self, event: &str) -> usize {
        self.handlers.read().get(event).map_or(0, Vec::len)
    }
}

/// Whether `name` follows `<pluginName>:<event>` or `system:<event>`.
pub fn is_conventional_name(name: &str) -> bool {
    match name.split_once(':') {
        Some((namespace, event)) => {
            !namespace.is_empty()
                && !event.is_empty()
                && namespace
                    .chars()
                    .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-')
        }
        None => false,
    }
}
