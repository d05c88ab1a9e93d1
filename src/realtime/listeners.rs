//! Named-event listener registry.
//!
//! Dispatch works on a snapshot of the listener list, so callbacks may
//! subscribe or unsubscribe (themselves included) while an event is being
//! delivered.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock, Weak};

use serde_json::Value;

use crate::cache::lock::{rw_read, rw_write};

const SOURCE: &str = "realtime::listeners";

type Callback = Arc<dyn Fn(&Value) + Send + Sync>;

struct Listener {
    id: u64,
    callback: Callback,
}

#[derive(Default)]
struct RegistryInner {
    listeners: RwLock<HashMap<String, Vec<Listener>>>,
    next_id: AtomicU64,
}

/// Listeners keyed by event name, invoked in registration order.
#[derive(Clone, Default)]
pub struct ListenerRegistry {
    inner: Arc<RegistryInner>,
}

impl ListenerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe<F>(&self, event: impl Into<String>, callback: F) -> Subscription
    where
        F: Fn(&Value) + Send + Sync + 'static,
    {
        let event = event.into();
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        rw_write(&self.inner.listeners, SOURCE, "subscribe")
            .entry(event.clone())
            .or_default()
            .push(Listener {
                id,
                callback: Arc::new(callback),
            });

        Subscription {
            registry: Arc::downgrade(&self.inner),
            event,
            id,
        }
    }

    /// Invoke every listener registered for `event`. Returns how many ran.
    pub fn dispatch(&self, event: &str, payload: &Value) -> usize {
        let callbacks: Vec<Callback> = rw_read(&self.inner.listeners, SOURCE, "dispatch")
            .get(event)
            .map(|listeners| {
                listeners
                    .iter()
                    .map(|listener| Arc::clone(&listener.callback))
                    .collect()
            })
            .unwrap_or_default();

        for callback in &callbacks {
            callback(payload);
        }
        callbacks.len()
    }

    pub fn listener_count(&self, event: &str) -> usize {
        rw_read(&self.inner.listeners, SOURCE, "listener_count")
            .get(event)
            .map_or(0, Vec::len)
    }

    pub fn clear(&self) {
        rw_write(&self.inner.listeners, SOURCE, "clear").clear();
    }
}

impl fmt::Debug for ListenerRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let listeners = rw_read(&self.inner.listeners, SOURCE, "debug");
        let counts: HashMap<&str, usize> = listeners
            .iter()
            .map(|(event, list)| (event.as_str(), list.len()))
            .collect();
        f.debug_struct("ListenerRegistry")
            .field("listeners", &counts)
            .finish()
    }
}

/// Handle returned by `subscribe`.
///
/// Dropping it leaves the listener registered. `unsubscribe` may be called any
/// number of times, also after the registry itself is gone.
#[must_use = "the listener stays registered until `unsubscribe` is called"]
#[derive(Debug)]
pub struct Subscription {
    registry: Weak<RegistryInner>,
    event: String,
    id: u64,
}

impl Subscription {
    pub fn event(&self) -> &str {
        &self.event
    }

    pub fn unsubscribe(&self) {
        let Some(inner) = self.registry.upgrade() else {
            return;
        };
        let mut listeners = rw_write(&inner.listeners, SOURCE, "unsubscribe");
        if let Some(list) = listeners.get_mut(&self.event) {
            list.retain(|listener| listener.id != self.id);
            if list.is_empty() {
                listeners.remove(&self.event);
            }
        }
    }
}
