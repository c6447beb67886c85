//! In-process event bus for the Aula mobile sync core.
//!
//! UI layers subscribe to sync events per site; the sync engine triggers
//! them after every completed pass. Delivery is synchronous and in
//! registration order, with no guarantees beyond "every handler currently
//! registered for that (event, site) pair runs". The bus is an explicit
//! object injected into its consumers, created at session start and cleared
//! with [`EventBus::clear_site`] on logout or site removal.

pub mod error;

pub use error::{EventBusError, Result};

use parking_lot::RwLock;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

type Handler = Box<dyn Fn(&Value) + Send + Sync>;

struct Subscriber {
    id: u64,
    handler: Handler,
}

/// Key for one stream of events: event name plus the site it belongs to.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct StreamKey {
    event: String,
    site_id: String,
}

/// Process-wide publish/subscribe registry.
///
/// Handlers run on the caller's task, synchronously, so they must be cheap;
/// anything slow belongs in a task the handler spawns itself.
#[derive(Default)]
pub struct EventBus {
    streams: RwLock<HashMap<StreamKey, Vec<Subscriber>>>,
    next_id: AtomicU64,
}

/// Identifies a registration so it can be removed later.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SubscriptionId(u64);

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler for an event on one site.
    pub fn on<F>(&self, event: &str, site_id: &str, handler: F) -> SubscriptionId
    where
        F: Fn(&Value) + Send + Sync + 'static,
    {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let key = StreamKey {
            event: event.to_string(),
            site_id: site_id.to_string(),
        };

        self.streams.write().entry(key).or_default().push(Subscriber {
            id,
            handler: Box::new(handler),
        });

        SubscriptionId(id)
    }

    /// Remove a registration. Returns an error if the id is unknown, which
    /// usually means it was already removed.
    pub fn off(&self, subscription: SubscriptionId) -> Result<()> {
        let mut streams = self.streams.write();

        for subscribers in streams.values_mut() {
            if let Some(pos) = subscribers.iter().position(|s| s.id == subscription.0) {
                subscribers.remove(pos);
                return Ok(());
            }
        }

        Err(EventBusError::UnknownSubscription(subscription.0))
    }

    /// Fire an event for one site. Handlers are invoked synchronously in
    /// registration order; there is nothing to await and no delivery receipt.
    pub fn trigger(&self, event: &str, payload: &Value, site_id: &str) {
        let key = StreamKey {
            event: event.to_string(),
            site_id: site_id.to_string(),
        };

        let streams = self.streams.read();
        let Some(subscribers) = streams.get(&key) else {
            tracing::trace!(event, site_id, "event has no subscribers");
            return;
        };

        tracing::debug!(event, site_id, subscribers = subscribers.len(), "triggering event");

        for subscriber in subscribers {
            (subscriber.handler)(payload);
        }
    }

    /// Drop every registration belonging to a site (logout, site removal).
    pub fn clear_site(&self, site_id: &str) {
        let mut streams = self.streams.write();
        streams.retain(|key, _| key.site_id != site_id);
    }

    /// Number of handlers currently registered for an (event, site) pair.
    pub fn subscriber_count(&self, event: &str, site_id: &str) -> usize {
        let key = StreamKey {
            event: event.to_string(),
            site_id: site_id.to_string(),
        };
        self.streams.read().get(&key).map_or(0, Vec::len)
    }
}
