use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use std::sync::Arc;
use tokio::sync::broadcast;

/// Events flowing through the host.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Event {
    // ── Plugin lifecycle ───────────────────────────────────────
    PluginLoaded {
        plugin_id: String,
        version: String,
    },
    PluginInitialized {
        plugin_id: String,
    },
    PluginUnloaded {
        plugin_id: String,
    },
    PluginError {
        plugin_id: String,
        error: String,
    },

    // ── Plugin-emitted ─────────────────────────────────────────
    /// Published by a plugin through the host interface's `emit_event`.
    Plugin {
        source: String,
        event_type: String,
        payload: String,
        timestamp: DateTime<Utc>,
    },

    // ── System ─────────────────────────────────────────────────
    Shutdown,
}

impl Event {
    pub fn plugin(source: &str, event_type: &str, payload: &str) -> Self {
        Self::Plugin {
            source: source.to_string(),
            event_type: event_type.to_string(),
            payload: payload.to_string(),
            timestamp: Utc::now(),
        }
    }
}

/// A broadcast-based event bus for process-wide pub/sub.
///
/// Delivery is to the receivers subscribed at the time of publishing; a
/// receiver created later never observes earlier events. Publishing never
/// blocks: a slow subscriber lags and loses the oldest events instead.
#[derive(Debug, Clone)]
pub struct EventBus {
    sender: Arc<broadcast::Sender<Event>>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self {
            sender: Arc::new(sender),
        }
    }

    /// Publish an event. Returns the number of subscribers that received it.
    pub fn publish(&self, event: Event) -> usize {
        // No subscribers is not an error.
        self.sender.send(event).unwrap_or(0)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.sender.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(1024)
    }
}
