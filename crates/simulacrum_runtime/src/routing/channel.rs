//! Channels and subscriber handles

use std::collections::HashMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use uuid::Uuid;

use super::{AccessMode, ChannelValue, ValueType};

// ─────────────────────────────────────────────────────────────────────────────
// Subscribers
// ─────────────────────────────────────────────────────────────────────────────

/// Identity of one subscriber (a client session or in-process listener)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SubscriberId(Uuid);

impl SubscriberId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for SubscriberId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for SubscriberId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A value change delivered to subscribers
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChannelUpdate {
    pub name: String,
    pub value: ChannelValue,
    pub timestamp: DateTime<Utc>,
}

/// Where a subscriber wants its updates delivered
#[derive(Debug, Clone)]
pub struct SubscriberHandle {
    pub id: SubscriberId,
    tx: mpsc::Sender<ChannelUpdate>,
}

impl SubscriberHandle {
    pub fn new(id: SubscriberId, tx: mpsc::Sender<ChannelUpdate>) -> Self {
        Self { id, tx }
    }

    /// Create a handle with a fresh id and its receiving end
    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<ChannelUpdate>) {
        let (tx, rx) = mpsc::channel(capacity);
        (Self::new(SubscriberId::new(), tx), rx)
    }

    fn deliver(&self, update: ChannelUpdate) {
        match self.tx.try_send(update) {
            Ok(()) => {}
            Err(TrySendError::Full(update)) => {
                tracing::warn!(subscriber = %self.id, name = %update.name, "Subscriber lagging, dropping update");
            }
            Err(TrySendError::Closed(_)) => {
                tracing::debug!(subscriber = %self.id, "Subscriber gone");
            }
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Channel
// ─────────────────────────────────────────────────────────────────────────────

/// Stable index of a materialized channel inside its [`RoutingTable`](super::RoutingTable)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ChannelId(pub(crate) usize);

impl ChannelId {
    pub fn index(self) -> usize {
        self.0
    }
}

/// Where a channel came from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelOrigin {
    /// Materialized from the route at this index
    Route(usize),
    /// Registered eagerly with `register_static`
    Static,
    /// Produced by the default factory
    Default,
}

/// A named, typed, observable value cell
#[derive(Debug)]
pub struct Channel {
    name: String,
    value_type: ValueType,
    value: ChannelValue,
    access: AccessMode,
    origin: ChannelOrigin,
    subscribers: HashMap<SubscriberId, SubscriberHandle>,
}

impl Channel {
    pub(crate) fn new(
        name: String,
        value_type: ValueType,
        value: ChannelValue,
        access: AccessMode,
        origin: ChannelOrigin,
    ) -> Self {
        Self {
            name,
            value_type,
            value,
            access,
            origin,
            subscribers: HashMap::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn value_type(&self) -> ValueType {
        self.value_type
    }

    pub fn value(&self) -> &ChannelValue {
        &self.value
    }

    pub fn access(&self) -> AccessMode {
        self.access
    }

    pub fn origin(&self) -> ChannelOrigin {
        self.origin
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.len()
    }

    pub fn has_subscriber(&self, id: SubscriberId) -> bool {
        self.subscribers.contains_key(&id)
    }

    /// Store a value and fan it out to every subscriber
    pub(crate) fn publish(&mut self, value: ChannelValue) {
        self.value = value;
        if self.subscribers.is_empty() {
            return;
        }
        let update = ChannelUpdate {
            name: self.name.clone(),
            value: self.value.clone(),
            timestamp: Utc::now(),
        };
        for subscriber in self.subscribers.values() {
            subscriber.deliver(update.clone());
        }
    }

    /// Returns true if the subscriber was not already present
    pub(crate) fn add_subscriber(&mut self, handle: SubscriberHandle) -> bool {
        if self.subscribers.contains_key(&handle.id) {
            return false;
        }
        self.subscribers.insert(handle.id, handle);
        true
    }

    /// Returns true if the subscriber was present
    pub(crate) fn remove_subscriber(&mut self, id: SubscriberId) -> bool {
        self.subscribers.remove(&id).is_some()
    }
}
