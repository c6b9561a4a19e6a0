//! The routing table

use std::collections::HashMap;

use super::{
    AccessMode, Channel, ChannelId, ChannelOrigin, ChannelValue, GetHandler, PutHandler, Route,
    RouteHandlerSet, RoutingError, RoutingResult, SubscriberHandle, SubscriberId, SubscriptionHook,
    ValueType,
};

// ─────────────────────────────────────────────────────────────────────────────
// Default Factory
// ─────────────────────────────────────────────────────────────────────────────

/// Shape of channels materialized for names no route matches
#[derive(Debug, Clone, PartialEq)]
pub struct DefaultChannel {
    pub value_type: ValueType,
    pub initial: ChannelValue,
    pub access: AccessMode,
}

impl Default for DefaultChannel {
    fn default() -> Self {
        Self {
            value_type: ValueType::Float,
            initial: ChannelValue::Float(0.0),
            access: AccessMode::ReadWrite,
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Routing Table
// ─────────────────────────────────────────────────────────────────────────────

/// Ordered routes plus the cache of every materialized channel
///
/// The table is owned by exactly one service and is never shared; all
/// operations take `&mut self`.
#[derive(Debug, Default)]
pub struct RoutingTable {
    routes: Vec<Route>,
    channels: Vec<Channel>,
    index: HashMap<String, ChannelId>,
    default_channel: DefaultChannel,
}

impl RoutingTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the default factory
    pub fn with_default_channel(mut self, default_channel: DefaultChannel) -> Self {
        self.default_channel = default_channel;
        self
    }

    /// Append a route. Channels that already exist are not affected.
    pub fn register(&mut self, pattern: &str, handlers: RouteHandlerSet) -> RoutingResult<()> {
        let route = Route::new(pattern, handlers)?;
        tracing::debug!(
            pattern,
            value_type = %route.value_type(),
            access = ?route.access(),
            "Route registered"
        );
        self.routes.push(route);
        Ok(())
    }

    /// Eagerly create a channel with a fixed name
    pub fn register_static(
        &mut self,
        name: &str,
        value_type: ValueType,
        initial: ChannelValue,
        access: AccessMode,
    ) -> RoutingResult<ChannelId> {
        if self.index.contains_key(name) {
            return Err(RoutingError::Configuration(format!(
                "channel {} registered twice",
                name
            )));
        }
        let initial = coerce(name, initial, value_type)?;
        let channel = Channel::new(name.to_string(), value_type, initial, access, ChannelOrigin::Static);
        Ok(self.insert(channel))
    }

    /// Resolve a name to its one and only channel, materializing it on first use
    pub fn resolve(&mut self, name: &str) -> ChannelId {
        if let Some(id) = self.index.get(name) {
            return *id;
        }

        // Last match wins
        let channel = match self.routes.iter().rposition(|route| route.matches(name)) {
            Some(position) => {
                let route = &self.routes[position];
                Channel::new(
                    name.to_string(),
                    route.value_type(),
                    route.value_type().default_value(),
                    route.access(),
                    ChannelOrigin::Route(position),
                )
            }
            None => Channel::new(
                name.to_string(),
                self.default_channel.value_type,
                self.default_channel.initial.clone(),
                self.default_channel.access,
                ChannelOrigin::Default,
            ),
        };

        tracing::trace!(name, origin = ?channel.origin(), "Channel materialized");
        self.insert(channel)
    }

    fn insert(&mut self, channel: Channel) -> ChannelId {
        let id = ChannelId(self.channels.len());
        self.index.insert(channel.name().to_string(), id);
        self.channels.push(channel);
        id
    }

    /// Access a channel by id
    pub fn channel(&self, id: ChannelId) -> Option<&Channel> {
        self.channels.get(id.0)
    }

    /// Access an already-materialized channel by name
    pub fn lookup(&self, name: &str) -> Option<&Channel> {
        self.index.get(name).and_then(|id| self.channels.get(id.0))
    }

    /// Names of every materialized channel, in materialization order
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.channels.iter().map(Channel::name)
    }

    pub fn route_count(&self) -> usize {
        self.routes.len()
    }

    pub fn channel_count(&self) -> usize {
        self.channels.len()
    }

    fn handlers(&self, id: ChannelId) -> Option<&RouteHandlerSet> {
        match self.channels[id.0].origin() {
            ChannelOrigin::Route(position) => self.routes.get(position).map(|r| &r.handlers),
            ChannelOrigin::Static | ChannelOrigin::Default => None,
        }
    }

    fn get_handler(&self, id: ChannelId) -> Option<GetHandler> {
        self.handlers(id).and_then(|h| h.get.clone())
    }

    fn put_handler(&self, id: ChannelId) -> Option<PutHandler> {
        self.handlers(id).and_then(|h| h.put.clone())
    }

    fn subscribe_hook(&self, id: ChannelId) -> Option<SubscriptionHook> {
        self.handlers(id).and_then(|h| h.on_subscribe.clone())
    }

    fn unsubscribe_hook(&self, id: ChannelId) -> Option<SubscriptionHook> {
        self.handlers(id).and_then(|h| h.on_unsubscribe.clone())
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Operations
    // ─────────────────────────────────────────────────────────────────────────

    /// Read a channel, refreshing it through the get handler first if one is bound
    pub async fn read(&mut self, name: &str) -> RoutingResult<ChannelValue> {
        let id = self.resolve(name);

        if let Some(get) = self.get_handler(id) {
            let fresh = get(name.to_string())
                .await
                .map_err(|source| RoutingError::Handler {
                    name: name.to_string(),
                    source,
                })?;

            if let Some(value) = fresh {
                let channel = &mut self.channels[id.0];
                let value = coerce(name, value, channel.value_type())?;
                if &value != channel.value() {
                    channel.publish(value);
                }
            }
        }

        Ok(self.channels[id.0].value().clone())
    }

    /// Write a channel through its put handler and notify subscribers
    ///
    /// Returns the value actually stored. On failure the stored value is
    /// left untouched.
    pub async fn write(&mut self, name: &str, value: ChannelValue) -> RoutingResult<ChannelValue> {
        let id = self.resolve(name);
        let (value_type, access) = {
            let channel = &self.channels[id.0];
            (channel.value_type(), channel.access())
        };

        if !access.is_writable() {
            return Err(RoutingError::AccessDenied(name.to_string()));
        }

        let requested = coerce(name, value, value_type)?;
        let stored = match self.put_handler(id) {
            Some(put) => {
                let applied = put(name.to_string(), requested)
                    .await
                    .map_err(|source| RoutingError::Handler {
                        name: name.to_string(),
                        source,
                    })?;
                coerce(name, applied, value_type)?
            }
            None => requested,
        };

        self.channels[id.0].publish(stored.clone());
        Ok(stored)
    }

    /// Update a channel from device-side logic
    ///
    /// Bypasses the access mode and handlers; subscribers are notified.
    pub fn post(&mut self, name: &str, value: ChannelValue) -> RoutingResult<()> {
        let id = self.resolve(name);
        let channel = &mut self.channels[id.0];
        let value = coerce(name, value, channel.value_type())?;
        channel.publish(value);
        Ok(())
    }

    /// Add a subscriber to a channel and return the channel's current value
    ///
    /// The route's subscribe hook fires only when the subscriber is new to
    /// the channel. If the hook fails the subscription is rolled back.
    pub async fn subscribe(&mut self, name: &str, handle: SubscriberHandle) -> RoutingResult<ChannelValue> {
        let id = self.resolve(name);
        let subscriber = handle.id;

        if self.channels[id.0].add_subscriber(handle) {
            if let Some(hook) = self.subscribe_hook(id) {
                if let Err(source) = hook(name.to_string(), subscriber).await {
                    self.channels[id.0].remove_subscriber(subscriber);
                    return Err(RoutingError::Handler {
                        name: name.to_string(),
                        source,
                    });
                }
            }
            tracing::debug!(name, %subscriber, "Subscribed");
        }

        Ok(self.channels[id.0].value().clone())
    }

    /// Remove a subscriber from a channel. Returns whether it was subscribed.
    pub async fn unsubscribe(&mut self, name: &str, subscriber: SubscriberId) -> RoutingResult<bool> {
        let id = self.resolve(name);
        self.detach(id, subscriber).await
    }

    /// Remove a subscriber from every channel it is attached to
    ///
    /// Hook failures are logged; the subscriber is removed regardless.
    /// Returns the number of subscriptions dropped.
    pub async fn drop_subscriber(&mut self, subscriber: SubscriberId) -> usize {
        let attached: Vec<ChannelId> = self
            .channels
            .iter()
            .enumerate()
            .filter(|(_, channel)| channel.has_subscriber(subscriber))
            .map(|(index, _)| ChannelId(index))
            .collect();

        let mut dropped = 0;
        for id in attached {
            match self.detach(id, subscriber).await {
                Ok(true) => dropped += 1,
                Ok(false) => {}
                Err(e) => {
                    dropped += 1;
                    tracing::warn!(%subscriber, error = %e, "Unsubscribe hook failed");
                }
            }
        }
        dropped
    }

    async fn detach(&mut self, id: ChannelId, subscriber: SubscriberId) -> RoutingResult<bool> {
        if !self.channels[id.0].remove_subscriber(subscriber) {
            return Ok(false);
        }

        let name = self.channels[id.0].name().to_string();
        tracing::debug!(name = %name, %subscriber, "Unsubscribed");

        if let Some(hook) = self.unsubscribe_hook(id) {
            hook(name.clone(), subscriber)
                .await
                .map_err(|source| RoutingError::Handler { name, source })?;
        }
        Ok(true)
    }
}

fn coerce(name: &str, value: ChannelValue, target: ValueType) -> RoutingResult<ChannelValue> {
    value.coerce(target).map_err(|source| RoutingError::InvalidValue {
        name: name.to_string(),
        source,
    })
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::routing::HandlerError;
    use std::sync::atomic::{AtomicI64, AtomicUsize, Ordering};
    use std::sync::Arc;

    fn counter_route(ticks: Arc<AtomicI64>) -> RouteHandlerSet {
        RouteHandlerSet::new(ValueType::Int).on_get(move |_| {
            let ticks = Arc::clone(&ticks);
            async move { Ok(Some(ChannelValue::Int(ticks.fetch_add(1, Ordering::SeqCst)))) }
        })
    }

    #[tokio::test]
    async fn test_resolve_is_identity_stable() {
        let mut table = RoutingTable::new();
        table
            .register(r"^COUNTER:\d+$", counter_route(Arc::new(AtomicI64::new(0))))
            .unwrap();

        let first = table.resolve("COUNTER:7");
        let again = table.resolve("COUNTER:7");
        let other = table.resolve("COUNTER:9");

        assert_eq!(first, again);
        assert_ne!(first, other);
        assert_eq!(table.channel_count(), 2);
        assert_eq!(table.channel(first).unwrap().value_type(), ValueType::Int);
    }

    #[tokio::test]
    async fn test_get_handler_refreshes_cached_value() {
        let ticks = Arc::new(AtomicI64::new(5));
        let mut table = RoutingTable::new();
        table.register(r"COUNTER:\d+", counter_route(Arc::clone(&ticks))).unwrap();

        assert_eq!(table.read("COUNTER:1").await.unwrap(), ChannelValue::Int(5));
        assert_eq!(table.read("COUNTER:1").await.unwrap(), ChannelValue::Int(6));
        assert_eq!(table.lookup("COUNTER:1").unwrap().value(), &ChannelValue::Int(6));
    }

    #[tokio::test]
    async fn test_get_handler_returning_none_keeps_value() {
        let mut table = RoutingTable::new();
        table
            .register(
                "STALE:.*",
                RouteHandlerSet::new(ValueType::Float)
                    .on_get(|_| async { Ok(None) })
                    .on_put(|_, v| async move { Ok(v) }),
            )
            .unwrap();

        table.write("STALE:A", 2.5.into()).await.unwrap();
        assert_eq!(table.read("STALE:A").await.unwrap(), ChannelValue::Float(2.5));
    }

    #[tokio::test]
    async fn test_failed_get_leaves_value_unchanged() {
        let mut table = RoutingTable::new();
        table
            .register(
                "LOST:.*",
                RouteHandlerSet::new(ValueType::Float).on_get(|_| async { Err(HandlerError::failed("device offline")) }),
            )
            .unwrap();

        table.post("LOST:A", 7.5.into()).unwrap();
        let result = table.read("LOST:A").await;
        assert!(matches!(result, Err(RoutingError::Handler { ref name, .. }) if name == "LOST:A"));
        assert_eq!(table.lookup("LOST:A").unwrap().value(), &ChannelValue::Float(7.5));
    }

    #[tokio::test]
    async fn test_last_registered_route_wins() {
        let mut table = RoutingTable::new();
        table.register("^X:.*", RouteHandlerSet::new(ValueType::Float)).unwrap();
        table
            .register(
                "^X:SPECIAL$",
                RouteHandlerSet::new(ValueType::Float).on_put(|_, v| async move { Ok(v) }),
            )
            .unwrap();

        let special = table.resolve("X:SPECIAL");
        let plain = table.resolve("X:PLAIN");
        assert_eq!(table.channel(special).unwrap().access(), AccessMode::ReadWrite);
        assert_eq!(table.channel(plain).unwrap().access(), AccessMode::ReadOnly);

        assert_eq!(table.write("X:SPECIAL", 1.5.into()).await.unwrap(), ChannelValue::Float(1.5));
    }

    #[tokio::test]
    async fn test_last_match_overrides_even_when_broader() {
        let mut table = RoutingTable::new();
        table.register("^X:SPECIAL$", RouteHandlerSet::new(ValueType::Int)).unwrap();
        table.register("^X:.*", RouteHandlerSet::new(ValueType::String)).unwrap();

        let id = table.resolve("X:SPECIAL");
        assert_eq!(table.channel(id).unwrap().value_type(), ValueType::String);
    }

    #[tokio::test]
    async fn test_write_without_put_handler_is_denied() {
        let mut table = RoutingTable::new();
        table.register("RO:.*", RouteHandlerSet::new(ValueType::Float)).unwrap();
        table.post("RO:A", 3.0.into()).unwrap();

        let result = table.write("RO:A", 9.0.into()).await;
        assert!(matches!(result, Err(RoutingError::AccessDenied(ref n)) if n == "RO:A"));
        assert_eq!(table.read("RO:A").await.unwrap(), ChannelValue::Float(3.0));
    }

    #[tokio::test]
    async fn test_read_after_write_is_coherent() {
        let mut table = RoutingTable::new();
        table
            .register("RW:.*", RouteHandlerSet::new(ValueType::Int).on_put(|_, v| async move { Ok(v) }))
            .unwrap();

        table.write("RW:1", ChannelValue::Int(42)).await.unwrap();
        assert_eq!(table.read("RW:1").await.unwrap(), ChannelValue::Int(42));
    }

    #[tokio::test]
    async fn test_put_handler_may_transform_value() {
        let mut table = RoutingTable::new();
        table
            .register(
                "CLAMP:.*",
                RouteHandlerSet::new(ValueType::Float)
                    .on_put(|_, v| async move { Ok(ChannelValue::Float(v.as_f64().unwrap_or(0.0).min(10.0))) }),
            )
            .unwrap();

        assert_eq!(table.write("CLAMP:A", 25.0.into()).await.unwrap(), ChannelValue::Float(10.0));
        assert_eq!(table.read("CLAMP:A").await.unwrap(), ChannelValue::Float(10.0));
    }

    #[tokio::test]
    async fn test_failed_put_leaves_value_unchanged() {
        let mut table = RoutingTable::new();
        table
            .register(
                "VETO:.*",
                RouteHandlerSet::new(ValueType::Float).on_put(|_, v| async move {
                    if v.as_f64().unwrap_or(0.0) < 0.0 {
                        Err(HandlerError::failed("negative"))
                    } else {
                        Ok(v)
                    }
                }),
            )
            .unwrap();

        table.write("VETO:A", 4.0.into()).await.unwrap();
        let result = table.write("VETO:A", (-1.0).into()).await;
        assert!(matches!(result, Err(RoutingError::Handler { .. })));
        assert_eq!(table.read("VETO:A").await.unwrap(), ChannelValue::Float(4.0));
    }

    #[tokio::test]
    async fn test_write_coerces_to_declared_type() {
        let mut table = RoutingTable::new();
        table
            .register("F:.*", RouteHandlerSet::new(ValueType::Float).on_put(|_, v| async move { Ok(v) }))
            .unwrap();

        assert_eq!(table.write("F:A", ChannelValue::Int(3)).await.unwrap(), ChannelValue::Float(3.0));
        let bad = table.write("F:A", "abc".into()).await;
        assert!(matches!(bad, Err(RoutingError::InvalidValue { .. })));
        assert_eq!(table.read("F:A").await.unwrap(), ChannelValue::Float(3.0));
    }

    #[tokio::test]
    async fn test_unmatched_name_uses_default_factory() {
        let mut table = RoutingTable::new();
        table.register("BPMS:.*", RouteHandlerSet::new(ValueType::Float)).unwrap();

        let id = table.resolve("ANYTHING:AT:ALL");
        let channel = table.channel(id).unwrap();
        assert_eq!(channel.origin(), ChannelOrigin::Default);
        assert_eq!(channel.value(), &ChannelValue::Float(0.0));
        assert_eq!(channel.access(), AccessMode::ReadWrite);

        table.write("ANYTHING:AT:ALL", 7.0.into()).await.unwrap();
        assert_eq!(table.read("ANYTHING:AT:ALL").await.unwrap(), ChannelValue::Float(7.0));
    }

    #[tokio::test]
    async fn test_register_does_not_affect_existing_channels() {
        let mut table = RoutingTable::new();
        let before = table.resolve("LATE:A");
        table.register("LATE:.*", RouteHandlerSet::new(ValueType::String)).unwrap();

        assert_eq!(table.resolve("LATE:A"), before);
        assert_eq!(table.channel(before).unwrap().value_type(), ValueType::Float);
        let after = table.resolve("LATE:B");
        assert_eq!(table.channel(after).unwrap().value_type(), ValueType::String);
    }

    #[tokio::test]
    async fn test_static_channels() {
        let mut table = RoutingTable::new();
        table
            .register_static("SIM:NAME", ValueType::String, "demo".into(), AccessMode::ReadOnly)
            .unwrap();

        assert_eq!(table.read("SIM:NAME").await.unwrap(), ChannelValue::from("demo"));
        assert!(matches!(
            table.write("SIM:NAME", "x".into()).await,
            Err(RoutingError::AccessDenied(_))
        ));
        assert!(matches!(
            table.register_static("SIM:NAME", ValueType::Int, 0.into(), AccessMode::ReadWrite),
            Err(RoutingError::Configuration(_))
        ));
    }

    #[tokio::test]
    async fn test_subscribe_hooks_fire_once_per_transition() {
        let subscribed = Arc::new(AtomicUsize::new(0));
        let unsubscribed = Arc::new(AtomicUsize::new(0));

        let mut table = RoutingTable::new();
        let (s, u) = (Arc::clone(&subscribed), Arc::clone(&unsubscribed));
        table
            .register(
                "SUB:.*",
                RouteHandlerSet::new(ValueType::Float)
                    .on_subscribe(move |_, _| {
                        let s = Arc::clone(&s);
                        async move {
                            s.fetch_add(1, Ordering::SeqCst);
                            Ok(())
                        }
                    })
                    .on_unsubscribe(move |_, _| {
                        let u = Arc::clone(&u);
                        async move {
                            u.fetch_add(1, Ordering::SeqCst);
                            Ok(())
                        }
                    }),
            )
            .unwrap();

        let (handle, mut rx) = SubscriberHandle::channel(8);
        let id = handle.id;
        table.subscribe("SUB:A", handle.clone()).await.unwrap();
        table.subscribe("SUB:A", handle.clone()).await.unwrap();
        assert_eq!(subscribed.load(Ordering::SeqCst), 1);

        // Notifications do not re-fire hooks
        table.post("SUB:A", 1.0.into()).unwrap();
        table.post("SUB:A", 2.0.into()).unwrap();
        assert_eq!(rx.recv().await.unwrap().value, ChannelValue::Float(1.0));
        assert_eq!(rx.recv().await.unwrap().value, ChannelValue::Float(2.0));
        assert_eq!(subscribed.load(Ordering::SeqCst), 1);

        assert!(table.unsubscribe("SUB:A", id).await.unwrap());
        assert!(!table.unsubscribe("SUB:A", id).await.unwrap());
        assert_eq!(unsubscribed.load(Ordering::SeqCst), 1);

        table.post("SUB:A", 3.0.into()).unwrap();
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_failed_subscribe_hook_rolls_back() {
        let mut table = RoutingTable::new();
        table
            .register(
                "NOSUB:.*",
                RouteHandlerSet::new(ValueType::Float)
                    .on_subscribe(|_, _| async { Err(HandlerError::failed("not monitorable")) }),
            )
            .unwrap();

        let (handle, _rx) = SubscriberHandle::channel(1);
        assert!(table.subscribe("NOSUB:A", handle).await.is_err());
        assert_eq!(table.lookup("NOSUB:A").unwrap().subscriber_count(), 0);
    }

    #[tokio::test]
    async fn test_drop_subscriber_detaches_everywhere() {
        let mut table = RoutingTable::new();
        let (handle, _rx) = SubscriberHandle::channel(8);
        let (other, _other_rx) = SubscriberHandle::channel(8);

        table.subscribe("A", handle.clone()).await.unwrap();
        table.subscribe("B", handle.clone()).await.unwrap();
        table.subscribe("B", other.clone()).await.unwrap();

        assert_eq!(table.drop_subscriber(handle.id).await, 2);
        assert_eq!(table.lookup("A").unwrap().subscriber_count(), 0);
        assert_eq!(table.lookup("B").unwrap().subscriber_count(), 1);
    }

    #[tokio::test]
    async fn test_write_notifies_subscribers() {
        let mut table = RoutingTable::new();
        let (handle, mut rx) = SubscriberHandle::channel(8);
        table.subscribe("PV:A", handle).await.unwrap();

        table.write("PV:A", 1.25.into()).await.unwrap();
        let update = rx.recv().await.unwrap();
        assert_eq!(update.name, "PV:A");
        assert_eq!(update.value, ChannelValue::Float(1.25));
    }
}
