//! Routes and their handler bundles

use std::fmt;
use std::future::Future;
use std::sync::Arc;

use futures::future::BoxFuture;
use futures::FutureExt;
use regex::Regex;

use super::{AccessMode, ChannelValue, HandlerError, RoutingError, SubscriberId, ValueType};

// ─────────────────────────────────────────────────────────────────────────────
// Handler Types
// ─────────────────────────────────────────────────────────────────────────────

pub type HandlerResult<T> = Result<T, HandlerError>;

/// Refreshes a channel before it is read. `None` keeps the cached value.
pub type GetHandler =
    Arc<dyn Fn(String) -> BoxFuture<'static, HandlerResult<Option<ChannelValue>>> + Send + Sync>;

/// Applies a write. Returns the value that is actually stored, which may be
/// transformed from the requested one.
pub type PutHandler =
    Arc<dyn Fn(String, ChannelValue) -> BoxFuture<'static, HandlerResult<ChannelValue>> + Send + Sync>;

/// Fired once when a channel gains or loses a particular subscriber
pub type SubscriptionHook =
    Arc<dyn Fn(String, SubscriberId) -> BoxFuture<'static, HandlerResult<()>> + Send + Sync>;

// ─────────────────────────────────────────────────────────────────────────────
// Route Handler Set
// ─────────────────────────────────────────────────────────────────────────────

/// Declared value type plus the optional callbacks for a route
///
/// ```ignore
/// let handlers = RouteHandlerSet::new(ValueType::Float)
///     .on_get(|name| async move { Ok(Some(lookup(&name).into())) })
///     .on_put(|_name, value| async move { Ok(value) });
/// ```
#[derive(Clone)]
pub struct RouteHandlerSet {
    pub value_type: ValueType,
    pub get: Option<GetHandler>,
    pub put: Option<PutHandler>,
    pub on_subscribe: Option<SubscriptionHook>,
    pub on_unsubscribe: Option<SubscriptionHook>,
}

impl RouteHandlerSet {
    pub fn new(value_type: ValueType) -> Self {
        Self {
            value_type,
            get: None,
            put: None,
            on_subscribe: None,
            on_unsubscribe: None,
        }
    }

    /// Build from a textual type name; unknown names are configuration errors
    pub fn typed(type_name: &str) -> Result<Self, RoutingError> {
        let value_type = type_name
            .parse::<ValueType>()
            .map_err(|e| RoutingError::Configuration(e.to_string()))?;
        Ok(Self::new(value_type))
    }

    pub fn on_get<F, Fut>(mut self, handler: F) -> Self
    where
        F: Fn(String) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = HandlerResult<Option<ChannelValue>>> + Send + 'static,
    {
        self.get = Some(Arc::new(move |name| handler(name).boxed()));
        self
    }

    pub fn on_put<F, Fut>(mut self, handler: F) -> Self
    where
        F: Fn(String, ChannelValue) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = HandlerResult<ChannelValue>> + Send + 'static,
    {
        self.put = Some(Arc::new(move |name, value| handler(name, value).boxed()));
        self
    }

    pub fn on_subscribe<F, Fut>(mut self, hook: F) -> Self
    where
        F: Fn(String, SubscriberId) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = HandlerResult<()>> + Send + 'static,
    {
        self.on_subscribe = Some(Arc::new(move |name, id| hook(name, id).boxed()));
        self
    }

    pub fn on_unsubscribe<F, Fut>(mut self, hook: F) -> Self
    where
        F: Fn(String, SubscriberId) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = HandlerResult<()>> + Send + 'static,
    {
        self.on_unsubscribe = Some(Arc::new(move |name, id| hook(name, id).boxed()));
        self
    }

    /// Read-only iff no put handler was supplied
    pub fn access(&self) -> AccessMode {
        if self.put.is_some() {
            AccessMode::ReadWrite
        } else {
            AccessMode::ReadOnly
        }
    }
}

impl fmt::Debug for RouteHandlerSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RouteHandlerSet")
            .field("value_type", &self.value_type)
            .field("get", &self.get.is_some())
            .field("put", &self.put.is_some())
            .field("on_subscribe", &self.on_subscribe.is_some())
            .field("on_unsubscribe", &self.on_unsubscribe.is_some())
            .finish()
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Route
// ─────────────────────────────────────────────────────────────────────────────

/// A compiled pattern and its handlers
#[derive(Debug, Clone)]
pub struct Route {
    source: String,
    pattern: Regex,
    pub(crate) handlers: RouteHandlerSet,
}

impl Route {
    /// Compile `pattern` anchored to the full name
    pub fn new(pattern: &str, handlers: RouteHandlerSet) -> Result<Self, RoutingError> {
        let anchored = format!("^(?:{})$", pattern);
        let compiled = Regex::new(&anchored)
            .map_err(|e| RoutingError::Configuration(format!("bad route pattern {:?}: {}", pattern, e)))?;
        Ok(Self {
            source: pattern.to_string(),
            pattern: compiled,
            handlers,
        })
    }

    pub fn pattern(&self) -> &str {
        &self.source
    }

    pub fn matches(&self, name: &str) -> bool {
        self.pattern.is_match(name)
    }

    pub fn value_type(&self) -> ValueType {
        self.handlers.value_type
    }

    pub fn access(&self) -> AccessMode {
        self.handlers.access()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_patterns_match_whole_name() {
        let route = Route::new(r"COUNTER:\d+", RouteHandlerSet::new(ValueType::Int)).unwrap();
        assert!(route.matches("COUNTER:7"));
        assert!(!route.matches("XCOUNTER:7"));
        assert!(!route.matches("COUNTER:7:X"));

        // Already-anchored patterns keep working
        let anchored = Route::new(r"^COUNTER:\d+$", RouteHandlerSet::new(ValueType::Int)).unwrap();
        assert!(anchored.matches("COUNTER:12"));
    }

    #[test]
    fn test_bad_pattern_is_configuration_error() {
        let result = Route::new("BPMS:(", RouteHandlerSet::new(ValueType::Float));
        assert!(matches!(result, Err(RoutingError::Configuration(_))));
    }

    #[test]
    fn test_unknown_type_name_is_configuration_error() {
        assert!(RouteHandlerSet::typed("double").is_ok());
        assert!(matches!(
            RouteHandlerSet::typed("complex"),
            Err(RoutingError::Configuration(_))
        ));
    }

    #[test]
    fn test_access_follows_put_handler() {
        let read_only = RouteHandlerSet::new(ValueType::Float);
        assert_eq!(read_only.access(), AccessMode::ReadOnly);

        let writable = RouteHandlerSet::new(ValueType::Float).on_put(|_, v| async move { Ok(v) });
        assert_eq!(writable.access(), AccessMode::ReadWrite);
    }
}
