//! Channel Routing
//!
//! A process exposes an open-ended namespace of PVs without registering
//! every name up front. Routes pair a regular expression with a value type
//! and optional get/put/subscribe handlers; the first time a name is seen it
//! is matched against the routes and materialized into a [`Channel`] that is
//! cached for the rest of the process lifetime.
//!
//! # Resolution rules
//!
//! - Patterns are anchored against the whole name.
//! - When several routes match, the one registered **last** wins.
//! - Names that match nothing resolve through the default factory, which
//!   produces a disconnected read-write float channel initialized to zero.
//! - Exactly one channel exists per name; repeated resolution returns the
//!   same [`ChannelId`].

mod channel;
mod host;
mod route;
mod table;

pub use channel::*;
pub use host::*;
pub use route::*;
pub use table::*;

pub use simulacrum_types::{AccessMode, ChannelValue, ValueError, ValueType};

// ─────────────────────────────────────────────────────────────────────────────
// Errors
// ─────────────────────────────────────────────────────────────────────────────

/// Failure raised by a route's get/put/subscribe handler
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum HandlerError {
    /// The handler refused or could not perform the operation
    #[error("{0}")]
    Failed(String),

    /// A remote call made by the handler failed
    #[error("Remote call failed: {0}")]
    Remote(String),

    /// The handler produced or received a value of the wrong kind
    #[error(transparent)]
    Value(#[from] ValueError),
}

impl HandlerError {
    pub fn failed(message: impl Into<String>) -> Self {
        HandlerError::Failed(message.into())
    }
}

/// Errors returned by routing table operations
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum RoutingError {
    /// Invalid route pattern or value type; fatal at startup
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Write to a channel without a put handler
    #[error("Access denied: {0} is read-only")]
    AccessDenied(String),

    /// A handler failed; the channel's stored value is unchanged
    #[error("Handler for {name} failed: {source}")]
    Handler {
        name: String,
        #[source]
        source: HandlerError,
    },

    /// The value cannot be stored in the channel's declared type
    #[error("Invalid value for {name}: {source}")]
    InvalidValue {
        name: String,
        #[source]
        source: ValueError,
    },

    /// The service owning the table is gone
    #[error("Channel host unavailable")]
    HostUnavailable,
}

pub type RoutingResult<T> = Result<T, RoutingError>;
