//! Simulacrum Runtime
//!
//! The substrate every simulator process is built on:
//!
//! - [`service`]: service lifecycle, mailboxes and named timers
//! - [`routing`]: the pattern-routed channel table that backs a process's PV namespace
//! - [`protocol`]: frame codec, snapshot broadcast and the command channel
//! - [`scheduler`]: dirty-flag gated refresh of push tables and broadcasts

pub mod protocol;
pub mod routing;
pub mod scheduler;
pub mod service;

pub use protocol::{
    BroadcastPublisher, CommandClient, CommandEnvelope, CommandError, CommandServer, FrameReader,
    FrameType, FrameWriter, ProtocolError, SharedCommandClient, SnapshotSubscriber,
};
pub use routing::{
    AccessMode, Channel, ChannelId, ChannelOrigin, ChannelUpdate, ChannelValue, DefaultChannel,
    HandlerError, HandlerResult, PvClient, PvRequest, RouteHandlerSet, RoutingError, RoutingResult,
    RoutingTable, SubscriberHandle, SubscriberId, ValueType,
};
pub use scheduler::{BroadcastReport, DirtyFlags, RefreshScheduler, RefreshTarget};
pub use service::{
    Mailbox, Service, ServiceContext, ServiceError, ServiceHandle, ServiceManager, ServiceResult,
    ServiceSpec, ServiceState,
};
