//! Service Lifecycle Management
//!
//! Every Simulacrum process is built from services: long-running components
//! that own their state exclusively and are driven by a single task. The
//! model authority, each device host, and the scheduler loops are services.
//!
//! # Lifecycle
//!
//! Services have the following lifecycle hooks:
//! - `on_start`: Called when the service starts
//! - `on_stop`: Called when the service stops
//! - `on_message`: Called for each message posted to the service's mailbox
//! - `on_tick`: Called when one of the service's named timers fires
//!
//! All hooks of one service run on the same task, one at a time, so a
//! service never needs to lock its own state.

mod handle;
mod manager;

pub use handle::*;
pub use manager::*;

use std::time::Duration;

use async_trait::async_trait;

/// Errors that can occur during service lifecycle
#[derive(Debug, Clone, thiserror::Error)]
pub enum ServiceError {
    #[error("Service initialization failed: {0}")]
    InitializationFailed(String),

    #[error("Service already running: {0}")]
    AlreadyRunning(String),

    #[error("Service not running: {0}")]
    NotRunning(String),

    #[error("Shutdown timeout")]
    ShutdownTimeout,

    #[error("Channel closed")]
    ChannelClosed,

    #[error("Internal error: {0}")]
    Internal(String),
}

pub type ServiceResult<T> = Result<T, ServiceError>;

// ─────────────────────────────────────────────────────────────────────────────
// Service Specification
// ─────────────────────────────────────────────────────────────────────────────

/// A named periodic timer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TimerSpec {
    pub name: String,
    pub period: Duration,
}

/// Identity, timers and shutdown budget of a service
#[derive(Debug, Clone)]
pub struct ServiceSpec {
    pub id: String,
    pub name: String,
    pub description: Option<String>,

    /// Delivered to `on_tick` by name. Missed ticks are skipped, not bursted.
    pub timers: Vec<TimerSpec>,

    /// Refuse a second service with the same id
    pub singleton: bool,

    /// How long `on_stop` may take
    pub shutdown_timeout: Duration,
}

impl ServiceSpec {
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            description: None,
            timers: Vec::new(),
            singleton: true,
            shutdown_timeout: Duration::from_secs(10),
        }
    }

    pub fn with_timer(mut self, name: impl Into<String>, period: Duration) -> Self {
        self.timers.push(TimerSpec {
            name: name.into(),
            period,
        });
        self
    }

    pub fn singleton(mut self, singleton: bool) -> Self {
        self.singleton = singleton;
        self
    }

    pub fn with_description(mut self, desc: impl Into<String>) -> Self {
        self.description = Some(desc.into());
        self
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Service Context
// ─────────────────────────────────────────────────────────────────────────────

/// Context passed to service lifecycle methods
pub struct ServiceContext<M> {
    pub service_id: String,
    mailbox: Mailbox<M>,
}

impl<M: Send + 'static> ServiceContext<M> {
    pub(crate) fn new(service_id: String, mailbox: Mailbox<M>) -> Self {
        Self { service_id, mailbox }
    }

    /// A sender that delivers messages to this service's `on_message`
    pub fn mailbox(&self) -> Mailbox<M> {
        self.mailbox.clone()
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Service Trait
// ─────────────────────────────────────────────────────────────────────────────

/// A long-running component driven by one task
#[async_trait]
pub trait Service: Send + 'static {
    /// Messages accepted by this service's mailbox
    type Message: Send + 'static;

    fn spec(&self) -> ServiceSpec;

    /// Bind sockets and spawn background readers here. If this returns an
    /// error, the service is marked failed and never runs.
    async fn on_start(&mut self, ctx: &ServiceContext<Self::Message>) -> ServiceResult<()>;

    /// Release sockets and abort background tasks. The service is stopped
    /// even if this returns an error.
    async fn on_stop(&mut self, ctx: &ServiceContext<Self::Message>) -> ServiceResult<()>;

    async fn on_message(
        &mut self,
        _ctx: &ServiceContext<Self::Message>,
        _message: Self::Message,
    ) -> ServiceResult<()> {
        Ok(())
    }

    async fn on_tick(&mut self, _ctx: &ServiceContext<Self::Message>, _timer: &str) -> ServiceResult<()> {
        Ok(())
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
