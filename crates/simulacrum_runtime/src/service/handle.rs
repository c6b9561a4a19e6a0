//! Service Handle
//!
//! Handles to communicate with a running service.

use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;

use tokio::sync::{mpsc, Notify};

use super::{ServiceError, ServiceResult};

/// Current state of a service
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ServiceState {
    Starting = 0,
    Running = 1,
    Stopping = 2,
    Stopped = 3,
    /// `on_start` or `on_stop` failed
    Failed = 4,
}

impl ServiceState {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => Self::Starting,
            1 => Self::Running,
            2 => Self::Stopping,
            3 => Self::Stopped,
            _ => Self::Failed,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, ServiceState::Stopped | ServiceState::Failed)
    }

    pub fn is_running(&self) -> bool {
        *self == ServiceState::Running
    }
}

impl std::fmt::Display for ServiceState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ServiceState::Starting => "starting",
            ServiceState::Running => "running",
            ServiceState::Stopping => "stopping",
            ServiceState::Stopped => "stopped",
            ServiceState::Failed => "failed",
        };
        f.write_str(name)
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Mailbox
// ─────────────────────────────────────────────────────────────────────────────

/// Sender side of a service's message queue
///
/// Background tasks (socket readers, route handlers) hold one of these to
/// feed work back into the loop that owns the service's state.
pub struct Mailbox<M> {
    tx: mpsc::Sender<M>,
}

impl<M> Clone for Mailbox<M> {
    fn clone(&self) -> Self {
        Self { tx: self.tx.clone() }
    }
}

impl<M: Send + 'static> Mailbox<M> {
    pub(crate) fn new(tx: mpsc::Sender<M>) -> Self {
        Self { tx }
    }

    /// Deliver a message, waiting for queue space
    pub async fn send(&self, message: impl Into<M>) -> ServiceResult<()> {
        self.tx
            .send(message.into())
            .await
            .map_err(|_| ServiceError::ChannelClosed)
    }

    /// Deliver a message without waiting; fails when the queue is full
    pub fn try_send(&self, message: impl Into<M>) -> ServiceResult<()> {
        self.tx
            .try_send(message.into())
            .map_err(|_| ServiceError::ChannelClosed)
    }

    /// True once the owning service loop has exited
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Service Control
// ─────────────────────────────────────────────────────────────────────────────

/// Shared lifecycle state of one service
#[derive(Clone)]
pub(crate) struct ServiceControl {
    pub(crate) service_id: String,
    stop: Arc<Notify>,
    state: Arc<AtomicU8>,
}

impl ServiceControl {
    pub(crate) fn new(service_id: String) -> Self {
        Self {
            service_id,
            stop: Arc::new(Notify::new()),
            state: Arc::new(AtomicU8::new(ServiceState::Starting as u8)),
        }
    }

    pub(crate) fn state(&self) -> ServiceState {
        ServiceState::from_u8(self.state.load(Ordering::SeqCst))
    }

    pub(crate) fn set_state(&self, state: ServiceState) {
        self.state.store(state as u8, Ordering::SeqCst);
    }

    /// Ask the service loop to stop; remembered if the loop is busy
    pub(crate) fn request_stop(&self) {
        self.stop.notify_one();
    }

    pub(crate) async fn stop_requested(&self) {
        self.stop.notified().await
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Service Handle
// ─────────────────────────────────────────────────────────────────────────────

/// Cloneable handle to a running service
pub struct ServiceHandle<M> {
    control: ServiceControl,
    mailbox: Mailbox<M>,
}

impl<M> Clone for ServiceHandle<M> {
    fn clone(&self) -> Self {
        Self {
            control: self.control.clone(),
            mailbox: self.mailbox.clone(),
        }
    }
}

impl<M: Send + 'static> ServiceHandle<M> {
    pub(crate) fn new(control: ServiceControl, mailbox: Mailbox<M>) -> Self {
        Self { control, mailbox }
    }

    pub fn service_id(&self) -> &str {
        &self.control.service_id
    }

    pub fn state(&self) -> ServiceState {
        self.control.state()
    }

    pub fn is_running(&self) -> bool {
        self.state().is_running()
    }

    pub fn is_terminal(&self) -> bool {
        self.state().is_terminal()
    }

    /// Send a message to this service
    pub async fn send(&self, message: impl Into<M>) -> ServiceResult<()> {
        self.mailbox
            .send(message)
            .await
            .map_err(|_| ServiceError::NotRunning(self.control.service_id.clone()))
    }

    pub fn mailbox(&self) -> Mailbox<M> {
        self.mailbox.clone()
    }

    /// Request graceful shutdown without waiting for it
    pub fn shutdown(&self) {
        self.control.request_stop();
    }
}

impl<M> std::fmt::Debug for ServiceHandle<M> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServiceHandle")
            .field("service_id", &self.control.service_id)
            .field("state", &self.control.state())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_round_trips_through_control() {
        let control = ServiceControl::new("svc".to_string());
        assert_eq!(control.state(), ServiceState::Starting);

        control.set_state(ServiceState::Running);
        assert!(control.state().is_running());

        control.set_state(ServiceState::Failed);
        assert!(control.state().is_terminal());
        assert_eq!(control.state().to_string(), "failed");
    }

    #[tokio::test]
    async fn test_stop_request_is_remembered() {
        let control = ServiceControl::new("svc".to_string());
        control.request_stop();
        tokio::time::timeout(std::time::Duration::from_millis(100), control.stop_requested())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_mailbox_closes_with_its_receiver() {
        let (tx, rx) = mpsc::channel::<u32>(1);
        let mailbox = Mailbox::new(tx);
        assert!(!mailbox.is_closed());
        mailbox.send(1u32).await.unwrap();

        drop(rx);
        assert!(mailbox.is_closed());
        assert!(matches!(mailbox.send(2u32).await, Err(ServiceError::ChannelClosed)));
    }
}
