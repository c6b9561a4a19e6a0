//! Server Application State
//!
//! Shared state accessible by all WebSocket handlers.

use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::mpsc;
use uuid::Uuid;

use simulacrum_runtime::{PvClient, SubscriberHandle};

use super::protocol::ServerMessage;

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    inner: Arc<AppStateInner>,
}

struct AppStateInner {
    /// The process whose PVs are served
    process: String,

    /// Access to the process's routing table
    pv: PvClient,

    /// Connected clients
    clients: DashMap<Uuid, ClientState>,
}

/// Per-client state
#[derive(Debug, Clone)]
pub struct ClientState {
    /// Client session ID
    pub session_id: Uuid,

    /// Where the table delivers this client's subscription updates
    pub subscriber: SubscriberHandle,

    /// Channel to send messages to this client
    pub tx: mpsc::Sender<ServerMessage>,
}

impl AppState {
    pub fn new(process: impl Into<String>, pv: PvClient) -> Self {
        Self {
            inner: Arc::new(AppStateInner {
                process: process.into(),
                pv,
                clients: DashMap::new(),
            }),
        }
    }

    pub fn process(&self) -> &str {
        &self.inner.process
    }

    pub fn pv(&self) -> &PvClient {
        &self.inner.pv
    }

    /// Register a new client connection
    pub fn register_client(&self, tx: mpsc::Sender<ServerMessage>, subscriber: SubscriberHandle) -> Uuid {
        let session_id = Uuid::new_v4();
        tracing::info!(session_id = %session_id, subscriber = %subscriber.id, "Client connected");

        self.inner.clients.insert(
            session_id,
            ClientState {
                session_id,
                subscriber,
                tx,
            },
        );
        session_id
    }

    /// Remove a client connection
    pub fn remove_client(&self, session_id: Uuid) -> Option<ClientState> {
        let removed = self.inner.clients.remove(&session_id).map(|(_, client)| client);
        if removed.is_some() {
            tracing::info!(session_id = %session_id, "Client disconnected");
        }
        removed
    }

    /// The subscriber handle of a connected client
    pub fn subscriber(&self, session_id: Uuid) -> Option<SubscriberHandle> {
        self.inner
            .clients
            .get(&session_id)
            .map(|client| client.subscriber.clone())
    }

    /// Queue a message for one client
    pub async fn send_to(&self, session_id: Uuid, msg: ServerMessage) {
        let tx = self.inner.clients.get(&session_id).map(|client| client.tx.clone());
        if let Some(tx) = tx {
            let _ = tx.send(msg).await;
        }
    }

    /// Get the number of connected clients
    pub fn client_count(&self) -> usize {
        self.inner.clients.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::devices::{BlackHole, DeviceService};
    use simulacrum_runtime::ServiceManager;

    #[tokio::test]
    async fn test_client_lifecycle() {
        let manager = ServiceManager::new();
        let handle = manager.spawn(DeviceService::new(BlackHole)).await.unwrap();
        let state = AppState::new("black-hole", PvClient::from_mailbox(handle.mailbox()));

        let (tx, mut rx) = mpsc::channel(4);
        let (subscriber, _updates) = SubscriberHandle::channel(4);
        let subscriber_id = subscriber.id;
        let session = state.register_client(tx, subscriber);
        assert_eq!(state.client_count(), 1);
        assert_eq!(state.subscriber(session).map(|s| s.id), Some(subscriber_id));

        state.send_to(session, ServerMessage::pong("1")).await;
        assert!(matches!(rx.recv().await, Some(ServerMessage::Pong { .. })));

        assert!(state.remove_client(session).is_some());
        assert!(state.remove_client(session).is_none());
        assert_eq!(state.client_count(), 0);

        manager.shutdown_all().await.unwrap();
    }
}
