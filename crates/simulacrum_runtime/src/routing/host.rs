//! Serving a routing table from the service that owns it
//!
//! The table lives inside exactly one service. Everything else (WebSocket
//! sessions, broadcast readers, handler side effects) reaches it by posting a
//! [`PvRequest`] into that service's mailbox through a [`PvClient`].

use std::sync::Arc;

use futures::future::BoxFuture;
use futures::FutureExt;
use tokio::sync::oneshot;

use super::{ChannelValue, RoutingError, RoutingResult, RoutingTable, SubscriberHandle, SubscriberId};
use crate::service::{Mailbox, ServiceError};

// ─────────────────────────────────────────────────────────────────────────────
// Requests
// ─────────────────────────────────────────────────────────────────────────────

/// An operation on the owning service's routing table
#[derive(Debug)]
pub enum PvRequest {
    Read {
        name: String,
        reply: oneshot::Sender<RoutingResult<ChannelValue>>,
    },
    Write {
        name: String,
        value: ChannelValue,
        reply: oneshot::Sender<RoutingResult<ChannelValue>>,
    },
    Subscribe {
        name: String,
        handle: SubscriberHandle,
        reply: oneshot::Sender<RoutingResult<ChannelValue>>,
    },
    Unsubscribe {
        name: String,
        subscriber: SubscriberId,
        reply: oneshot::Sender<RoutingResult<bool>>,
    },
    DropSubscriber {
        subscriber: SubscriberId,
    },
    /// Fire-and-forget update from device logic
    Post { name: String, value: ChannelValue },
}

impl RoutingTable {
    /// Execute one request against this table and reply to the caller
    pub async fn serve(&mut self, request: PvRequest) {
        match request {
            PvRequest::Read { name, reply } => {
                let _ = reply.send(self.read(&name).await);
            }
            PvRequest::Write { name, value, reply } => {
                let result = self.write(&name, value).await;
                if let Err(e) = &result {
                    tracing::debug!(name = %name, error = %e, "Write rejected");
                }
                let _ = reply.send(result);
            }
            PvRequest::Subscribe { name, handle, reply } => {
                let _ = reply.send(self.subscribe(&name, handle).await);
            }
            PvRequest::Unsubscribe {
                name,
                subscriber,
                reply,
            } => {
                let _ = reply.send(self.unsubscribe(&name, subscriber).await);
            }
            PvRequest::DropSubscriber { subscriber } => {
                let dropped = self.drop_subscriber(subscriber).await;
                tracing::debug!(%subscriber, dropped, "Subscriber dropped");
            }
            PvRequest::Post { name, value } => {
                if let Err(e) = self.post(&name, value) {
                    tracing::warn!(name = %name, error = %e, "Post failed");
                }
            }
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Client
// ─────────────────────────────────────────────────────────────────────────────

/// Anything that can carry a [`PvRequest`] to the table's owner
trait PvSink: Send + Sync {
    fn send(&self, request: PvRequest) -> BoxFuture<'static, Result<(), ServiceError>>;
    fn try_send(&self, request: PvRequest) -> Result<(), ServiceError>;
}

impl<M> PvSink for Mailbox<M>
where
    M: From<PvRequest> + Send + 'static,
{
    fn send(&self, request: PvRequest) -> BoxFuture<'static, Result<(), ServiceError>> {
        let mailbox = self.clone();
        async move { mailbox.send(request).await }.boxed()
    }

    fn try_send(&self, request: PvRequest) -> Result<(), ServiceError> {
        Mailbox::try_send(self, request)
    }
}

/// Cloneable, type-erased access to a service's routing table
///
/// Handlers running inside the owning service must only use [`PvClient::post`];
/// the request/reply methods would wait on the service that is running them.
#[derive(Clone)]
pub struct PvClient {
    sink: Arc<dyn PvSink>,
}

impl PvClient {
    /// Talk to the service behind `mailbox`
    pub fn from_mailbox<M>(mailbox: Mailbox<M>) -> Self
    where
        M: From<PvRequest> + Send + 'static,
    {
        Self {
            sink: Arc::new(mailbox),
        }
    }

    async fn call<T>(&self, build: impl FnOnce(oneshot::Sender<T>) -> PvRequest) -> RoutingResult<T> {
        let (tx, rx) = oneshot::channel();
        self.sink
            .send(build(tx))
            .await
            .map_err(|_| RoutingError::HostUnavailable)?;
        rx.await.map_err(|_| RoutingError::HostUnavailable)
    }

    pub async fn read(&self, name: impl Into<String>) -> RoutingResult<ChannelValue> {
        let name = name.into();
        self.call(|reply| PvRequest::Read { name, reply }).await?
    }

    pub async fn write(&self, name: impl Into<String>, value: ChannelValue) -> RoutingResult<ChannelValue> {
        let name = name.into();
        self.call(|reply| PvRequest::Write { name, value, reply }).await?
    }

    pub async fn subscribe(&self, name: impl Into<String>, handle: SubscriberHandle) -> RoutingResult<ChannelValue> {
        let name = name.into();
        self.call(|reply| PvRequest::Subscribe { name, handle, reply })
            .await?
    }

    pub async fn unsubscribe(&self, name: impl Into<String>, subscriber: SubscriberId) -> RoutingResult<bool> {
        let name = name.into();
        self.call(|reply| PvRequest::Unsubscribe {
            name,
            subscriber,
            reply,
        })
        .await?
    }

    /// Drop every subscription held by `subscriber`
    pub async fn drop_subscriber(&self, subscriber: SubscriberId) -> RoutingResult<()> {
        self.sink
            .send(PvRequest::DropSubscriber { subscriber })
            .await
            .map_err(|_| RoutingError::HostUnavailable)
    }

    /// Queue an update without waiting. Safe to call from inside handlers.
    pub fn post(&self, name: impl Into<String>, value: impl Into<ChannelValue>) -> RoutingResult<()> {
        self.sink
            .try_send(PvRequest::Post {
                name: name.into(),
                value: value.into(),
            })
            .map_err(|_| RoutingError::HostUnavailable)
    }
}

impl std::fmt::Debug for PvClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PvClient").finish_non_exhaustive()
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::routing::{RouteHandlerSet, ValueType};
    use crate::service::{Service, ServiceContext, ServiceManager, ServiceResult, ServiceSpec};
    use std::time::Duration;

    struct TableService {
        table: RoutingTable,
    }

    #[async_trait::async_trait]
    impl Service for TableService {
        type Message = PvRequest;

        fn spec(&self) -> ServiceSpec {
            ServiceSpec::new("table", "Table Host")
        }

        async fn on_start(&mut self, _ctx: &ServiceContext<PvRequest>) -> ServiceResult<()> {
            Ok(())
        }

        async fn on_stop(&mut self, _ctx: &ServiceContext<PvRequest>) -> ServiceResult<()> {
            Ok(())
        }

        async fn on_message(&mut self, _ctx: &ServiceContext<PvRequest>, message: PvRequest) -> ServiceResult<()> {
            self.table.serve(message).await;
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_client_round_trip_through_owning_service() {
        let mut table = RoutingTable::new();
        table
            .register("RW:.*", RouteHandlerSet::new(ValueType::Int).on_put(|_, v| async move { Ok(v) }))
            .unwrap();
        table.register("RO:.*", RouteHandlerSet::new(ValueType::Int)).unwrap();

        let manager = ServiceManager::new();
        let handle = manager.spawn(TableService { table }).await.unwrap();
        let client = PvClient::from_mailbox(handle.mailbox());

        assert_eq!(client.write("RW:1", 7.into()).await.unwrap(), ChannelValue::Int(7));
        assert_eq!(client.read("RW:1").await.unwrap(), ChannelValue::Int(7));
        assert!(matches!(
            client.write("RO:1", 1.into()).await,
            Err(RoutingError::AccessDenied(_))
        ));

        let (subscriber, mut rx) = SubscriberHandle::channel(4);
        client.subscribe("RO:1", subscriber.clone()).await.unwrap();
        client.post("RO:1", 3).unwrap();
        let update = tokio::time::timeout(Duration::from_secs(1), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(update.value, ChannelValue::Int(3));

        client.drop_subscriber(subscriber.id).await.unwrap();
        assert!(!client.unsubscribe("RO:1", subscriber.id).await.unwrap());

        manager.shutdown_all().await.unwrap();
        assert!(matches!(client.read("RW:1").await, Err(RoutingError::HostUnavailable)));
    }
}
