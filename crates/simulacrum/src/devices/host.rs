//! Service hosting one device's routing table

use std::time::Duration;

use async_trait::async_trait;
use tokio::io::AsyncRead;
use tokio::net::TcpStream;
use tokio::task::JoinHandle;

use simulacrum_runtime::{
    Mailbox, PvClient, PvRequest, RoutingTable, Service, ServiceContext, ServiceError, ServiceResult, ServiceSpec,
    SnapshotSubscriber,
};
use simulacrum_types::Snapshot;

use super::Device;

/// First and longest wait between broadcast reconnect attempts
const RECONNECT_MIN: Duration = Duration::from_millis(100);
const RECONNECT_MAX: Duration = Duration::from_secs(2);

/// Everything a device service's mailbox accepts
#[derive(Debug)]
pub enum DeviceMessage {
    /// A client operation on the routing table
    Pv(PvRequest),
    /// A snapshot from the broadcast reader
    Snapshot(Snapshot),
}

impl From<PvRequest> for DeviceMessage {
    fn from(request: PvRequest) -> Self {
        DeviceMessage::Pv(request)
    }
}

/// Owns a device's routing table and feeds it client requests and snapshots
pub struct DeviceService<D: Device> {
    device: D,
    table: RoutingTable,
    broadcast_addr: Option<String>,
    reader: Option<JoinHandle<()>>,
}

impl<D: Device> DeviceService<D> {
    pub fn new(device: D) -> Self {
        Self {
            device,
            table: RoutingTable::new(),
            broadcast_addr: None,
            reader: None,
        }
    }

    /// Subscribe to the authority's broadcast at `addr`
    pub fn with_broadcast(mut self, addr: impl Into<String>) -> Self {
        self.broadcast_addr = Some(addr.into());
        self
    }
}

/// Why a subscription stopped delivering snapshots
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ReaderExit {
    /// The publisher went away or the stream desynchronized
    Disconnected,
    /// The device service is gone
    MailboxClosed,
}

/// Forward snapshots with one of `tags` until the connection ends
async fn read_snapshots<R>(
    subscriber: &mut SnapshotSubscriber<R>,
    tags: &'static [&'static str],
    mailbox: &Mailbox<DeviceMessage>,
) -> ReaderExit
where
    R: AsyncRead + Unpin,
{
    loop {
        match subscriber.recv_filtered(|tag| tags.contains(&tag)).await {
            Ok(Some(snapshot)) => {
                if mailbox.send(DeviceMessage::Snapshot(snapshot)).await.is_err() {
                    return ReaderExit::MailboxClosed;
                }
            }
            Ok(None) => {
                tracing::info!("Broadcast publisher closed");
                return ReaderExit::Disconnected;
            }
            Err(e) => {
                tracing::warn!(error = %e, "Broadcast subscription lost");
                return ReaderExit::Disconnected;
            }
        }
    }
}

/// Keep a subscription to `addr` alive for as long as the device runs
///
/// Every lost or desynchronized connection is dropped and re-dialed with
/// exponential backoff.
async fn follow_broadcast(
    addr: String,
    tags: &'static [&'static str],
    mailbox: Mailbox<DeviceMessage>,
    mut subscriber: Option<SnapshotSubscriber<TcpStream>>,
) {
    let mut backoff = RECONNECT_MIN;
    loop {
        if let Some(mut connected) = subscriber.take() {
            if read_snapshots(&mut connected, tags, &mailbox).await == ReaderExit::MailboxClosed {
                return;
            }
            backoff = RECONNECT_MIN;
        }
        if mailbox.is_closed() {
            return;
        }

        tokio::time::sleep(backoff).await;
        match SnapshotSubscriber::connect(addr.as_str()).await {
            Ok(connected) => {
                tracing::info!(%addr, "Broadcast subscription restored");
                subscriber = Some(connected);
            }
            Err(e) => {
                tracing::debug!(%addr, error = %e, retry_in = ?backoff, "Broadcast reconnect failed");
                backoff = (backoff * 2).min(RECONNECT_MAX);
            }
        }
    }
}

#[async_trait]
impl<D: Device> Service for DeviceService<D> {
    type Message = DeviceMessage;

    fn spec(&self) -> ServiceSpec {
        let (id, name) = self.device.name();
        ServiceSpec::new(id, name).singleton(true)
    }

    async fn on_start(&mut self, ctx: &ServiceContext<DeviceMessage>) -> ServiceResult<()> {
        let tags = self.device.snapshot_tags();
        if !tags.is_empty() {
            let addr = self.broadcast_addr.as_deref().ok_or_else(|| {
                ServiceError::InitializationFailed("device needs a broadcast address".to_string())
            })?;
            // Subscribe before setup, which may request the first broadcast
            let subscriber = match SnapshotSubscriber::connect(addr).await {
                Ok(subscriber) => Some(subscriber),
                Err(e) => {
                    tracing::warn!(%addr, error = %e, "Broadcast publisher not reachable yet, retrying");
                    None
                }
            };
            self.reader = Some(tokio::spawn(follow_broadcast(
                addr.to_string(),
                tags,
                ctx.mailbox(),
                subscriber,
            )));
        }

        let pv = PvClient::from_mailbox(ctx.mailbox());
        self.device
            .setup(&mut self.table, &pv)
            .await
            .map_err(|e| ServiceError::InitializationFailed(e.to_string()))?;

        tracing::info!(
            service_id = %ctx.service_id,
            routes = self.table.route_count(),
            channels = self.table.channel_count(),
            tags = ?tags,
            "Device started"
        );
        Ok(())
    }

    async fn on_stop(&mut self, ctx: &ServiceContext<DeviceMessage>) -> ServiceResult<()> {
        if let Some(reader) = self.reader.take() {
            reader.abort();
        }
        tracing::info!(service_id = %ctx.service_id, "Device stopped");
        Ok(())
    }

    async fn on_message(&mut self, _ctx: &ServiceContext<DeviceMessage>, message: DeviceMessage) -> ServiceResult<()> {
        match message {
            DeviceMessage::Pv(request) => self.table.serve(request).await,
            DeviceMessage::Snapshot(snapshot) => {
                let tag = snapshot.tag().to_string();
                if let Err(e) = self.device.on_snapshot(&mut self.table, snapshot) {
                    tracing::warn!(tag = %tag, error = %e, "Snapshot rejected");
                }
            }
        }
        Ok(())
    }
}
