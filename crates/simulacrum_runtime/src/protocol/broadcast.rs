//! Snapshot broadcast channel (authority → many subscribers)
//!
//! Fire-and-forget fan-out. Each connected subscriber gets its own writer
//! task fed from a bounded broadcast queue; a subscriber that falls behind
//! skips the snapshots it missed and continues with the newest ones. Every
//! snapshot is written as one metadata/payload pair in a single write, so a
//! slow subscriber never sees a torn pair.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use simulacrum_types::{Snapshot, SnapshotMetadata};
use tokio::io::AsyncRead;
use tokio::net::{TcpListener, TcpStream, ToSocketAddrs};
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;

use super::{FrameReader, FrameType, FrameWriter, ProtocolError};

/// Snapshots queued per subscriber before the oldest are skipped
const SUBSCRIBER_BACKLOG: usize = 16;

/// A snapshot with its metadata already serialized
#[derive(Debug)]
struct EncodedSnapshot {
    tag: String,
    metadata: Bytes,
    payload: Bytes,
}

// ─────────────────────────────────────────────────────────────────────────────
// Publisher
// ─────────────────────────────────────────────────────────────────────────────

/// Publishing end of the broadcast channel
pub struct BroadcastPublisher {
    tx: broadcast::Sender<Arc<EncodedSnapshot>>,
    local_addr: SocketAddr,
    accept_task: JoinHandle<()>,
    published: AtomicU64,
}

impl BroadcastPublisher {
    /// Bind the listening socket and start accepting subscribers
    pub async fn bind(addr: impl ToSocketAddrs) -> Result<Self, ProtocolError> {
        let listener = TcpListener::bind(addr).await?;
        let local_addr = listener.local_addr()?;
        let (tx, _) = broadcast::channel(SUBSCRIBER_BACKLOG);

        let accept_tx = tx.clone();
        let accept_task = tokio::spawn(async move {
            loop {
                match listener.accept().await {
                    Ok((stream, peer)) => {
                        tracing::info!(%peer, "Broadcast subscriber connected");
                        let rx = accept_tx.subscribe();
                        tokio::spawn(feed_subscriber(stream, peer, rx));
                    }
                    Err(e) => {
                        tracing::warn!(error = %e, "Broadcast accept failed");
                    }
                }
            }
        });

        tracing::info!(addr = %local_addr, "Broadcast publisher listening");

        Ok(Self {
            tx,
            local_addr,
            accept_task,
            published: AtomicU64::new(0),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Number of currently connected subscribers
    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }

    /// Total snapshots published since bind
    pub fn published(&self) -> u64 {
        self.published.load(Ordering::Relaxed)
    }

    /// Queue a snapshot for every connected subscriber
    ///
    /// Returns the number of subscribers it was queued for. Having no
    /// subscribers is not an error.
    pub fn publish(&self, snapshot: &Snapshot) -> Result<usize, ProtocolError> {
        let encoded = Arc::new(EncodedSnapshot {
            tag: snapshot.metadata.tag.clone(),
            metadata: Bytes::from(serde_json::to_vec(&snapshot.metadata)?),
            payload: snapshot.payload.clone(),
        });
        self.published.fetch_add(1, Ordering::Relaxed);
        let receivers = self.tx.send(encoded).unwrap_or(0);
        tracing::trace!(tag = %snapshot.metadata.tag, receivers, "Snapshot published");
        Ok(receivers)
    }

    /// Stop accepting subscribers
    ///
    /// Connected writer tasks finish once the publisher is dropped.
    pub fn shutdown(&self) {
        self.accept_task.abort();
    }
}

impl Drop for BroadcastPublisher {
    fn drop(&mut self) {
        self.accept_task.abort();
    }
}

async fn feed_subscriber(stream: TcpStream, peer: SocketAddr, mut rx: broadcast::Receiver<Arc<EncodedSnapshot>>) {
    let _ = stream.set_nodelay(true);
    let mut writer = FrameWriter::new(stream);

    loop {
        match rx.recv().await {
            Ok(snapshot) => {
                if let Err(e) = writer.send_pair(&snapshot.metadata, &snapshot.payload).await {
                    tracing::info!(%peer, error = %e, "Broadcast subscriber disconnected");
                    break;
                }
                tracing::trace!(%peer, tag = %snapshot.tag, "Snapshot sent");
            }
            Err(RecvError::Lagged(skipped)) => {
                tracing::warn!(%peer, skipped, "Slow broadcast subscriber, skipping to newest snapshots");
            }
            Err(RecvError::Closed) => break,
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Subscriber
// ─────────────────────────────────────────────────────────────────────────────

/// Receiving end of the broadcast channel
///
/// Every metadata frame read is followed by exactly one payload frame read,
/// whether or not the tag is wanted.
pub struct SnapshotSubscriber<R> {
    reader: FrameReader<R>,
    metadata_reads: u64,
    payload_reads: u64,
}

impl SnapshotSubscriber<TcpStream> {
    /// Connect to a publisher
    pub async fn connect(addr: impl ToSocketAddrs) -> Result<Self, ProtocolError> {
        let stream = TcpStream::connect(addr).await?;
        Ok(Self::new(stream))
    }
}

impl<R: AsyncRead + Unpin> SnapshotSubscriber<R> {
    pub fn new(reader: R) -> Self {
        Self {
            reader: FrameReader::new(reader),
            metadata_reads: 0,
            payload_reads: 0,
        }
    }

    pub fn metadata_reads(&self) -> u64 {
        self.metadata_reads
    }

    pub fn payload_reads(&self) -> u64 {
        self.payload_reads
    }

    /// Read one metadata/payload pair. Returns `None` when the publisher is gone.
    pub async fn recv(&mut self) -> Result<Option<Snapshot>, ProtocolError> {
        let metadata = match self.reader.recv().await? {
            Some(frame) => frame.expect(FrameType::Metadata)?,
            None => return Ok(None),
        };
        self.metadata_reads += 1;

        // Drain the payload before looking at the metadata
        let payload = self.reader.recv_required().await?.expect(FrameType::Payload)?;
        self.payload_reads += 1;

        let metadata: SnapshotMetadata = serde_json::from_slice(&metadata.payload)?;
        Ok(Some(Snapshot {
            metadata,
            payload: payload.payload,
        }))
    }

    /// Read until a snapshot whose tag `accepts` returns true for
    ///
    /// Snapshots with other tags are drained and discarded.
    pub async fn recv_filtered<F>(&mut self, accepts: F) -> Result<Option<Snapshot>, ProtocolError>
    where
        F: Fn(&str) -> bool,
    {
        loop {
            match self.recv().await? {
                Some(snapshot) if accepts(snapshot.tag()) => return Ok(Some(snapshot)),
                Some(snapshot) => {
                    tracing::trace!(tag = %snapshot.tag(), "Ignoring snapshot");
                }
                None => return Ok(None),
            }
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
