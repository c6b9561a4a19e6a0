//! Command channel (device process → authority, synchronous)
//!
//! Each connection carries strictly alternating request and reply frames.
//! The server side hands every request to the authority service as a
//! [`CommandEnvelope`] and waits for its reply before reading the next
//! request, so the authority executes commands one at a time in arrival
//! order on its own loop.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use simulacrum_types::{CommandReply, CommandRequest};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream, ToSocketAddrs};
use tokio::sync::{oneshot, Mutex};
use tokio::task::{JoinHandle, JoinSet};

use super::{FrameReader, FrameType, FrameWriter, ProtocolError};
use crate::service::Mailbox;

/// Errors seen by command clients
#[derive(Debug, thiserror::Error)]
pub enum CommandError {
    /// The authority executed the command and reported a failure
    #[error("Command failed: {0}")]
    Failed(String),

    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    #[error("Unexpected result: {0}")]
    UnexpectedResult(String),

    #[error("Command timed out after {0:?}")]
    Timeout(Duration),
}

// ─────────────────────────────────────────────────────────────────────────────
// Envelope
// ─────────────────────────────────────────────────────────────────────────────

/// A request delivered to the authority together with its reply slot
#[derive(Debug)]
pub struct CommandEnvelope {
    pub request: CommandRequest,
    reply: oneshot::Sender<CommandReply>,
}

impl CommandEnvelope {
    pub fn new(request: CommandRequest) -> (Self, oneshot::Receiver<CommandReply>) {
        let (reply, rx) = oneshot::channel();
        (Self { request, reply }, rx)
    }

    /// Send the reply; the connection may already be gone
    pub fn respond(self, reply: CommandReply) {
        let _ = self.reply.send(reply);
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Server
// ─────────────────────────────────────────────────────────────────────────────

/// Accepts command connections and forwards requests to a service mailbox
pub struct CommandServer {
    local_addr: SocketAddr,
    accept_task: JoinHandle<()>,
}

impl CommandServer {
    pub async fn bind<M>(addr: impl ToSocketAddrs, mailbox: Mailbox<M>) -> Result<Self, ProtocolError>
    where
        M: From<CommandEnvelope> + Send + 'static,
    {
        let listener = TcpListener::bind(addr).await?;
        let local_addr = listener.local_addr()?;

        let accept_task = tokio::spawn(async move {
            // Aborting the accept task drops this set, which closes every connection
            let mut connections = JoinSet::new();
            loop {
                tokio::select! {
                    accepted = listener.accept() => match accepted {
                        Ok((stream, peer)) => {
                            tracing::info!(%peer, "Command client connected");
                            connections.spawn(serve_connection(stream, peer, mailbox.clone()));
                        }
                        Err(e) => {
                            tracing::warn!(error = %e, "Command accept failed");
                        }
                    },
                    Some(_) = connections.join_next(), if !connections.is_empty() => {}
                }
            }
        });

        tracing::info!(addr = %local_addr, "Command server listening");
        Ok(Self {
            local_addr,
            accept_task,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Stop accepting connections and close the open ones
    pub fn shutdown(&self) {
        self.accept_task.abort();
    }
}

impl Drop for CommandServer {
    fn drop(&mut self) {
        self.accept_task.abort();
    }
}

async fn serve_connection<M>(stream: TcpStream, peer: SocketAddr, mailbox: Mailbox<M>)
where
    M: From<CommandEnvelope> + Send + 'static,
{
    let _ = stream.set_nodelay(true);
    let (read_half, write_half) = stream.into_split();
    let mut reader = FrameReader::new(read_half);
    let mut writer = FrameWriter::new(write_half);

    loop {
        let frame = match reader.recv().await {
            Ok(Some(frame)) => frame,
            Ok(None) => break,
            Err(e) => {
                tracing::warn!(%peer, error = %e, "Command connection failed");
                break;
            }
        };

        let reply = if frame.frame_type != FrameType::Request {
            CommandReply::fail(format!("expected a request frame, got {:?}", frame.frame_type))
        } else {
            match serde_json::from_slice::<CommandRequest>(&frame.payload) {
                Ok(request) => dispatch(&mailbox, request).await,
                Err(e) => CommandReply::fail(format!("malformed request: {}", e)),
            }
        };

        if let Err(e) = writer.send_json(FrameType::Reply, &reply).await {
            tracing::warn!(%peer, error = %e, "Failed to send command reply");
            break;
        }
    }

    tracing::info!(%peer, "Command client disconnected");
}

async fn dispatch<M>(mailbox: &Mailbox<M>, request: CommandRequest) -> CommandReply
where
    M: From<CommandEnvelope> + Send + 'static,
{
    let kind = request.kind();
    let (envelope, rx) = CommandEnvelope::new(request);
    if mailbox.send(envelope).await.is_err() {
        return CommandReply::fail("authority unavailable");
    }
    match rx.await {
        Ok(reply) => reply,
        Err(_) => {
            tracing::warn!(kind, "Command dropped without a reply");
            CommandReply::fail("authority dropped the request")
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Client
// ─────────────────────────────────────────────────────────────────────────────

/// One connection to the authority's command server
///
/// `&mut self` on every call enforces one outstanding request at a time.
pub struct CommandClient {
    reader: FrameReader<OwnedReadHalf>,
    writer: FrameWriter<OwnedWriteHalf>,
    timeout: Option<Duration>,
}

impl CommandClient {
    pub async fn connect(addr: impl ToSocketAddrs) -> Result<Self, ProtocolError> {
        let stream = TcpStream::connect(addr).await?;
        let _ = stream.set_nodelay(true);
        let (read_half, write_half) = stream.into_split();
        Ok(Self {
            reader: FrameReader::new(read_half),
            writer: FrameWriter::new(write_half),
            timeout: None,
        })
    }

    /// Fail requests whose reply takes longer than `timeout`
    ///
    /// A timed-out connection is no longer in lockstep and should be dropped.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Send one request and wait for its reply
    pub async fn request(&mut self, request: &CommandRequest) -> Result<CommandReply, CommandError> {
        let timeout = self.timeout;
        let Self { reader, writer, .. } = self;
        let exchange = async {
            writer.send_json(FrameType::Request, request).await?;
            let frame = reader.recv_required().await?.expect(FrameType::Reply)?;
            Ok::<_, ProtocolError>(serde_json::from_slice::<CommandReply>(&frame.payload)?)
        };

        match timeout {
            Some(timeout) => tokio::time::timeout(timeout, exchange)
                .await
                .map_err(|_| CommandError::Timeout(timeout))?
                .map_err(CommandError::from),
            None => exchange.await.map_err(CommandError::from),
        }
    }

    /// Send a request and turn a `fail` reply into [`CommandError::Failed`]
    pub async fn call(&mut self, request: &CommandRequest) -> Result<Option<Value>, CommandError> {
        self.request(request).await?.into_result().map_err(CommandError::Failed)
    }

    /// Evaluate one instruction and return its output lines
    pub async fn evaluate(&mut self, instruction: &str) -> Result<Vec<String>, CommandError> {
        let result = self.call(&CommandRequest::evaluate(instruction)).await?;
        lines(result)
    }

    /// Evaluate several instructions as one batch
    pub async fn evaluate_batch(&mut self, instructions: &[String]) -> Result<Vec<Vec<String>>, CommandError> {
        let result = self
            .call(&CommandRequest::EvaluateBatch(instructions.to_vec()))
            .await?;
        match result {
            Some(value) => serde_json::from_value(value).map_err(|e| CommandError::UnexpectedResult(e.to_string())),
            None => Ok(Vec::new()),
        }
    }

    /// Ask the authority to recompute and broadcast on its next ticks
    pub async fn mark_dirty(&mut self, kind: Option<&str>) -> Result<(), CommandError> {
        self.call(&CommandRequest::MarkDirty(kind.map(str::to_string)))
            .await
            .map(|_| ())
    }

    /// Liveness check
    pub async fn echo(&mut self, value: Value) -> Result<Value, CommandError> {
        Ok(self.call(&CommandRequest::Echo(value)).await?.unwrap_or(Value::Null))
    }
}

fn lines(result: Option<Value>) -> Result<Vec<String>, CommandError> {
    match result {
        Some(value) => serde_json::from_value(value).map_err(|e| CommandError::UnexpectedResult(e.to_string())),
        None => Ok(Vec::new()),
    }
}

/// A command client shared by every handler in a device process
///
/// Requests from different handlers queue on the lock, so the connection
/// still carries one request at a time.
#[derive(Clone)]
pub struct SharedCommandClient {
    inner: Arc<Mutex<CommandClient>>,
}

impl SharedCommandClient {
    pub fn new(client: CommandClient) -> Self {
        Self {
            inner: Arc::new(Mutex::new(client)),
        }
    }

    pub async fn connect(addr: impl ToSocketAddrs) -> Result<Self, ProtocolError> {
        Ok(Self::new(CommandClient::connect(addr).await?))
    }

    pub async fn request(&self, request: &CommandRequest) -> Result<CommandReply, CommandError> {
        self.inner.lock().await.request(request).await
    }

    pub async fn evaluate(&self, instruction: &str) -> Result<Vec<String>, CommandError> {
        self.inner.lock().await.evaluate(instruction).await
    }

    pub async fn evaluate_batch(&self, instructions: &[String]) -> Result<Vec<Vec<String>>, CommandError> {
        self.inner.lock().await.evaluate_batch(instructions).await
    }

    pub async fn mark_dirty(&self, kind: Option<&str>) -> Result<(), CommandError> {
        self.inner.lock().await.mark_dirty(kind).await
    }

    pub async fn echo(&self, value: Value) -> Result<Value, CommandError> {
        self.inner.lock().await.echo(value).await
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
