//! Strict request/reply channel to the running agent.
//!
//! The agent's REP socket alternates request and reply with no correlation id,
//! so a second request sent before the first reply arrives would pair
//! replies with the wrong callers forever after. [`CommandTransport`] puts
//! a FIFO mutex in front of the channel: concurrent callers queue, and only
//! the holder of the lock has a request outstanding.
//!
//! There is no per-call timeout. A hung call is released by [`close`],
//! which the owner triggers when it sees the agent process go away.
//!
//! [`close`]: CommandTransport::close

use crate::message::{decode_reply, encode_message};
use async_trait::async_trait;
use meshlink_types::{Command, MeshLinkError, MeshLinkResult, Reply};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{watch, Mutex};
use tracing::{debug, warn};
use zeromq::{ReqSocket, Socket, SocketRecv, SocketSend, ZmqError};

/// Errors from the wire protocol layer.
#[derive(Debug, Error)]
pub enum WireError {
    #[error("ZeroMQ error: {0}")]
    Zmq(#[from] ZmqError),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("Expected a single-frame message, got {0} frames")]
    Frames(usize),
}

impl WireError {
    /// The exchange completed but its content was unusable. The socket is
    /// still in step and can carry the next request.
    pub fn is_malformed(&self) -> bool {
        matches!(self, WireError::Json(_) | WireError::Frames(_))
    }
}

/// One request/reply exchange with the agent.
///
/// `exchange` takes `&mut self`: an implementation never sees two requests
/// at once. [`CommandTransport`] extends that guarantee to shared callers.
#[async_trait]
pub trait AgentChannel: Send {
    /// Send one command and wait for its reply.
    async fn exchange(&mut self, command: &Command) -> Result<Reply, WireError>;

    /// Release the underlying connection.
    async fn shutdown(&mut self) -> Result<(), WireError> {
        Ok(())
    }
}

/// ZeroMQ REQ socket connected to the agent's REP socket.
pub struct ZmqChannel {
    socket: ReqSocket,
}

impl ZmqChannel {
    /// Connect to the agent at `endpoint` (`tcp://host:port`).
    pub async fn connect(endpoint: &str) -> Result<Self, WireError> {
        let mut socket = ReqSocket::new();
        socket.connect(endpoint).await?;
        debug!(endpoint, "Connected to agent");
        Ok(Self { socket })
    }
}

#[async_trait]
impl AgentChannel for ZmqChannel {
    async fn exchange(&mut self, command: &Command) -> Result<Reply, WireError> {
        self.socket.send(encode_message(command)?).await?;
        let message = self.socket.recv().await?;
        decode_reply(message)
    }
}

/// Single-flight command channel to the agent.
pub struct CommandTransport {
    /// `None` once the channel broke or was closed.
    channel: Mutex<Option<Box<dyn AgentChannel>>>,
    shutdown_tx: watch::Sender<bool>,
    broken: AtomicBool,
}

impl CommandTransport {
    /// Wrap an already connected channel.
    pub fn new(channel: impl AgentChannel + 'static) -> Self {
        Self::from_boxed(Box::new(channel))
    }

    pub fn from_boxed(channel: Box<dyn AgentChannel>) -> Self {
        let (shutdown_tx, _) = watch::channel(false);
        Self {
            channel: Mutex::new(Some(channel)),
            shutdown_tx,
            broken: AtomicBool::new(false),
        }
    }

    /// Connect to the agent's REP socket at `endpoint`.
    ///
    /// A ZeroMQ connect waits for the peer to appear, so the attempt is
    /// bounded by `wait`.
    pub async fn connect(endpoint: &str, wait: Duration) -> MeshLinkResult<Self> {
        match tokio::time::timeout(wait, ZmqChannel::connect(endpoint)).await {
            Ok(Ok(channel)) => Ok(Self::new(channel)),
            Ok(Err(e)) => Err(MeshLinkError::transport_closed(
                "connect",
                format!("{endpoint}: {e}"),
            )),
            Err(_) => Err(MeshLinkError::transport_closed(
                "connect",
                format!("{endpoint}: no agent within {}ms", wait.as_millis()),
            )),
        }
    }

    /// Whether the transport can still carry commands.
    pub fn is_open(&self) -> bool {
        !*self.shutdown_tx.borrow() && !self.broken.load(Ordering::SeqCst)
    }

    /// Send one command and wait for its reply.
    ///
    /// Callers are served in FIFO order. A reply with a non-empty `error`
    /// becomes [`MeshLinkError::RemoteError`]; any other reply is returned
    /// exactly as received.
    pub async fn send(&self, command: Command) -> MeshLinkResult<Reply> {
        let name = command.name().to_string();
        let mut shutdown_rx = self.shutdown_tx.subscribe();

        let mut slot = tokio::select! {
            guard = self.channel.lock() => guard,
            _ = wait_closed(&mut shutdown_rx) => {
                return Err(MeshLinkError::transport_closed(name, "transport closed"));
            }
        };

        if *shutdown_rx.borrow() {
            return Err(MeshLinkError::transport_closed(name, "transport closed"));
        }
        let Some(channel) = slot.as_mut() else {
            return Err(MeshLinkError::transport_closed(name, "channel is broken"));
        };

        debug!(command = %name, "Sending command to agent");
        let outcome = tokio::select! {
            result = channel.exchange(&command) => Some(result),
            _ = wait_closed(&mut shutdown_rx) => None,
        };

        match outcome {
            None => {
                // The request may still be unanswered; the channel can't be reused.
                *slot = None;
                Err(MeshLinkError::transport_closed(
                    name,
                    "transport closed while awaiting reply",
                ))
            }
            Some(Ok(reply)) => reply.into_result(),
            Some(Err(e)) if e.is_malformed() => Err(MeshLinkError::Protocol(format!(
                "invalid reply to '{name}': {e}"
            ))),
            Some(Err(e)) => {
                warn!(command = %name, error = %e, "Agent channel broke");
                *slot = None;
                self.broken.store(true, Ordering::SeqCst);
                Err(MeshLinkError::transport_closed(name, e.to_string()))
            }
        }
    }

    /// Tear the transport down. Pending and queued callers get
    /// `TransportClosed`. Idempotent.
    pub async fn close(&self) {
        self.shutdown_tx.send_replace(true);
        let mut slot = self.channel.lock().await;
        if let Some(mut channel) = slot.take() {
            if let Err(e) = channel.shutdown().await {
                debug!(error = %e, "Agent channel shutdown failed");
            }
        }
    }
}

async fn wait_closed(rx: &mut watch::Receiver<bool>) {
    let _ = rx.wait_for(|closed| *closed).await;
}
