//! # Client Transports
//!
//! The seam between the relay and whatever duplex channel carries messages to
//! a client. Pushes must not block on a slow client: a transport that cannot
//! accept a message right now reports `TransportError::Full` and the relay
//! buffers the event for retry instead.

use crate::messaging::errors::TransportError;
use crate::messaging::message::ServerMessage;
use async_trait::async_trait;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tracing::debug;

#[async_trait]
pub trait ClientTransport: Send + Sync {
    /// Push one message to the client
    async fn send(&self, message: &ServerMessage) -> Result<(), TransportError>;

    /// Whether the underlying channel is still usable
    fn is_open(&self) -> bool {
        true
    }
}

/// Transport over a bounded tokio channel; the receiving half is drained by
/// the connection's socket writer (or directly by tests).
#[derive(Debug, Clone)]
pub struct ChannelTransport {
    sender: mpsc::Sender<ServerMessage>,
}

impl ChannelTransport {
    pub fn new(capacity: usize) -> (Self, mpsc::Receiver<ServerMessage>) {
        let (sender, receiver) = mpsc::channel(capacity);
        (Self { sender }, receiver)
    }

    pub fn from_sender(sender: mpsc::Sender<ServerMessage>) -> Self {
        Self { sender }
    }
}

#[async_trait]
impl ClientTransport for ChannelTransport {
    async fn send(&self, message: &ServerMessage) -> Result<(), TransportError> {
        self.sender
            .try_send(message.clone())
            .map_err(|e| match e {
                mpsc::error::TrySendError::Full(_) => TransportError::Full,
                mpsc::error::TrySendError::Closed(_) => TransportError::Closed,
            })
    }

    fn is_open(&self) -> bool {
        !self.sender.is_closed()
    }
}

/// Newline-delimited JSON over any async writer (TCP stream, unix socket, ...).
///
/// Lines go through a bounded queue drained by a spawned writer task, so a
/// peer that stops reading fills the queue and `send` reports `Full` instead
/// of waiting on the socket.
#[derive(Debug, Clone)]
pub struct JsonLinesTransport {
    lines: mpsc::Sender<Vec<u8>>,
}

impl JsonLinesTransport {
    /// Spawn the writer task; must be called inside a tokio runtime
    pub fn new<W>(writer: W, capacity: usize) -> Self
    where
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let (lines, receiver) = mpsc::channel(capacity.max(1));
        tokio::spawn(write_lines(writer, receiver));
        Self { lines }
    }
}

async fn write_lines<W>(mut writer: W, mut lines: mpsc::Receiver<Vec<u8>>)
where
    W: AsyncWrite + Unpin,
{
    while let Some(line) = lines.recv().await {
        let written = match writer.write_all(&line).await {
            Ok(()) => writer.flush().await,
            Err(e) => Err(e),
        };
        if let Err(e) = written {
            debug!(error = %e, "JSON lines writer stopped");
            return;
        }
    }
    let _ = writer.shutdown().await;
}

#[async_trait]
impl ClientTransport for JsonLinesTransport {
    async fn send(&self, message: &ServerMessage) -> Result<(), TransportError> {
        let mut line =
            serde_json::to_vec(message).map_err(|e| TransportError::Io(e.to_string()))?;
        line.push(b'\n');

        self.lines.try_send(line).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => TransportError::Full,
            mpsc::error::TrySendError::Closed(_) => TransportError::Closed,
        })
    }

    fn is_open(&self) -> bool {
        !self.lines.is_closed()
    }
}
