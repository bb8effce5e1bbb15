//! Per-connection plumbing shared by the server and client endpoints.
//!
//! Each live WebSocket is split into a reader task and a writer task. The
//! writer owns the sink and drains a bounded queue of encoded frames, so
//! anything holding a `ConnectionHandle` can send without touching the
//! socket. A peer that stops reading fills its queue and further sends to it
//! fail with `LinkError::QueueFull` instead of buffering without limit.

use super::dispatch::Dispatcher;
use crate::error::LinkError;
use futures_util::{Sink, SinkExt, Stream, StreamExt};
use parley_core::Message;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

pub type ConnectionId = u64;

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

/// Which leg of a communicator a connection belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionRole {
    /// Accepted by the server endpoint.
    Inbound,
    /// Dialled by the client endpoint.
    Outbound,
}

impl fmt::Display for ConnectionRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionRole::Inbound => write!(f, "inbound"),
            ConnectionRole::Outbound => write!(f, "outbound"),
        }
    }
}

/// Frames a connection may have queued for its writer before further sends
/// are refused.
pub const OUTBOUND_BUFFER: usize = 128;

/// Cloneable sending half of one live connection.
#[derive(Debug, Clone)]
pub struct ConnectionHandle {
    id: ConnectionId,
    role: ConnectionRole,
    peer: String,
    outbound: mpsc::Sender<String>,
    closing: CancellationToken,
}

impl ConnectionHandle {
    /// Creates the handle and the writer's end of its queue. Cancelling
    /// `closing` (or calling `close`) stops both the reader and the writer.
    pub(crate) fn new(
        role: ConnectionRole,
        peer: impl Into<String>,
        closing: CancellationToken,
    ) -> (Self, mpsc::Receiver<String>) {
        let (outbound, rx) = mpsc::channel(OUTBOUND_BUFFER);
        let handle = Self {
            id: NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed),
            role,
            peer: peer.into(),
            outbound,
            closing,
        };
        (handle, rx)
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn role(&self) -> ConnectionRole {
        self.role
    }

    pub fn peer(&self) -> &str {
        &self.peer
    }

    /// Queues `message` for the writer without waiting. Fails once the
    /// connection has closed, or when the peer is not draining its queue.
    pub fn send(&self, message: &Message) -> Result<(), LinkError> {
        if self.closing.is_cancelled() {
            return Err(LinkError::ConnectionClosed(self.id));
        }
        let frame = message.to_json()?;
        self.outbound.try_send(frame).map_err(|e| match e {
            TrySendError::Full(_) => LinkError::QueueFull(self.id),
            TrySendError::Closed(_) => LinkError::ConnectionClosed(self.id),
        })?;
        debug!(
            connection = self.id,
            kind = %message.kind,
            message_id = %message.message_id,
            "Queued message"
        );
        Ok(())
    }

    /// Stops the reader and asks the writer to send a close frame.
    pub(crate) fn close(&self) {
        self.closing.cancel();
    }

    pub(crate) fn closing(&self) -> &CancellationToken {
        &self.closing
    }

    pub fn is_closed(&self) -> bool {
        self.closing.is_cancelled() || self.outbound.is_closed()
    }
}

/// What a reader makes of one raw WebSocket frame.
pub(crate) enum Incoming {
    Text(String),
    Close,
    Binary,
    Control,
}

/// Receives frames until the peer closes, the stream errors, or the
/// connection is closed. Every text frame is handed to the dispatcher; while
/// the dispatcher is saturated the socket is not read.
pub(crate) async fn read_loop<St, M, E>(
    mut stream: St,
    conn: &ConnectionHandle,
    dispatcher: &Dispatcher,
    classify: fn(M) -> Incoming,
) where
    St: Stream<Item = Result<M, E>> + Unpin,
    E: fmt::Display,
{
    let cancel = conn.closing().clone();
    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                debug!(connection = conn.id(), "Reader cancelled");
                break;
            }
            next = stream.next() => match next {
                Some(Ok(frame)) => match classify(frame) {
                    Incoming::Text(text) => dispatcher.deliver_frame(&text, conn).await,
                    Incoming::Close => {
                        info!(connection = conn.id(), "Peer sent close frame");
                        break;
                    }
                    Incoming::Binary => {
                        warn!(connection = conn.id(), "Ignoring binary frame");
                    }
                    Incoming::Control => {}
                },
                Some(Err(e)) => {
                    warn!(connection = conn.id(), error = %e, "Error receiving from peer");
                    break;
                }
                None => break,
            }
        }
    }
}

/// Drains queued frames into `sink` until the connection closes, then sends
/// a close frame.
pub(crate) async fn write_loop<S, M>(
    mut sink: S,
    mut outbound: mpsc::Receiver<String>,
    closing: CancellationToken,
    text_frame: fn(String) -> M,
    close_frame: fn() -> M,
) where
    S: Sink<M> + Unpin,
    S::Error: fmt::Display,
{
    loop {
        tokio::select! {
            _ = closing.cancelled() => break,
            next = outbound.recv() => match next {
                Some(text) => {
                    if let Err(e) = sink.send(text_frame(text)).await {
                        warn!(error = %e, "Failed to write frame; dropping connection writer");
                        closing.cancel();
                        return;
                    }
                }
                None => break,
            }
        }
    }
    outbound.close();
    closing.cancel();
    let _ = sink.send(close_frame()).await;
    let _ = sink.close().await;
}
