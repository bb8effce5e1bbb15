use crate::ws::connection::ConnectionId;

/// Failures surfaced by the network side of a communicator.
#[derive(Debug, thiserror::Error)]
pub enum LinkError {
    #[error("failed to bind WebSocket server on {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to connect to {url}: {reason}")]
    Connect { url: String, reason: String },
    #[error("no target port configured for the client connection")]
    NoTarget,
    #[error("connection {0} is closed")]
    ConnectionClosed(ConnectionId),
    #[error("outbound queue for connection {0} is full")]
    QueueFull(ConnectionId),
    #[error("dispatch coordinator is no longer running")]
    CoordinatorStopped,
    #[error("failed to encode message: {0}")]
    Encode(#[from] serde_json::Error),
}
