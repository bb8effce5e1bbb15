//! Accepts inbound WebSocket connections from peers.

use super::connection::{
    ConnectionHandle, ConnectionId, ConnectionRole, Incoming, read_loop, write_loop,
};
use super::dispatch::Dispatcher;
use crate::error::LinkError;
use axum::{
    Router,
    extract::{
        ConnectInfo, State,
        ws::{Message as WsMessage, WebSocket, WebSocketUpgrade},
    },
    response::Response,
    routing::get,
};
use futures_util::StreamExt;
use parley_core::Message;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::Duration;
use tokio::{net::TcpListener, task::JoinHandle};
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, error, info, info_span, warn};

/// How long `stop` waits for the listener task to wind down.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(2);

type ConnectionMap = Arc<RwLock<HashMap<ConnectionId, ConnectionHandle>>>;

/// State shared with every upgraded connection.
#[derive(Clone)]
struct ServerState {
    dispatcher: Dispatcher,
    connections: ConnectionMap,
    cancel: CancellationToken,
}

struct RunningServer {
    local_addr: SocketAddr,
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

pub struct ServerEndpoint {
    bind_host: String,
    port: u16,
    dispatcher: Dispatcher,
    connections: ConnectionMap,
    running: Mutex<Option<RunningServer>>,
}

impl ServerEndpoint {
    pub(crate) fn new(bind_host: String, port: u16, dispatcher: Dispatcher) -> Self {
        Self {
            bind_host,
            port,
            dispatcher,
            connections: Arc::new(RwLock::new(HashMap::new())),
            running: Mutex::new(None),
        }
    }

    /// Binds the listener and starts accepting peers. A server that is already
    /// running is stopped first.
    pub async fn start(&self) -> Result<SocketAddr, LinkError> {
        self.stop().await;

        let addr = format!("{}:{}", self.bind_host, self.port);
        let listener = TcpListener::bind(addr.as_str())
            .await
            .map_err(|source| LinkError::Bind {
                addr: addr.clone(),
                source,
            })?;
        let local_addr = listener
            .local_addr()
            .map_err(|source| LinkError::Bind { addr, source })?;

        let cancel = CancellationToken::new();
        let state = ServerState {
            dispatcher: self.dispatcher.clone(),
            connections: self.connections.clone(),
            cancel: cancel.clone(),
        };
        let app = Router::new().route("/", get(ws_upgrade)).with_state(state);

        let shutdown = cancel.clone();
        let task = tokio::spawn(
            async move {
                let serve = axum::serve(
                    listener,
                    app.into_make_service_with_connect_info::<SocketAddr>(),
                )
                .with_graceful_shutdown(async move { shutdown.cancelled().await });
                if let Err(e) = serve.await {
                    error!(error = %e, "WebSocket server terminated with error");
                }
            }
            .instrument(info_span!("server", %local_addr)),
        );

        info!(%local_addr, "WebSocket server started");
        *self.running.lock().unwrap_or_else(PoisonError::into_inner) = Some(RunningServer {
            local_addr,
            cancel,
            task,
        });
        Ok(local_addr)
    }

    /// Closes the listener and every live connection.
    pub async fn stop(&self) {
        let running = self
            .running
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        let Some(running) = running else {
            return;
        };

        running.cancel.cancel();
        self.close_all();
        if tokio::time::timeout(SHUTDOWN_GRACE, running.task)
            .await
            .is_err()
        {
            warn!(local_addr = %running.local_addr, "Server did not shut down in time");
        }
        info!(local_addr = %running.local_addr, "WebSocket server stopped");
    }

    /// Cancels the server without waiting for it.
    pub(crate) fn abort(&self) {
        if let Some(running) = self
            .running
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            running.cancel.cancel();
        }
        self.close_all();
    }

    fn close_all(&self) {
        let drained: Vec<ConnectionHandle> = self
            .connections
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .drain()
            .map(|(_, conn)| conn)
            .collect();
        for conn in drained {
            conn.close();
        }
    }

    /// Sends `message` to every live inbound connection and returns how many
    /// accepted it. Connections that turn out to be closed are forgotten; a
    /// peer with a full queue misses this frame but stays connected.
    pub fn broadcast(&self, message: &Message) -> usize {
        let mut delivered = 0;
        let mut dead = Vec::new();
        {
            let connections = self
                .connections
                .read()
                .unwrap_or_else(PoisonError::into_inner);
            for (id, conn) in connections.iter() {
                match conn.send(message) {
                    Ok(()) => delivered += 1,
                    Err(LinkError::QueueFull(_)) => {
                        warn!(connection = id, "Peer is not keeping up; dropping broadcast frame");
                    }
                    Err(e) => {
                        warn!(connection = id, error = %e, "Failed to broadcast to peer");
                        dead.push(*id);
                    }
                }
            }
        }
        if !dead.is_empty() {
            let mut connections = self
                .connections
                .write()
                .unwrap_or_else(PoisonError::into_inner);
            for id in dead {
                connections.remove(&id);
            }
        }
        delivered
    }

    pub fn connected_clients(&self) -> usize {
        self.connections
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.running
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .map(|running| running.local_addr)
    }

    pub fn is_running(&self) -> bool {
        self.local_addr().is_some()
    }
}

async fn ws_upgrade(
    ws: WebSocketUpgrade,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    State(state): State<ServerState>,
) -> Response {
    ws.on_upgrade(move |socket| serve_connection(socket, peer, state))
}

/// Runs one accepted connection until the peer leaves or the server stops.
async fn serve_connection(socket: WebSocket, peer: SocketAddr, state: ServerState) {
    let (conn, outbound) = ConnectionHandle::new(
        ConnectionRole::Inbound,
        peer.to_string(),
        state.cancel.child_token(),
    );
    let span = info_span!("inbound", connection = conn.id(), %peer);

    async move {
        let (sink, stream) = socket.split();
        state
            .connections
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(conn.id(), conn.clone());
        info!("Peer connected");

        let writer = tokio::spawn(write_loop(
            sink,
            outbound,
            conn.closing().clone(),
            |text| WsMessage::Text(text.into()),
            || WsMessage::Close(None),
        ));
        read_loop(stream, &conn, &state.dispatcher, classify).await;

        conn.close();
        state
            .connections
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&conn.id());
        let _ = writer.await;
        info!("Peer disconnected");
    }
    .instrument(span)
    .await
}

fn classify(frame: WsMessage) -> Incoming {
    match frame {
        WsMessage::Text(text) => Incoming::Text(text.as_str().to_owned()),
        WsMessage::Binary(_) => Incoming::Binary,
        WsMessage::Close(_) => Incoming::Close,
        WsMessage::Ping(_) | WsMessage::Pong(_) => Incoming::Control,
    }
}
