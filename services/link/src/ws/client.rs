//! Maintains the single outbound connection to the configured peer.

use super::connection::{ConnectionHandle, ConnectionRole, Incoming, read_loop, write_loop};
use super::dispatch::Dispatcher;
use crate::error::LinkError;
use futures_util::StreamExt;
use parley_core::Message;
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;
use tokio_tungstenite::{connect_async, tungstenite::protocol::Message as WsMessage};
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, info, info_span, warn};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

pub struct ClientEndpoint {
    target_host: String,
    target_port: Option<u16>,
    dispatcher: Dispatcher,
    connection: Arc<RwLock<Option<ConnectionHandle>>>,
}

impl ClientEndpoint {
    pub(crate) fn new(target_host: String, target_port: Option<u16>, dispatcher: Dispatcher) -> Self {
        Self {
            target_host,
            target_port,
            dispatcher,
            connection: Arc::new(RwLock::new(None)),
        }
    }

    pub fn url(&self) -> Option<String> {
        self.target_port
            .map(|port| format!("ws://{}:{}/", self.target_host, port))
    }

    /// Dials the peer. Returns `false` when no target is configured or the
    /// peer cannot be reached; both are expected while the peer is offline.
    pub async fn connect(&self) -> bool {
        match self.try_connect().await {
            Ok(url) => {
                info!(%url, "Connected as client");
                true
            }
            Err(e) => {
                warn!(error = %e, "Client connection not established");
                false
            }
        }
    }

    async fn try_connect(&self) -> Result<String, LinkError> {
        self.stop().await;
        let url = self.url().ok_or(LinkError::NoTarget)?;

        let (socket, _) = tokio::time::timeout(CONNECT_TIMEOUT, connect_async(url.as_str()))
            .await
            .map_err(|_| LinkError::Connect {
                url: url.clone(),
                reason: "timed out".to_string(),
            })?
            .map_err(|e| LinkError::Connect {
                url: url.clone(),
                reason: e.to_string(),
            })?;

        let (sink, stream) = socket.split();
        let (conn, outbound) =
            ConnectionHandle::new(ConnectionRole::Outbound, url.clone(), CancellationToken::new());

        *self.connection.write().unwrap_or_else(PoisonError::into_inner) = Some(conn.clone());

        tokio::spawn(write_loop(
            sink,
            outbound,
            conn.closing().clone(),
            |text| WsMessage::Text(text.into()),
            || WsMessage::Close(None),
        ));

        let slot = self.connection.clone();
        let dispatcher = self.dispatcher.clone();
        let span = info_span!("outbound", connection = conn.id(), url = %url);
        tokio::spawn(
            async move {
                read_loop(stream, &conn, &dispatcher, classify).await;
                conn.close();
                let mut current = slot.write().unwrap_or_else(PoisonError::into_inner);
                if current.as_ref().map(ConnectionHandle::id) == Some(conn.id()) {
                    *current = None;
                }
                drop(current);
                info!("Client connection closed");
            }
            .instrument(span),
        );

        Ok(url)
    }

    /// Sends `message` over the outbound connection, if there is one.
    pub fn send(&self, message: &Message) -> bool {
        let connection = self
            .connection
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        match connection {
            Some(conn) => match conn.send(message) {
                Ok(()) => true,
                Err(e) => {
                    warn!(error = %e, "Failed to send via client connection");
                    false
                }
            },
            None => {
                debug!("No client connection available");
                false
            }
        }
    }

    pub fn is_connected(&self) -> bool {
        self.connection
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .is_some_and(|conn| !conn.is_closed())
    }

    /// Closes the outbound connection if open.
    pub async fn stop(&self) {
        self.abort();
        tokio::task::yield_now().await;
    }

    pub(crate) fn abort(&self) {
        let connection = self
            .connection
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(conn) = connection {
            conn.close();
            info!(connection = conn.id(), "Client disconnected");
        }
    }
}

fn classify(frame: WsMessage) -> Incoming {
    match frame {
        WsMessage::Text(text) => Incoming::Text(text.as_str().to_owned()),
        WsMessage::Binary(_) => Incoming::Binary,
        WsMessage::Close(_) => Incoming::Close,
        WsMessage::Ping(_) | WsMessage::Pong(_) | WsMessage::Frame(_) => Incoming::Control,
    }
}
