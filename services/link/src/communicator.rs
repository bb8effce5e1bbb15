//! The `Communicator` facade.
//!
//! A communicator is one participant in a conversation. It listens for peers
//! on its own server port and, when a target is configured, also dials the
//! peer's server. Both legs feed the same dispatch coordinator, so a message
//! that arrives twice (once per leg) is handled exactly once.

use crate::config::{DEFAULT_HOST, LinkConfig};
use crate::error::LinkError;
use crate::ws::client::ClientEndpoint;
use crate::ws::dispatch::{DispatchSettings, Dispatcher};
use crate::ws::server::ServerEndpoint;
use parley_core::{ConversationState, MessageFactory, MessageHandler, MessageId};
use serde::Serialize;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// Point-in-time view of a communicator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CommunicatorStats {
    pub name: String,
    pub server_port: u16,
    pub connected_clients: usize,
    pub has_client_connection: bool,
    pub conversation_state: ConversationState,
    pub pending_questions: usize,
    pub cache_size: usize,
}

pub struct Communicator {
    config: LinkConfig,
    dispatcher: Dispatcher,
    server: ServerEndpoint,
    client: ClientEndpoint,
    shutdown: CancellationToken,
}

impl Communicator {
    /// Builds a communicator with default settings. `target_port` of `None`
    /// runs it in server-only mode.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn new(
        name: impl Into<String>,
        server_port: u16,
        target_host: impl Into<String>,
        target_port: Option<u16>,
    ) -> Self {
        let mut config = LinkConfig::new(name, server_port);
        config.target_host = target_host.into();
        config.target_port = target_port;
        Self::with_config(config)
    }

    /// Must be called from within a Tokio runtime.
    pub fn with_config(config: LinkConfig) -> Self {
        let shutdown = CancellationToken::new();
        let dispatcher = Dispatcher::spawn(
            MessageFactory::new(config.name.clone()),
            DispatchSettings {
                max_cache_size: config.max_cache_size,
                answer_timeout: config.answer_timeout,
            },
            shutdown.clone(),
        );
        let server = ServerEndpoint::new(
            config.bind_host.clone(),
            config.server_port,
            dispatcher.clone(),
        );
        let client = ClientEndpoint::new(
            config.target_host.clone(),
            config.target_port,
            dispatcher.clone(),
        );
        Self {
            config,
            dispatcher,
            server,
            client,
            shutdown,
        }
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    pub fn config(&self) -> &LinkConfig {
        &self.config
    }

    /// Registers the application callbacks. Messages dispatched before this
    /// call are acknowledged but otherwise ignored.
    pub fn set_handler(&self, handler: Arc<dyn MessageHandler>) {
        self.dispatcher.set_handler(Some(handler));
    }

    pub fn clear_handler(&self) {
        self.dispatcher.set_handler(None);
    }

    /// Starts the server leg and returns the address it is bound to.
    pub async fn start(&self) -> Result<SocketAddr, LinkError> {
        let addr = self.server.start().await?;
        info!(name = %self.config.name, %addr, "Communicator listening");
        Ok(addr)
    }

    /// Dials the configured peer. Returns `false` if it cannot be reached.
    pub async fn connect_as_client(&self) -> bool {
        self.client.connect().await
    }

    /// Sends a new question to every connected peer.
    ///
    /// Returns `None` without sending anything while a previous question is
    /// still unanswered or an incoming question is being handled.
    pub async fn send_question(&self, content: impl Into<String>) -> Option<MessageId> {
        let question = match self.dispatcher.begin_question(content.into()).await {
            Ok(Some(question)) => question,
            Ok(None) => return None,
            Err(e) => {
                error!(error = %e, "Cannot send question");
                return None;
            }
        };

        let mut delivered = self.server.broadcast(&question);
        if self.client.send(&question) {
            delivered += 1;
        }
        if delivered == 0 {
            warn!(message_id = %question.message_id, "No peer connected; question stays pending");
        } else {
            info!(message_id = %question.message_id, peers = delivered, content = %question.content, "Sent question");
        }
        Some(question.message_id)
    }

    pub fn is_ready_to_send_question(&self) -> bool {
        self.dispatcher.state() == ConversationState::Idle
    }

    pub fn conversation_state(&self) -> ConversationState {
        self.dispatcher.state()
    }

    /// Waits until a new question may be sent.
    pub async fn ready(&self) -> Result<(), LinkError> {
        let mut state = self.dispatcher.subscribe();
        state
            .wait_for(|state| *state == ConversationState::Idle)
            .await
            .map(|_| ())
            .map_err(|_| LinkError::CoordinatorStopped)
    }

    pub fn has_client_connection(&self) -> bool {
        self.client.is_connected()
    }

    pub fn connected_clients(&self) -> usize {
        self.server.connected_clients()
    }

    /// Address of the running server leg, if started.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.server.local_addr()
    }

    /// Closes both legs. The communicator can be started again afterwards.
    pub async fn stop(&self) {
        self.client.stop().await;
        self.server.stop().await;
        info!(name = %self.config.name, "Communicator stopped");
    }

    pub async fn stats(&self) -> Result<CommunicatorStats, LinkError> {
        let snapshot = self.dispatcher.snapshot().await?;
        Ok(CommunicatorStats {
            name: self.config.name.clone(),
            server_port: self
                .local_addr()
                .map_or(self.config.server_port, |addr| addr.port()),
            connected_clients: self.server.connected_clients(),
            has_client_connection: self.client.is_connected(),
            conversation_state: snapshot.state,
            pending_questions: snapshot.pending_questions,
            cache_size: snapshot.cache_size,
        })
    }
}

impl Drop for Communicator {
    fn drop(&mut self) {
        self.client.abort();
        self.server.abort();
        self.shutdown.cancel();
    }
}

/// Builds a "simulation" and a "chatbot" communicator on localhost, each
/// targeting the other's server port.
pub fn communicator_pair(first_port: u16, second_port: u16) -> (Communicator, Communicator) {
    let simulation = Communicator::new("simulation", first_port, DEFAULT_HOST, Some(second_port));
    let chatbot = Communicator::new("chatbot", second_port, DEFAULT_HOST, Some(first_port));
    (simulation, chatbot)
}
