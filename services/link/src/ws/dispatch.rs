//! The dispatch coordinator.
//!
//! One task per communicator exclusively owns the deduplication cache and the
//! conversation state machine. Readers on every connection, and the facade
//! itself, talk to it over a single bounded command channel, so every
//! mutation of shared protocol state is applied in one serial order and a
//! flooding peer is slowed down at its socket.

use super::connection::{ConnectionHandle, ConnectionId};
use crate::error::LinkError;
use futures_util::FutureExt;
use parley_core::{
    AnswerOutcome, Conversation, ConversationState, DedupCache, FrameError, Message,
    MessageFactory, MessageHandler, MessageId, MessageType, dedup::DEFAULT_EVICT_BATCH,
};
use std::collections::HashMap;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::AbortHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Commands that may wait for the coordinator before senders are suspended.
pub const COMMAND_BUFFER: usize = 256;

type HandlerSlot = Arc<RwLock<Option<Arc<dyn MessageHandler>>>>;

/// Tunables for one coordinator.
#[derive(Debug, Clone)]
pub(crate) struct DispatchSettings {
    pub max_cache_size: usize,
    pub answer_timeout: Option<Duration>,
}

/// Protocol-level portion of a communicator's statistics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct ProtocolSnapshot {
    pub state: ConversationState,
    pub pending_questions: usize,
    pub cache_size: usize,
    pub answer_timers: usize,
}

enum Command {
    Inbound {
        message: Message,
        conn: ConnectionHandle,
    },
    /// A frame with an id but a type we do not understand.
    Unknown {
        message_id: MessageId,
        kind: String,
        connection: ConnectionId,
    },
    BeginQuestion {
        content: String,
        reply: oneshot::Sender<Option<Message>>,
    },
    AnswerTimedOut {
        question_id: MessageId,
    },
    Snapshot {
        reply: oneshot::Sender<ProtocolSnapshot>,
    },
}

/// Cloneable front door to the coordinator task.
#[derive(Clone)]
pub(crate) struct Dispatcher {
    commands: mpsc::Sender<Command>,
    state: watch::Receiver<ConversationState>,
    handler: HandlerSlot,
}

impl Dispatcher {
    /// Spawns the coordinator task. It runs until `shutdown` is cancelled.
    pub fn spawn(
        factory: MessageFactory,
        settings: DispatchSettings,
        shutdown: CancellationToken,
    ) -> Self {
        let (commands, rx) = mpsc::channel(COMMAND_BUFFER);
        let (state_tx, state) = watch::channel(ConversationState::Idle);
        let handler: HandlerSlot = Arc::new(RwLock::new(None));
        let coordinator = Coordinator {
            cache: DedupCache::with_capacity(settings.max_cache_size, DEFAULT_EVICT_BATCH),
            conversation: Conversation::new(),
            handler: handler.clone(),
            answer_timeout: settings.answer_timeout,
            timers: HashMap::new(),
            loopback: commands.downgrade(),
            factory,
            state_tx,
        };
        tokio::spawn(coordinator.run(rx, shutdown));
        Self {
            commands,
            state,
            handler,
        }
    }

    /// Decodes one text frame and forwards it, waiting while the coordinator
    /// is saturated. Undecodable frames are logged and dropped.
    pub async fn deliver_frame(&self, frame: &str, conn: &ConnectionHandle) {
        match Message::from_json(frame) {
            Ok(message) => self.deliver(message, conn.clone()).await,
            Err(FrameError::UnknownType { message_id, kind }) => {
                self.submit(Command::Unknown {
                    message_id,
                    kind,
                    connection: conn.id(),
                })
                .await
            }
            Err(e) => {
                warn!(connection = conn.id(), error = %e, "Discarding malformed frame");
            }
        }
    }

    pub async fn deliver(&self, message: Message, conn: ConnectionHandle) {
        self.submit(Command::Inbound { message, conn }).await
    }

    async fn submit(&self, command: Command) {
        if self.commands.send(command).await.is_err() {
            debug!("Coordinator stopped; dropping inbound message");
        }
    }

    /// Installs (or with `None`, removes) the application callbacks. Takes
    /// effect for every message dispatched afterwards.
    pub fn set_handler(&self, handler: Option<Arc<dyn MessageHandler>>) {
        *self.handler.write().unwrap_or_else(PoisonError::into_inner) = handler;
    }

    /// Creates and records a question if the conversation is idle. Returns
    /// `Ok(None)` when it is not this participant's turn.
    pub async fn begin_question(&self, content: String) -> Result<Option<Message>, LinkError> {
        let (reply, rx) = oneshot::channel();
        self.commands
            .send(Command::BeginQuestion { content, reply })
            .await
            .map_err(|_| LinkError::CoordinatorStopped)?;
        rx.await.map_err(|_| LinkError::CoordinatorStopped)
    }

    pub async fn snapshot(&self) -> Result<ProtocolSnapshot, LinkError> {
        let (reply, rx) = oneshot::channel();
        self.commands
            .send(Command::Snapshot { reply })
            .await
            .map_err(|_| LinkError::CoordinatorStopped)?;
        rx.await.map_err(|_| LinkError::CoordinatorStopped)
    }

    /// Latest published conversation state.
    pub fn state(&self) -> ConversationState {
        *self.state.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<ConversationState> {
        self.state.clone()
    }
}

struct Coordinator {
    factory: MessageFactory,
    cache: DedupCache,
    conversation: Conversation,
    handler: HandlerSlot,
    answer_timeout: Option<Duration>,
    /// One timer per pending question, aborted once it is answered.
    timers: HashMap<MessageId, AbortHandle>,
    loopback: mpsc::WeakSender<Command>,
    state_tx: watch::Sender<ConversationState>,
}

impl Coordinator {
    async fn run(mut self, mut rx: mpsc::Receiver<Command>, shutdown: CancellationToken) {
        debug!(name = %self.factory.sender(), "Dispatch coordinator started");
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                command = rx.recv() => match command {
                    Some(command) => self.handle(command),
                    None => break,
                }
            }
        }
        for (_, timer) in self.timers.drain() {
            timer.abort();
        }
        debug!(name = %self.factory.sender(), "Dispatch coordinator stopped");
    }

    /// Publishes the conversation state. Called right after every transition so
    /// observers see it before any handler for the same event runs.
    fn publish_state(&self) {
        let current = self.conversation.state();
        self.state_tx.send_if_modified(|state| {
            if *state == current {
                false
            } else {
                *state = current;
                true
            }
        });
    }

    fn handler(&self) -> Option<Arc<dyn MessageHandler>> {
        self.handler
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn handle(&mut self, command: Command) {
        match command {
            Command::Inbound { message, conn } => self.dispatch(message, conn),
            Command::Unknown {
                message_id,
                kind,
                connection,
            } => {
                if self.cache.seen(&message_id) {
                    debug!(%message_id, connection, "Ignoring duplicate message");
                } else {
                    warn!(%message_id, %kind, connection, "Discarding message with unknown type");
                }
            }
            Command::BeginQuestion { content, reply } => {
                let question = self.begin_question(content);
                let _ = reply.send(question);
            }
            Command::AnswerTimedOut { question_id } => self.expire(question_id),
            Command::Snapshot { reply } => {
                let _ = reply.send(ProtocolSnapshot {
                    state: self.conversation.state(),
                    pending_questions: self.conversation.pending_len(),
                    cache_size: self.cache.len(),
                    answer_timers: self.timers.len(),
                });
            }
        }
    }

    fn begin_question(&mut self, content: String) -> Option<Message> {
        let question = self.factory.question(content);
        if let Err(e) = self.conversation.begin_question(question.clone()) {
            warn!(error = %e, "Cannot send another question yet");
            return None;
        }
        self.publish_state();

        if let Some(timeout) = self.answer_timeout {
            let loopback = self.loopback.clone();
            let question_id = question.message_id.clone();
            let timer = tokio::spawn(async move {
                tokio::time::sleep(timeout).await;
                if let Some(loopback) = loopback.upgrade() {
                    let _ = loopback.send(Command::AnswerTimedOut { question_id }).await;
                }
            });
            self.timers
                .insert(question.message_id.clone(), timer.abort_handle());
        }
        Some(question)
    }

    fn dispatch(&mut self, message: Message, conn: ConnectionHandle) {
        if self.cache.seen(&message.message_id) {
            debug!(message_id = %message.message_id, connection = conn.id(), "Ignoring duplicate message");
            return;
        }

        match message.kind {
            MessageType::Question => self.on_question(message, conn),
            MessageType::Answer => self.on_answer(message, conn),
            MessageType::Ack => self.on_ack(message),
        }
    }

    fn on_question(&mut self, question: Message, conn: ConnectionHandle) {
        info!(sender = %question.sender, content = %question.content, "Received question");
        self.acknowledge(&question, &conn);

        let Some(handler) = self.handler() else {
            return;
        };
        let factory = self.factory.clone();
        tokio::spawn(async move {
            let reply = guarded(&question, handler.on_question(&question)).await;
            let Some(Some(text)) = reply else {
                return;
            };
            if text.is_empty() {
                debug!(message_id = %question.message_id, "Handler returned an empty answer");
                return;
            }
            let answer = factory.answer(text, &question);
            match conn.send(&answer) {
                Ok(()) => info!(in_reply_to = %question.message_id, "Sent answer"),
                Err(e) => warn!(error = %e, "Could not send answer"),
            }
        });
    }

    fn on_answer(&mut self, answer: Message, conn: ConnectionHandle) {
        info!(sender = %answer.sender, content = %answer.content, "Received answer");
        self.acknowledge(&answer, &conn);

        match self.conversation.receive_answer(answer.in_reply_to.as_ref()) {
            AnswerOutcome::Matched => {
                if let Some(timer) = answer
                    .in_reply_to
                    .as_ref()
                    .and_then(|id| self.timers.remove(id))
                {
                    timer.abort();
                }
                debug!(message_id = %answer.message_id, "Answer closed pending question");
            }
            AnswerOutcome::Unmatched => {
                debug!(message_id = %answer.message_id, "Answer does not match a pending question")
            }
        }
        self.publish_state();

        if let Some(handler) = self.handler() {
            tokio::spawn(async move {
                guarded(&answer, handler.on_answer(&answer)).await;
            });
        }
    }

    fn on_ack(&mut self, ack: Message) {
        debug!(sender = %ack.sender, content = %ack.content, "Received ack");
        if let Some(handler) = self.handler() {
            tokio::spawn(async move {
                guarded(&ack, handler.on_ack(&ack)).await;
            });
        }
    }

    fn expire(&mut self, question_id: MessageId) {
        self.timers.remove(&question_id);
        let Some(question) = self.conversation.expire(&question_id) else {
            return;
        };
        self.publish_state();
        warn!(message_id = %question_id, "Question went unanswered; giving up on it");
        if let Some(handler) = self.handler() {
            tokio::spawn(async move {
                guarded(&question, handler.on_timeout(&question)).await;
            });
        }
    }

    fn acknowledge(&self, received: &Message, conn: &ConnectionHandle) {
        let ack = self.factory.ack(received);
        if let Err(e) = conn.send(&ack) {
            warn!(message_id = %received.message_id, error = %e, "Could not send ack");
        }
    }
}

/// Runs one handler callback, containing both errors and panics.
async fn guarded<T, F>(message: &Message, callback: F) -> Option<T>
where
    F: Future<Output = anyhow::Result<T>>,
{
    match AssertUnwindSafe(callback).catch_unwind().await {
        Ok(Ok(value)) => Some(value),
        Ok(Err(e)) => {
            error!(message_id = %message.message_id, kind = %message.kind, error = ?e, "Message handler failed");
            None
        }
        Err(_) => {
            error!(message_id = %message.message_id, kind = %message.kind, "Message handler panicked");
            None
        }
    }
}
