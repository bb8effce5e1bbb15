//! Turn-Taking State Machine
//!
//! A participant may have at most one outstanding, unanswered question. This
//! module tracks that rule together with the questions still awaiting a reply.

use crate::message::{Message, MessageId};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

/// Where a participant currently stands in the conversation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConversationState {
    /// Free to originate a new question.
    #[default]
    Idle,
    /// A question was sent and its answer has not arrived yet.
    WaitingForAnswer,
    /// Reserved for callers that track answer composition themselves.
    /// `Conversation` never enters it: answering a peer does not take the
    /// turn away from this participant.
    Processing,
}

impl fmt::Display for ConversationState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConversationState::Idle => write!(f, "idle"),
            ConversationState::WaitingForAnswer => write!(f, "waiting_for_answer"),
            ConversationState::Processing => write!(f, "processing"),
        }
    }
}

/// Returned when a question is attempted outside the `Idle` state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("not ready to send a question (state: {0})")]
pub struct NotReady(pub ConversationState);

/// Whether an answer closed one of our pending questions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AnswerOutcome {
    Matched,
    Unmatched,
}

#[derive(Debug, Default)]
pub struct Conversation {
    state: ConversationState,
    pending: HashMap<MessageId, Message>,
}

impl Conversation {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self) -> ConversationState {
        self.state
    }

    pub fn is_ready(&self) -> bool {
        self.state == ConversationState::Idle
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_pending(&self, id: &MessageId) -> bool {
        self.pending.contains_key(id)
    }

    /// Records an outgoing question and moves to `WaitingForAnswer`.
    pub fn begin_question(&mut self, question: Message) -> Result<(), NotReady> {
        if !self.is_ready() {
            return Err(NotReady(self.state));
        }
        self.pending.insert(question.message_id.clone(), question);
        self.state = ConversationState::WaitingForAnswer;
        Ok(())
    }

    /// Applies an inbound answer. Only an answer naming a pending question
    /// changes state.
    pub fn receive_answer(&mut self, in_reply_to: Option<&MessageId>) -> AnswerOutcome {
        let matched = in_reply_to.and_then(|id| self.pending.remove(id));
        match matched {
            Some(_) => {
                if self.pending.is_empty() {
                    self.state = ConversationState::Idle;
                }
                AnswerOutcome::Matched
            }
            None => AnswerOutcome::Unmatched,
        }
    }

    /// Gives up on a pending question, returning it if it was still pending.
    pub fn expire(&mut self, question_id: &MessageId) -> Option<Message> {
        let question = self.pending.remove(question_id)?;
        if self.pending.is_empty() && self.state == ConversationState::WaitingForAnswer {
            self.state = ConversationState::Idle;
        }
        Some(question)
    }
}
