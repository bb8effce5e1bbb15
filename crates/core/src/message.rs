//! Wire Messages
//!
//! Every frame exchanged between two participants is a single JSON object
//! describing one `Message`. This module owns the message value type, its
//! identifier, the closed set of message kinds, and the factory that stamps
//! fresh messages on behalf of a named participant.

use chrono::{SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::hash::{Hash, Hasher};
use std::str::FromStr;
use uuid::Uuid;

/// Errors raised while decoding an inbound text frame.
#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    #[error("frame is not a valid message object: {0}")]
    Malformed(#[from] serde_json::Error),
    #[error("frame has no message_id")]
    MissingId,
    #[error("message {message_id} has unknown type '{kind}'")]
    UnknownType { message_id: MessageId, kind: String },
}

/// Opaque, globally unique message identifier.
///
/// Locally generated ids are UUID v4 strings, but any non-empty string sent by
/// a peer is accepted.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MessageId(String);

impl MessageId {
    /// Generates a fresh random identifier.
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<String> for MessageId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl From<&str> for MessageId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

/// The closed set of message kinds understood by the protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageType {
    Question,
    Answer,
    Ack,
}

impl MessageType {
    pub fn as_str(self) -> &'static str {
        match self {
            MessageType::Question => "question",
            MessageType::Answer => "answer",
            MessageType::Ack => "ack",
        }
    }
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MessageType {
    type Err = String;

    /// Parses a kind case-insensitively, so `"Question"` and `"question"` agree.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "question" => Ok(MessageType::Question),
            "answer" => Ok(MessageType::Answer),
            "ack" => Ok(MessageType::Ack),
            _ => Err(s.to_string()),
        }
    }
}

/// One immutable protocol unit.
///
/// Equality and hashing consider only `message_id`: two values carrying the
/// same id are the same logical message regardless of their other fields.
#[derive(Debug, Clone, Serialize)]
pub struct Message {
    pub message_id: MessageId,
    pub sender: String,
    #[serde(rename = "type")]
    pub kind: MessageType,
    pub content: String,
    pub in_reply_to: Option<MessageId>,
    pub timestamp: String,
}

impl PartialEq for Message {
    fn eq(&self, other: &Self) -> bool {
        self.message_id == other.message_id
    }
}

impl Eq for Message {}

impl Hash for Message {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.message_id.hash(state);
    }
}

/// Lenient shape used while decoding; validation happens in `Message::from_json`.
#[derive(Deserialize)]
struct RawMessage {
    message_id: Option<String>,
    #[serde(default)]
    sender: String,
    #[serde(rename = "type")]
    kind: Option<String>,
    #[serde(default)]
    content: String,
    in_reply_to: Option<String>,
    #[serde(default)]
    timestamp: String,
}

impl Message {
    /// Decodes one text frame.
    ///
    /// Missing `sender`, `content` or `timestamp` fields decode as empty
    /// strings; a missing or empty `message_id` and an unknown `type` are
    /// rejected.
    pub fn from_json(frame: &str) -> Result<Self, FrameError> {
        let raw: RawMessage = serde_json::from_str(frame)?;
        let message_id = match raw.message_id {
            Some(id) if !id.is_empty() => MessageId::from(id),
            _ => return Err(FrameError::MissingId),
        };
        let kind_text = raw.kind.unwrap_or_default();
        let kind = kind_text
            .parse::<MessageType>()
            .map_err(|kind| FrameError::UnknownType {
                message_id: message_id.clone(),
                kind,
            })?;

        Ok(Self {
            message_id,
            sender: raw.sender,
            kind,
            content: raw.content,
            in_reply_to: raw.in_reply_to.filter(|id| !id.is_empty()).map(MessageId::from),
            timestamp: raw.timestamp,
        })
    }

    /// Encodes this message as a single JSON text frame.
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

/// Builds messages on behalf of one named participant.
#[derive(Debug, Clone)]
pub struct MessageFactory {
    sender: String,
}

impl MessageFactory {
    pub fn new(sender: impl Into<String>) -> Self {
        Self {
            sender: sender.into(),
        }
    }

    pub fn sender(&self) -> &str {
        &self.sender
    }

    /// Creates a message with a fresh id and the current UTC timestamp.
    pub fn create(
        &self,
        content: impl Into<String>,
        kind: MessageType,
        in_reply_to: Option<MessageId>,
    ) -> Message {
        Message {
            message_id: MessageId::generate(),
            sender: self.sender.clone(),
            kind,
            content: content.into(),
            in_reply_to,
            timestamp: Utc::now().to_rfc3339_opts(SecondsFormat::Micros, true),
        }
    }

    pub fn question(&self, content: impl Into<String>) -> Message {
        self.create(content, MessageType::Question, None)
    }

    pub fn answer(&self, content: impl Into<String>, question: &Message) -> Message {
        self.create(
            content,
            MessageType::Answer,
            Some(question.message_id.clone()),
        )
    }

    /// Acknowledges receipt of `received`, naming it in the ack's content.
    pub fn ack(&self, received: &Message) -> Message {
        let label = match received.kind {
            MessageType::Question => "Question",
            MessageType::Answer => "Answer",
            MessageType::Ack => "Ack",
        };
        self.create(
            format!("{} received: {}", label, received.message_id),
            MessageType::Ack,
            Some(received.message_id.clone()),
        )
    }
}
