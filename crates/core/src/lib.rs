//! Parley Core
//!
//! The transport-independent half of the parley protocol: the message schema,
//! the bounded deduplication cache, the turn-taking state machine, and the
//! handler interface that applications implement. Networking lives in the
//! `parley-link` service crate.

pub mod conversation;
pub mod dedup;
pub mod handler;
pub mod message;

pub use conversation::{AnswerOutcome, Conversation, ConversationState, NotReady};
pub use dedup::DedupCache;
pub use handler::MessageHandler;
pub use message::{FrameError, Message, MessageFactory, MessageId, MessageType};
