use crate::message::Message;
use anyhow::Result;
use async_trait::async_trait;

/// Application callbacks invoked as messages are dispatched.
///
/// Every method has a no-op default, so an integration only overrides the
/// slots it cares about. Errors returned from any method are logged at the
/// dispatch boundary and never tear down the connection.
#[async_trait]
pub trait MessageHandler: Send + Sync {
    /// Called for every new question. Returning non-empty text sends it back
    /// as the answer on the connection the question arrived on.
    async fn on_question(&self, _question: &Message) -> Result<Option<String>> {
        Ok(None)
    }

    /// Called for every new answer, whether or not it matches a pending question.
    async fn on_answer(&self, _answer: &Message) -> Result<()> {
        Ok(())
    }

    async fn on_ack(&self, _ack: &Message) -> Result<()> {
        Ok(())
    }

    /// Called when a question sent by this participant went unanswered for
    /// the configured answer timeout.
    async fn on_timeout(&self, _question: &Message) -> Result<()> {
        Ok(())
    }
}
