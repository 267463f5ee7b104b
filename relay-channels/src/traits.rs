use crate::error::{ChannelError, Result};
use crate::types::{InboundMessage, MessageId, OutboundMessage};
use async_trait::async_trait;
use tokio::sync::mpsc;

const DEFAULT_MAX_MESSAGE_CHARS: usize = 4096;

#[async_trait]
pub trait ChannelAdapter: Send + Sync {
    /// Unique channel identifier: "webchat", "telegram".
    fn channel_id(&self) -> &str;

    /// Start receiving messages. Push to tx for each inbound message.
    async fn start(&self, tx: mpsc::Sender<InboundMessage>) -> Result<()>;

    /// Send a new message and return the platform id it was stored under.
    async fn send(&self, recipient_id: &str, message: OutboundMessage) -> Result<MessageId>;

    /// Replace the content of a message sent earlier.
    async fn edit(
        &self,
        _recipient_id: &str,
        _message_id: &MessageId,
        _content: &str,
    ) -> Result<()> {
        Err(ChannelError::Unsupported("edit"))
    }

    /// Send typing state updates where supported.
    async fn send_typing(&self, _recipient_id: &str, _active: bool) -> Result<()> {
        Err(ChannelError::Unsupported("send_typing"))
    }

    fn supports_edits(&self) -> bool {
        false
    }

    fn supports_typing_events(&self) -> bool {
        false
    }

    /// Longest message body the platform accepts, in chars.
    fn max_message_chars(&self) -> usize {
        DEFAULT_MAX_MESSAGE_CHARS
    }
}
