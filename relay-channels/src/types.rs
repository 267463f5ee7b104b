use chrono::{DateTime, Utc};
use relay_core::id_newtype;
use serde::{Deserialize, Serialize};

pub use relay_core::ThreadId;

id_newtype!(MessageId);
id_newtype!(ChannelId);
id_newtype!(SenderId);

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InboundMessage {
    pub message_id: MessageId,
    pub channel_id: ChannelId,
    pub sender_id: SenderId,
    /// Conversation the message belongs to; replies are serialized per thread.
    pub thread_id: ThreadId,
    pub is_group: bool,
    pub content: String,
    #[serde(default)]
    pub metadata: serde_json::Value,
    pub received_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct OutboundMessage {
    pub content: String,
    #[serde(default)]
    pub reply_to_message_id: Option<MessageId>,
}

impl OutboundMessage {
    pub fn text(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            reply_to_message_id: None,
        }
    }

    pub fn reply_to(mut self, message_id: Option<MessageId>) -> Self {
        self.reply_to_message_id = message_id;
        self
    }
}
