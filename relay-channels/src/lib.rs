//! Channel adapters for chatrelay.
//!
//! Adapters are pure I/O: they turn platform updates into `InboundMessage`s
//! and carry outbound text back, classifying every failure so the relay
//! engine can tell a rate limit from a dead chat. `ChannelSink` bridges an
//! adapter to the engine's `DeliverySink` seam.

mod error;
mod sink;
mod telegram;
mod traits;
mod types;
mod webchat;

pub use error::{ChannelError, Result};
pub use sink::{ChannelSink, split_message, truncate_for_display};
pub use telegram::TelegramAdapter;
pub use traits::ChannelAdapter;
pub use types::{ChannelId, InboundMessage, MessageId, OutboundMessage, SenderId, ThreadId};
pub use webchat::WebChatAdapter;
