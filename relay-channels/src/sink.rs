//! Adapter-backed delivery for one relay session.
//!
//! The first push of a session sends a draft message; every later push edits
//! that draft in place. Partial snapshots that outgrow the platform limit are
//! cut short with an ellipsis. The final text is split instead, with the
//! draft holding the first part and follow-up messages carrying the rest.

use crate::error::ChannelError;
use crate::traits::ChannelAdapter;
use crate::types::{MessageId, OutboundMessage};
use async_trait::async_trait;
use relay_core::{
    DeliverySink, DestinationId, FenceKind, PushAck, PushError, PushKind, PushUpdate, balance,
    unclosed_region,
};
use std::borrow::Cow;
use std::sync::Arc;
use tokio::sync::Mutex;

const ELLIPSIS: char = '…';
/// Room kept free for a synthetic fence closer plus the ellipsis.
const FENCE_RESERVE: usize = 16;
const MIN_SPLIT_LIMIT: usize = FENCE_RESERVE * 2;

#[derive(Debug, Default)]
struct DraftState {
    message_id: Option<MessageId>,
    followups_sent: usize,
}

pub struct ChannelSink {
    adapter: Arc<dyn ChannelAdapter>,
    recipient_id: String,
    reply_to: Option<MessageId>,
    state: Mutex<DraftState>,
}

impl ChannelSink {
    pub fn new(adapter: Arc<dyn ChannelAdapter>, recipient_id: impl Into<String>) -> Self {
        Self {
            adapter,
            recipient_id: recipient_id.into(),
            reply_to: None,
            state: Mutex::new(DraftState::default()),
        }
    }

    /// Threads the draft under the user's message where the platform allows it.
    pub fn reply_to(mut self, message_id: Option<MessageId>) -> Self {
        self.reply_to = message_id;
        self
    }

    /// Id of the draft message, once the first push has landed.
    pub async fn draft_id(&self) -> Option<MessageId> {
        self.state.lock().await.message_id.clone()
    }

    async fn upsert(&self, state: &mut DraftState, text: &str) -> Result<MessageId, ChannelError> {
        match state.message_id.clone() {
            Some(id) if self.adapter.supports_edits() => {
                self.adapter.edit(&self.recipient_id, &id, text).await?;
                Ok(id)
            }
            _ => {
                let message = OutboundMessage::text(text).reply_to(self.reply_to.clone());
                let id = self.adapter.send(&self.recipient_id, message).await?;
                state.message_id = Some(id.clone());
                Ok(id)
            }
        }
    }
}

#[async_trait]
impl DeliverySink for ChannelSink {
    async fn push(
        &self,
        destination: &DestinationId,
        update: PushUpdate<'_>,
    ) -> Result<PushAck, PushError> {
        let limit = self.adapter.max_message_chars();
        let mut state = self.state.lock().await;

        let id = match update.kind {
            PushKind::Partial => {
                let text = truncate_for_display(update.text, limit);
                self.upsert(&mut state, &text).await?
            }
            PushKind::Final => {
                let mut parts = split_message(update.text, limit).into_iter();
                let head = parts.next().unwrap_or_default();
                let id = self.upsert(&mut state, &head).await?;
                // A retried final must not repeat follow-ups that already went out.
                for part in parts.skip(state.followups_sent) {
                    self.adapter
                        .send(&self.recipient_id, OutboundMessage::text(part))
                        .await?;
                    state.followups_sent += 1;
                }
                if state.followups_sent > 0 {
                    tracing::debug!(
                        destination = %destination,
                        followups = state.followups_sent,
                        "final text split across messages"
                    );
                }
                id
            }
        };

        Ok(PushAck {
            message_id: Some(id.into_inner()),
        })
    }
}

/// Shortens a partial snapshot to `limit` chars, keeping its head readable.
pub fn truncate_for_display(text: &str, limit: usize) -> Cow<'_, str> {
    if text.chars().count() <= limit {
        return Cow::Borrowed(text);
    }
    let keep = limit.saturating_sub(FENCE_RESERVE).max(1);
    let mut out = balance(&text[..byte_offset(text, keep)]).into_owned();
    if !out.ends_with('\n') {
        out.push('\n');
    }
    out.push(ELLIPSIS);
    if out.chars().count() > limit {
        out.truncate(byte_offset(&out, limit.saturating_sub(1)));
        out.push(ELLIPSIS);
    }
    Cow::Owned(out)
}

/// Splits `text` into messages of at most `limit` chars.
///
/// Cuts prefer a line break, then a space, in the back half of the window. A
/// code block that spans a cut is closed at the end of one part and reopened
/// with the same language tag at the start of the next.
pub fn split_message(text: &str, limit: usize) -> Vec<String> {
    let limit = limit.max(MIN_SPLIT_LIMIT);
    let mut parts = Vec::new();
    let mut rest = text;
    let mut reopen: Option<String> = None;

    loop {
        let mut part = reopen.take().unwrap_or_default();
        let used = part.chars().count();
        if used + rest.chars().count() <= limit {
            part.push_str(rest);
            parts.push(part);
            return parts;
        }

        let budget = limit.saturating_sub(used + FENCE_RESERVE).max(1);
        let cut = cut_point(rest, budget);
        let (head, tail) = rest.split_at(cut);
        part.push_str(head);
        rest = tail;

        if let Some(region) = unclosed_region(&part) {
            if region.kind == FenceKind::Block {
                let ticks = "`".repeat(region.ticks);
                if !part.ends_with('\n') {
                    part.push('\n');
                }
                part.push_str(&ticks);
                reopen = Some(format!(
                    "{ticks}{}\n",
                    region.lang.as_deref().unwrap_or_default()
                ));
            }
        }
        parts.push(part);
    }
}

fn cut_point(text: &str, budget: usize) -> usize {
    let hard = byte_offset(text, budget);
    let window = &text[..hard];
    let floor = hard / 2;
    window
        .rfind('\n')
        .filter(|&i| i >= floor)
        .or_else(|| window.rfind(' ').filter(|&i| i >= floor))
        .map_or(hard, |i| i + 1)
}

fn byte_offset(text: &str, chars: usize) -> usize {
    text.char_indices()
        .nth(chars)
        .map_or(text.len(), |(i, _)| i)
}
