use crate::error::PushError;
use crate::types::DestinationId;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PushKind {
    /// In-flight snapshot; more text will follow.
    Partial,
    /// Complete text for the session.
    Final,
}

#[derive(Debug, Clone, Copy)]
pub struct PushUpdate<'a> {
    pub text: &'a str,
    pub kind: PushKind,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PushAck {
    /// Platform message id of the message now showing the text, if known.
    pub message_id: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    RateLimited,
    Transient,
    Fatal,
}

/// Downstream delivery primitive.
///
/// Every push carries the full display text, never a delta; the sink decides
/// whether that becomes a new message or an edit of an earlier one.
#[async_trait]
pub trait DeliverySink: Send + Sync {
    async fn push(
        &self,
        destination: &DestinationId,
        update: PushUpdate<'_>,
    ) -> Result<PushAck, PushError>;
}
