use relay_core::PushError;
use std::time::Duration;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, ChannelError>;

/// Outcome classes for a failed platform call.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ChannelError {
    #[error("rate limited (retry_after={retry_after:?})")]
    RateLimited { retry_after: Option<Duration> },

    #[error("transient channel error: {0}")]
    Transient(String),

    #[error("channel rejected request: {0}")]
    Fatal(String),

    #[error("{0} is not supported by this channel")]
    Unsupported(&'static str),
}

impl ChannelError {
    pub fn transient(e: impl std::fmt::Display) -> Self {
        Self::Transient(e.to_string())
    }

    pub fn fatal(e: impl std::fmt::Display) -> Self {
        Self::Fatal(e.to_string())
    }
}

impl From<ChannelError> for PushError {
    fn from(e: ChannelError) -> Self {
        match e {
            ChannelError::RateLimited { retry_after } => PushError::RateLimited { retry_after },
            ChannelError::Transient(msg) => PushError::Transient(msg),
            ChannelError::Fatal(msg) => PushError::Fatal(msg),
            ChannelError::Unsupported(op) => PushError::Fatal(format!("{op} is not supported")),
        }
    }
}
