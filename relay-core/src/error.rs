use crate::delivery::FailureKind;
use std::time::Duration;
use thiserror::Error;

/// Terminal failure of the generation producer.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProducerError {
    #[error("generation backend failed: {0}")]
    Backend(String),

    #[error("generation stream malformed: {0}")]
    Malformed(String),
}

/// Result of a single push, as classified by the delivery side.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PushError {
    #[error("rate limited (retry_after={retry_after:?})")]
    RateLimited { retry_after: Option<Duration> },

    #[error("transient delivery error: {0}")]
    Transient(String),

    #[error("fatal delivery error: {0}")]
    Fatal(String),
}

impl PushError {
    pub fn kind(&self) -> FailureKind {
        match self {
            Self::RateLimited { .. } => FailureKind::RateLimited,
            Self::Transient(_) => FailureKind::Transient,
            Self::Fatal(_) => FailureKind::Fatal,
        }
    }

    /// Fatal errors bypass backoff accounting entirely.
    pub fn counts_toward_backoff(&self) -> bool {
        !matches!(self, Self::Fatal(_))
    }

    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            Self::RateLimited { retry_after } => *retry_after,
            _ => None,
        }
    }
}

/// Errors that end a session and are surfaced to the caller.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DispatchError {
    #[error(transparent)]
    Producer(#[from] ProducerError),

    #[error("destination rejected delivery: {0}")]
    FatalDelivery(String),
}

/// Another session already owns the thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("thread is busy (held for {held_for:?})")]
pub struct LockBusy {
    pub held_for: Duration,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("invalid streaming config: {0}")]
    Invalid(String),
}
