use crate::buffer::StreamBuffer;
use crate::types::{DestinationId, SessionToken, ThreadId};
use serde::Serialize;
use std::time::Duration;
use tokio::time::Instant;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Idle,
    Acquiring,
    Streaming,
    Flushing,
    Terminated,
}

/// One in-flight generation. Owned by the dispatcher call that created it.
#[derive(Debug)]
pub struct StreamSession {
    id: SessionToken,
    thread_id: ThreadId,
    destination: DestinationId,
    state: SessionState,
    pub(crate) buffer: StreamBuffer,
    pub(crate) consecutive_failures: u32,
    pub(crate) streaming_abandoned: bool,
    pub(crate) pushes_attempted: u32,
    pub(crate) pushes_succeeded: u32,
}

impl StreamSession {
    pub fn new(
        thread_id: ThreadId,
        destination: DestinationId,
        size_threshold: usize,
        time_threshold: Duration,
        now: Instant,
    ) -> Self {
        Self {
            id: SessionToken::new(),
            thread_id,
            destination,
            state: SessionState::Idle,
            buffer: StreamBuffer::new(size_threshold, time_threshold, now),
            consecutive_failures: 0,
            streaming_abandoned: false,
            pushes_attempted: 0,
            pushes_succeeded: 0,
        }
    }

    pub fn id(&self) -> SessionToken {
        self.id
    }

    /// Adopts the lock token so the session and its lease share one id.
    pub(crate) fn adopt_token(&mut self, token: SessionToken) {
        self.id = token;
    }

    pub fn thread_id(&self) -> &ThreadId {
        &self.thread_id
    }

    pub fn destination(&self) -> &DestinationId {
        &self.destination
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn buffer(&self) -> &StreamBuffer {
        &self.buffer
    }

    pub fn streaming_abandoned(&self) -> bool {
        self.streaming_abandoned
    }

    /// Moves the session forward. Backward moves are ignored and logged.
    pub fn advance(&mut self, next: SessionState) {
        if next < self.state {
            tracing::error!(
                session_id = %self.id,
                from = ?self.state,
                to = ?next,
                "refusing backward session state transition"
            );
            return;
        }
        if next != self.state {
            tracing::debug!(
                session_id = %self.id,
                thread_id = %self.thread_id,
                from = ?self.state,
                to = ?next,
                "session state changed"
            );
        }
        self.state = next;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn state_only_moves_forward() {
        let mut session = StreamSession::new(
            ThreadId::new("T"),
            DestinationId::new("D"),
            10,
            Duration::from_secs(1),
            Instant::now(),
        );
        assert_eq!(session.state(), SessionState::Idle);
        session.advance(SessionState::Streaming);
        session.advance(SessionState::Streaming);
        assert_eq!(session.state(), SessionState::Streaming);
        session.advance(SessionState::Acquiring);
        assert_eq!(session.state(), SessionState::Streaming);
        session.advance(SessionState::Terminated);
        assert_eq!(session.state(), SessionState::Terminated);
    }
}
