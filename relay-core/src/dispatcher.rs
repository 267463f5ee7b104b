//! Session orchestration: lock, stream, push, flush, release.
//!
//! A session walks `Idle → Acquiring → Streaming → Flushing → Terminated`.
//! While streaming, the dispatcher waits on three things at once: the
//! cancellation token, the next fragment, and a poll timer armed for the
//! moment the buffered text becomes both due and permitted. Nothing ever
//! sleeps through a breaker cooldown; the timer only wakes the loop to
//! re-check timestamps while fragments keep flowing in.

use crate::config::StreamingConfig;
use crate::delivery::{DeliverySink, PushKind, PushUpdate};
use crate::error::{DispatchError, ProducerError};
use crate::events::{EventBus, EventKind, RelayEvent};
use crate::governor::{CircuitTransition, PushPermit, RateGovernor};
use crate::lock::ThreadLock;
use crate::producer::FragmentStream;
use crate::session::{SessionState, StreamSession};
use crate::types::{DestinationId, SessionToken, ThreadId};
use futures_util::StreamExt;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

pub struct DispatchRequest {
    pub thread_id: ThreadId,
    pub destination: DestinationId,
    pub fragments: FragmentStream,
    pub sink: Arc<dyn DeliverySink>,
    pub cancel: CancellationToken,
    /// When false, only the end-of-stream delivery is attempted.
    pub incremental: bool,
}

impl DispatchRequest {
    pub fn new(
        thread_id: impl Into<ThreadId>,
        destination: impl Into<DestinationId>,
        fragments: FragmentStream,
        sink: Arc<dyn DeliverySink>,
    ) -> Self {
        Self {
            thread_id: thread_id.into(),
            destination: destination.into(),
            fragments,
            sink,
            cancel: CancellationToken::new(),
            incremental: true,
        }
    }

    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn incremental(mut self, incremental: bool) -> Self {
        self.incremental = incremental;
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionOutcome {
    /// The complete text is showing at the destination.
    Delivered,
    /// Generation finished but the complete text could not be delivered.
    Partial,
    /// Another session owns the thread; nothing was done.
    Busy,
    Cancelled,
    Failed(DispatchError),
}

impl SessionOutcome {
    pub fn label(&self) -> &'static str {
        match self {
            Self::Delivered => "delivered",
            Self::Partial => "partial",
            Self::Busy => "busy",
            Self::Cancelled => "cancelled",
            Self::Failed(DispatchError::Producer(_)) => "producer_error",
            Self::Failed(DispatchError::FatalDelivery(_)) => "fatal_delivery",
        }
    }
}

#[derive(Debug, Clone)]
pub struct SessionReport {
    pub session_id: SessionToken,
    pub thread_id: ThreadId,
    pub outcome: SessionOutcome,
    /// Everything the producer emitted, unbalanced.
    pub text: String,
    pub total_chars: usize,
    pub delivered_chars: usize,
    pub pushes_attempted: u32,
    pub pushes_succeeded: u32,
    pub streaming_abandoned: bool,
    pub elapsed: Duration,
}

impl SessionReport {
    pub fn fully_delivered(&self) -> bool {
        self.delivered_chars == self.total_chars
    }
}

enum StreamEnd {
    Exhausted,
    ProducerFailed(ProducerError),
    Fatal(String),
    Cancelled,
}

enum PushResult {
    Delivered,
    Failed { retry_after: Option<Duration> },
    Fatal(String),
    Cancelled,
}

enum FlushEnd {
    Delivered,
    NothingPending,
    Undelivered,
    Fatal(String),
    Cancelled,
}

/// Releases the thread lock when the session ends, however it ends.
struct Lease<'a> {
    locks: &'a ThreadLock,
    thread_id: ThreadId,
    token: SessionToken,
}

impl Drop for Lease<'_> {
    fn drop(&mut self) {
        self.locks.release(&self.thread_id, self.token);
    }
}

pub struct StreamDispatcher {
    config: StreamingConfig,
    governor: Arc<RateGovernor>,
    locks: Arc<ThreadLock>,
    events: EventBus,
}

impl StreamDispatcher {
    pub fn new(
        config: StreamingConfig,
        governor: Arc<RateGovernor>,
        locks: Arc<ThreadLock>,
        events: EventBus,
    ) -> Self {
        Self {
            config,
            governor,
            locks,
            events,
        }
    }

    /// Dispatcher with fresh governor and lock state built from `config`.
    pub fn from_config(config: StreamingConfig, events: EventBus) -> Self {
        let governor = Arc::new(RateGovernor::new(config.governor_policy()));
        Self::new(config, governor, Arc::new(ThreadLock::new()), events)
    }

    pub fn config(&self) -> &StreamingConfig {
        &self.config
    }

    pub fn governor(&self) -> &Arc<RateGovernor> {
        &self.governor
    }

    pub fn locks(&self) -> &Arc<ThreadLock> {
        &self.locks
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    #[tracing::instrument(
        level = "info",
        skip_all,
        fields(thread_id = %request.thread_id, destination = %request.destination)
    )]
    pub async fn dispatch(&self, request: DispatchRequest) -> SessionReport {
        let DispatchRequest {
            thread_id,
            destination,
            mut fragments,
            sink,
            cancel,
            incremental,
        } = request;
        let started_at = Instant::now();
        let mut session = StreamSession::new(
            thread_id.clone(),
            destination,
            self.config.size_threshold_chars,
            self.config.time_threshold(),
            started_at,
        );

        session.advance(SessionState::Acquiring);
        let token = match self.locks.try_acquire(&thread_id) {
            Ok(token) => token,
            Err(busy) => {
                tracing::info!(
                    held_for_ms = busy.held_for.as_millis() as u64,
                    "thread busy; rejecting generation"
                );
                self.emit(&session, EventKind::LockBusyRejected);
                session.advance(SessionState::Terminated);
                return self.finish(session, SessionOutcome::Busy, started_at);
            }
        };
        session.adopt_token(token);
        let lease = Lease {
            locks: &self.locks,
            thread_id,
            token,
        };
        self.emit(&session, EventKind::SessionStarted);
        tracing::info!(session_id = %token, incremental, "session started");

        session.advance(SessionState::Streaming);
        let end = self
            .stream(&mut session, &mut fragments, sink.as_ref(), &cancel, incremental)
            .await;
        drop(fragments);

        let outcome = match end {
            StreamEnd::Cancelled => SessionOutcome::Cancelled,
            StreamEnd::Fatal(message) => {
                SessionOutcome::Failed(DispatchError::FatalDelivery(message))
            }
            StreamEnd::Exhausted => match self.flush(&mut session, sink.as_ref(), &cancel).await {
                FlushEnd::Delivered | FlushEnd::NothingPending => SessionOutcome::Delivered,
                FlushEnd::Undelivered => SessionOutcome::Partial,
                FlushEnd::Fatal(message) => {
                    SessionOutcome::Failed(DispatchError::FatalDelivery(message))
                }
                FlushEnd::Cancelled => SessionOutcome::Cancelled,
            },
            StreamEnd::ProducerFailed(error) => {
                // Best effort: show whatever arrived before the failure.
                match self.flush(&mut session, sink.as_ref(), &cancel).await {
                    FlushEnd::Cancelled => SessionOutcome::Cancelled,
                    _ => SessionOutcome::Failed(DispatchError::Producer(error)),
                }
            }
        };

        session.advance(SessionState::Terminated);
        drop(lease);
        self.finish(session, outcome, started_at)
    }

    async fn stream(
        &self,
        session: &mut StreamSession,
        fragments: &mut FragmentStream,
        sink: &dyn DeliverySink,
        cancel: &CancellationToken,
        incremental: bool,
    ) -> StreamEnd {
        let mut held_at_len: Option<usize> = None;
        loop {
            let poll_at = if incremental {
                self.next_poll_at(session, held_at_len)
            } else {
                None
            };

            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    tracing::info!(
                        session_id = %session.id(),
                        accumulated_chars = session.buffer.len(),
                        "session cancelled while streaming"
                    );
                    return StreamEnd::Cancelled;
                }
                next = fragments.next() => match next {
                    Some(Ok(fragment)) => session.buffer.append(&fragment),
                    Some(Err(error)) => {
                        tracing::warn!(
                            session_id = %session.id(),
                            %error,
                            accumulated_chars = session.buffer.len(),
                            "producer failed mid-stream"
                        );
                        return StreamEnd::ProducerFailed(error);
                    }
                    None => {
                        tracing::debug!(
                            session_id = %session.id(),
                            fragments = session.buffer.fragments(),
                            accumulated_chars = session.buffer.len(),
                            "producer exhausted"
                        );
                        return StreamEnd::Exhausted;
                    }
                },
                _ = tokio::time::sleep_until(poll_at.unwrap_or_else(Instant::now)), if poll_at.is_some() => {}
            }

            if !incremental || session.streaming_abandoned {
                continue;
            }

            let now = Instant::now();
            if !session.buffer.due(now) {
                continue;
            }
            let display = session.buffer.snapshot().into_owned();
            let display_len = display.chars().count();
            if display_len < session.buffer.last_pushed_display_len() {
                // A closer vanished and the display would shrink; wait for more text.
                held_at_len = Some(session.buffer.len());
                continue;
            }
            held_at_len = None;

            let permit = self.governor.acquire_permit(session.destination(), now);
            if let PushPermit::Denied(reason) = permit {
                tracing::trace!(session_id = %session.id(), ?reason, "incremental push deferred");
                continue;
            }

            match self
                .attempt_push(session, sink, cancel, &display, PushKind::Partial, permit)
                .await
            {
                PushResult::Delivered | PushResult::Failed { .. } => {}
                PushResult::Fatal(message) => return StreamEnd::Fatal(message),
                PushResult::Cancelled => return StreamEnd::Cancelled,
            }
        }
    }

    /// When the buffered text next becomes both due and permitted.
    fn next_poll_at(&self, session: &StreamSession, held_at_len: Option<usize>) -> Option<Instant> {
        let buffer = &session.buffer;
        if session.streaming_abandoned || buffer.unpushed_chars() == 0 {
            return None;
        }
        if held_at_len == Some(buffer.len()) {
            return None;
        }
        let now = Instant::now();
        let content_due = if buffer.is_size_due() {
            now
        } else {
            buffer.time_due_at()?
        };
        let permitted = self.governor.ready_at(session.destination(), now);
        Some(content_due.max(permitted))
    }

    async fn flush(
        &self,
        session: &mut StreamSession,
        sink: &dyn DeliverySink,
        cancel: &CancellationToken,
    ) -> FlushEnd {
        session.advance(SessionState::Flushing);
        session.buffer.request_flush();
        if session.buffer.is_empty() {
            return FlushEnd::NothingPending;
        }

        // Unconditional: a partial that showed every char may still have been
        // truncated by the sink.
        let attempts = self.config.final_flush_attempts.max(1);
        for attempt in 1..=attempts {
            let now = Instant::now();
            let permit = self.governor.acquire_final_permit(session.destination(), now);
            if let PushPermit::Denied(reason) = permit {
                tracing::warn!(
                    session_id = %session.id(),
                    ?reason,
                    unpushed_chars = session.buffer.unpushed_chars(),
                    "final flush blocked by open circuit"
                );
                return FlushEnd::Undelivered;
            }

            let display = session.buffer.snapshot().into_owned();
            match self
                .attempt_push(session, sink, cancel, &display, PushKind::Final, permit)
                .await
            {
                PushResult::Delivered => return FlushEnd::Delivered,
                PushResult::Fatal(message) => return FlushEnd::Fatal(message),
                PushResult::Cancelled => return FlushEnd::Cancelled,
                PushResult::Failed { retry_after } => {
                    if attempt == attempts {
                        break;
                    }
                    let policy = self.governor.policy();
                    let wait = retry_after
                        .unwrap_or_else(|| self.governor.interval(session.destination()))
                        .min(policy.max_interval);
                    tracing::debug!(
                        session_id = %session.id(),
                        attempt,
                        wait_ms = wait.as_millis() as u64,
                        "final flush failed; retrying"
                    );
                    tokio::select! {
                        biased;
                        _ = cancel.cancelled() => return FlushEnd::Cancelled,
                        _ = tokio::time::sleep(wait) => {}
                    }
                }
            }
        }

        tracing::warn!(
            session_id = %session.id(),
            attempts,
            unpushed_chars = session.buffer.unpushed_chars(),
            "final flush gave up"
        );
        FlushEnd::Undelivered
    }

    async fn attempt_push(
        &self,
        session: &mut StreamSession,
        sink: &dyn DeliverySink,
        cancel: &CancellationToken,
        display: &str,
        kind: PushKind,
        permit: PushPermit,
    ) -> PushResult {
        let destination = session.destination().clone();
        let chars = display.chars().count();
        session.pushes_attempted = session.pushes_attempted.saturating_add(1);
        self.emit(
            session,
            EventKind::PushAttempted {
                chars,
                probe: permit.is_probe(),
            },
        );

        let update = PushUpdate {
            text: display,
            kind,
        };
        let result = tokio::select! {
            biased;
            _ = cancel.cancelled() => None,
            result = sink.push(&destination, update) => Some(result),
        };
        let Some(result) = result else {
            if permit.is_probe() {
                self.governor.abandon_probe(&destination);
            }
            tracing::info!(session_id = %session.id(), "session cancelled during push");
            return PushResult::Cancelled;
        };

        let now = Instant::now();
        match result {
            Ok(_) => {
                if let Some(transition) = self.governor.record_success(&destination, now) {
                    self.emit_transition(session, transition);
                }
                session.buffer.mark_pushed(now, chars);
                session.consecutive_failures = 0;
                session.pushes_succeeded = session.pushes_succeeded.saturating_add(1);
                self.emit(session, EventKind::PushSucceeded { chars });
                tracing::debug!(session_id = %session.id(), ?kind, chars, "push delivered");
                PushResult::Delivered
            }
            Err(error) if error.counts_toward_backoff() => {
                let retry_after = error.retry_after();
                let transition = self.governor.record_failure(&destination, retry_after, now);
                tracing::warn!(
                    session_id = %session.id(),
                    ?kind,
                    failure = ?error.kind(),
                    %error,
                    "push failed"
                );
                self.emit(
                    session,
                    EventKind::PushFailed {
                        kind: error.kind(),
                        error: error.to_string(),
                    },
                );
                if let Some(transition) = transition {
                    self.emit_transition(session, transition);
                }

                session.consecutive_failures = session.consecutive_failures.saturating_add(1);
                if !session.streaming_abandoned
                    && session.consecutive_failures >= self.config.abandon_streaming_threshold
                {
                    session.streaming_abandoned = true;
                    tracing::warn!(
                        session_id = %session.id(),
                        consecutive_failures = session.consecutive_failures,
                        "abandoning incremental pushes for this session"
                    );
                    self.emit(
                        session,
                        EventKind::StreamingAbandoned {
                            consecutive_failures: session.consecutive_failures,
                        },
                    );
                }
                PushResult::Failed { retry_after }
            }
            Err(error) => {
                if permit.is_probe() {
                    self.governor.abandon_probe(&destination);
                }
                tracing::error!(
                    session_id = %session.id(),
                    ?kind,
                    %error,
                    "destination rejected push"
                );
                self.emit(
                    session,
                    EventKind::PushFailed {
                        kind: error.kind(),
                        error: error.to_string(),
                    },
                );
                PushResult::Fatal(error.to_string())
            }
        }
    }

    fn finish(
        &self,
        session: StreamSession,
        outcome: SessionOutcome,
        started_at: Instant,
    ) -> SessionReport {
        let total_chars = session.buffer.len();
        let delivered_chars = session.buffer.last_pushed_len();
        self.emit(
            &session,
            EventKind::SessionFinished {
                outcome: outcome.label().to_string(),
                total_chars,
                delivered_chars,
            },
        );
        let elapsed = started_at.elapsed();
        tracing::info!(
            session_id = %session.id(),
            outcome = outcome.label(),
            total_chars,
            delivered_chars,
            pushes_attempted = session.pushes_attempted,
            pushes_succeeded = session.pushes_succeeded,
            streaming_abandoned = session.streaming_abandoned,
            elapsed_ms = elapsed.as_millis() as u64,
            "session finished"
        );

        let session_id = session.id();
        let thread_id = session.thread_id().clone();
        let pushes_attempted = session.pushes_attempted;
        let pushes_succeeded = session.pushes_succeeded;
        let streaming_abandoned = session.streaming_abandoned;
        SessionReport {
            session_id,
            thread_id,
            outcome,
            text: session.buffer.into_text(),
            total_chars,
            delivered_chars,
            pushes_attempted,
            pushes_succeeded,
            streaming_abandoned,
            elapsed,
        }
    }

    fn emit_transition(&self, session: &StreamSession, transition: CircuitTransition) {
        let kind = match transition {
            CircuitTransition::Opened { cooldown, .. } => EventKind::CircuitOpened {
                cooldown_secs: cooldown.as_secs(),
            },
            CircuitTransition::Closed => EventKind::CircuitClosed,
        };
        self.emit(session, kind);
    }

    fn emit(&self, session: &StreamSession, kind: EventKind) {
        self.events.emit(
            RelayEvent::new(kind)
                .session(session.id())
                .thread(session.thread_id())
                .destination(session.destination()),
        );
    }
}
