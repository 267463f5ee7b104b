//! Event-bus subscriber that keeps relay counters and logs engine events.

use dashmap::DashMap;
use relay_core::{EventBus, EventKind, RelayEvent};
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

#[derive(Default)]
pub struct RelayStats {
    sessions_started: AtomicU64,
    pushes_attempted: AtomicU64,
    pushes_succeeded: AtomicU64,
    pushes_failed: AtomicU64,
    circuits_opened: AtomicU64,
    circuits_closed: AtomicU64,
    streaming_abandoned: AtomicU64,
    busy_rejections: AtomicU64,
    forced_releases: AtomicU64,
    events_lagged: AtomicU64,
    outcomes: DashMap<String, u64>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct StatsSnapshot {
    pub sessions_started: u64,
    pub pushes_attempted: u64,
    pub pushes_succeeded: u64,
    pub pushes_failed: u64,
    pub circuits_opened: u64,
    pub circuits_closed: u64,
    pub streaming_abandoned: u64,
    pub busy_rejections: u64,
    pub forced_releases: u64,
    pub events_lagged: u64,
    pub outcomes: BTreeMap<String, u64>,
}

impl RelayStats {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Follows `events` until `cancel` fires or the bus closes.
    pub fn spawn(self: &Arc<Self>, events: &EventBus, cancel: CancellationToken) -> JoinHandle<()> {
        let stats = self.clone();
        let mut rx = events.subscribe();
        tokio::spawn(async move {
            loop {
                let event = tokio::select! {
                    _ = cancel.cancelled() => break,
                    event = rx.recv() => event,
                };
                match event {
                    Ok(event) => stats.record(&event),
                    Err(RecvError::Lagged(skipped)) => {
                        stats.events_lagged.fetch_add(skipped, Ordering::Relaxed);
                        tracing::warn!(skipped, "stats subscriber lagged behind event bus");
                    }
                    Err(RecvError::Closed) => break,
                }
            }
            tracing::debug!("stats subscriber stopped");
        })
    }

    pub fn record(&self, event: &RelayEvent) {
        let session_id = event.session_id.map(|id| id.to_string());
        let thread_id = event.thread_id.as_deref().unwrap_or("");
        let destination = event.destination.as_deref().unwrap_or("");

        match &event.kind {
            EventKind::SessionStarted => {
                self.sessions_started.fetch_add(1, Ordering::Relaxed);
                tracing::debug!(?session_id, thread_id, destination, "session started");
            }
            EventKind::PushAttempted { chars, probe } => {
                self.pushes_attempted.fetch_add(1, Ordering::Relaxed);
                tracing::trace!(?session_id, destination, chars, probe, "push attempted");
            }
            EventKind::PushSucceeded { chars } => {
                self.pushes_succeeded.fetch_add(1, Ordering::Relaxed);
                tracing::trace!(?session_id, destination, chars, "push succeeded");
            }
            EventKind::PushFailed { kind, error } => {
                self.pushes_failed.fetch_add(1, Ordering::Relaxed);
                tracing::debug!(?session_id, destination, ?kind, error = %error, "push failed");
            }
            EventKind::CircuitOpened { cooldown_secs } => {
                self.circuits_opened.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(destination, cooldown_secs, "circuit opened");
            }
            EventKind::CircuitClosed => {
                self.circuits_closed.fetch_add(1, Ordering::Relaxed);
                tracing::info!(destination, "circuit closed");
            }
            EventKind::StreamingAbandoned {
                consecutive_failures,
            } => {
                self.streaming_abandoned.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(
                    ?session_id,
                    destination,
                    consecutive_failures,
                    "incremental streaming abandoned"
                );
            }
            EventKind::LockBusyRejected => {
                self.busy_rejections.fetch_add(1, Ordering::Relaxed);
                tracing::debug!(thread_id, "generation rejected: thread busy");
            }
            EventKind::LockForceReleased { held_for_ms } => {
                self.forced_releases.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(?session_id, thread_id, held_for_ms, "thread lock force released");
            }
            EventKind::SessionFinished {
                outcome,
                total_chars,
                delivered_chars,
            } => {
                *self.outcomes.entry(outcome.clone()).or_insert(0) += 1;
                tracing::debug!(
                    ?session_id,
                    thread_id,
                    outcome = %outcome,
                    total_chars,
                    delivered_chars,
                    "session finished"
                );
            }
        }
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            sessions_started: self.sessions_started.load(Ordering::Relaxed),
            pushes_attempted: self.pushes_attempted.load(Ordering::Relaxed),
            pushes_succeeded: self.pushes_succeeded.load(Ordering::Relaxed),
            pushes_failed: self.pushes_failed.load(Ordering::Relaxed),
            circuits_opened: self.circuits_opened.load(Ordering::Relaxed),
            circuits_closed: self.circuits_closed.load(Ordering::Relaxed),
            streaming_abandoned: self.streaming_abandoned.load(Ordering::Relaxed),
            busy_rejections: self.busy_rejections.load(Ordering::Relaxed),
            forced_releases: self.forced_releases.load(Ordering::Relaxed),
            events_lagged: self.events_lagged.load(Ordering::Relaxed),
            outcomes: self
                .outcomes
                .iter()
                .map(|entry| (entry.key().clone(), *entry.value()))
                .collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use relay_core::{FailureKind, ThreadId};

    #[test]
    fn record_counts_each_kind() {
        let stats = RelayStats::new();
        let thread = ThreadId::new("webchat:a");
        stats.record(&RelayEvent::new(EventKind::SessionStarted).thread(&thread));
        stats.record(&RelayEvent::new(EventKind::PushAttempted {
            chars: 10,
            probe: false,
        }));
        stats.record(&RelayEvent::new(EventKind::PushFailed {
            kind: FailureKind::RateLimited,
            error: "429".to_string(),
        }));
        stats.record(&RelayEvent::new(EventKind::LockBusyRejected).thread(&thread));
        for outcome in ["delivered", "delivered", "partial"] {
            stats.record(&RelayEvent::new(EventKind::SessionFinished {
                outcome: outcome.to_string(),
                total_chars: 10,
                delivered_chars: 10,
            }));
        }

        let snap = stats.snapshot();
        assert_eq!(snap.sessions_started, 1);
        assert_eq!(snap.pushes_attempted, 1);
        assert_eq!(snap.pushes_failed, 1);
        assert_eq!(snap.pushes_succeeded, 0);
        assert_eq!(snap.busy_rejections, 1);
        assert_eq!(snap.outcomes.get("delivered"), Some(&2));
        assert_eq!(snap.outcomes.get("partial"), Some(&1));
    }

    #[tokio::test]
    async fn subscriber_follows_the_bus_until_cancelled() {
        let stats = RelayStats::new();
        let bus = EventBus::new();
        let cancel = CancellationToken::new();
        let handle = stats.spawn(&bus, cancel.clone());

        bus.emit(RelayEvent::new(EventKind::CircuitOpened { cooldown_secs: 300 }));
        bus.emit(RelayEvent::new(EventKind::CircuitClosed));

        for _ in 0..100 {
            if stats.snapshot().circuits_closed == 1 {
                break;
            }
            tokio::task::yield_now().await;
        }
        let snap = stats.snapshot();
        assert_eq!(snap.circuits_opened, 1);
        assert_eq!(snap.circuits_closed, 1);

        cancel.cancel();
        handle.await.expect("subscriber task");
    }
}
