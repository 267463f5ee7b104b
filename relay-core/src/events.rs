use crate::delivery::FailureKind;
use crate::types::{DestinationId, SessionToken, ThreadId};
use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::broadcast;

const EVENT_BUS_CAPACITY: usize = 1024;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EventKind {
    SessionStarted,
    PushAttempted { chars: usize, probe: bool },
    PushSucceeded { chars: usize },
    PushFailed { kind: FailureKind, error: String },
    CircuitOpened { cooldown_secs: u64 },
    CircuitClosed,
    StreamingAbandoned { consecutive_failures: u32 },
    LockBusyRejected,
    LockForceReleased { held_for_ms: u64 },
    SessionFinished { outcome: String, total_chars: usize, delivered_chars: usize },
}

#[derive(Debug, Clone, Serialize)]
pub struct RelayEvent {
    pub at: DateTime<Utc>,
    pub session_id: Option<SessionToken>,
    pub thread_id: Option<ThreadId>,
    pub destination: Option<DestinationId>,
    #[serde(flatten)]
    pub kind: EventKind,
}

impl RelayEvent {
    pub fn new(kind: EventKind) -> Self {
        Self {
            at: Utc::now(),
            session_id: None,
            thread_id: None,
            destination: None,
            kind,
        }
    }

    pub fn session(mut self, session_id: SessionToken) -> Self {
        self.session_id = Some(session_id);
        self
    }

    pub fn thread(mut self, thread_id: &ThreadId) -> Self {
        self.thread_id = Some(thread_id.clone());
        self
    }

    pub fn destination(mut self, destination: &DestinationId) -> Self {
        self.destination = Some(destination.clone());
        self
    }
}

/// Fan-out of engine events to whoever is listening.
///
/// Emitting never blocks; with no subscribers events are dropped, and slow
/// subscribers observe a lag instead of stalling the dispatcher.
#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<RelayEvent>,
}

impl EventBus {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(EVENT_BUS_CAPACITY);
        Self { tx }
    }

    pub fn emit(&self, event: RelayEvent) {
        let _ = self.tx.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<RelayEvent> {
        self.tx.subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn subscribers_receive_emitted_events() {
        let bus = EventBus::new();
        let mut rx = bus.subscribe();
        let thread = ThreadId::new("T1");
        bus.emit(RelayEvent::new(EventKind::LockBusyRejected).thread(&thread));
        let event = rx.recv().await.expect("event");
        assert_eq!(event.kind, EventKind::LockBusyRejected);
        assert_eq!(event.thread_id, Some(thread));
    }

    #[test]
    fn emit_without_subscribers_is_a_no_op() {
        EventBus::new().emit(RelayEvent::new(EventKind::CircuitClosed));
    }

    #[test]
    fn events_serialize_flat() {
        let event = RelayEvent::new(EventKind::PushSucceeded { chars: 12 })
            .destination(&DestinationId::new("webchat:a"));
        let json = serde_json::to_value(&event).expect("serialize");
        assert_eq!(json["type"], "push_succeeded");
        assert_eq!(json["chars"], 12);
        assert_eq!(json["destination"], "webchat:a");
    }
}
