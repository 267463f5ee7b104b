//! Background housekeeping for the engine's shared maps.
//!
//! Every lease reported by a watched [`ThreadLock`] is parked in a delay
//! queue until its staleness deadline. When the deadline passes and the same
//! session still owns the thread, the lock is force-released. A slower
//! maintenance tick drops idle destinations from the governor once their
//! breaker is no longer open.

use crate::events::{EventBus, EventKind, RelayEvent};
use crate::governor::RateGovernor;
use crate::lock::{LeaseNotice, LeaseReceiver, ThreadLock};
use futures_util::StreamExt;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tokio_util::time::DelayQueue;

const MAX_MAINTENANCE_INTERVAL: Duration = Duration::from_secs(60);

pub struct LockWatchdog {
    locks: Arc<ThreadLock>,
    governor: Arc<RateGovernor>,
    events: EventBus,
    staleness: Duration,
    idle_ttl: Duration,
}

impl LockWatchdog {
    pub fn new(
        locks: Arc<ThreadLock>,
        governor: Arc<RateGovernor>,
        events: EventBus,
        staleness: Duration,
        idle_ttl: Duration,
    ) -> Self {
        Self {
            locks,
            governor,
            events,
            staleness,
            idle_ttl,
        }
    }

    pub fn spawn(self, leases: LeaseReceiver, cancel: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(self.run(leases, cancel))
    }

    async fn run(self, mut leases: LeaseReceiver, cancel: CancellationToken) {
        let mut pending: DelayQueue<LeaseNotice> = DelayQueue::new();
        let mut leases_open = true;

        let every = self
            .idle_ttl
            .min(MAX_MAINTENANCE_INTERVAL)
            .max(Duration::from_millis(100));
        let mut maintenance = tokio::time::interval_at(Instant::now() + every, every);
        maintenance.set_missed_tick_behavior(MissedTickBehavior::Skip);

        tracing::info!(
            staleness_secs = self.staleness.as_secs(),
            idle_ttl_secs = self.idle_ttl.as_secs(),
            "lock watchdog started"
        );

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                notice = leases.recv(), if leases_open => match notice {
                    Some(notice) => {
                        let deadline = notice.acquired_at + self.staleness;
                        pending.insert_at(notice, deadline);
                    }
                    None => {
                        tracing::debug!("lease channel closed");
                        leases_open = false;
                    }
                },
                Some(expired) = pending.next(), if !pending.is_empty() => {
                    self.expire(expired.into_inner());
                }
                _ = maintenance.tick() => {
                    let pruned = self.governor.prune_idle(Instant::now(), self.idle_ttl);
                    if pruned > 0 {
                        tracing::debug!(
                            pruned,
                            remaining = self.governor.len(),
                            "pruned idle destinations"
                        );
                    }
                }
            }
        }

        tracing::info!(tracked = pending.len(), "lock watchdog stopped");
    }

    fn expire(&self, notice: LeaseNotice) {
        let Some(released) = self
            .locks
            .expire(&notice.thread_id, notice.token, self.staleness)
        else {
            return;
        };
        self.events.emit(
            RelayEvent::new(EventKind::LockForceReleased {
                held_for_ms: released.held_for.as_millis() as u64,
            })
            .session(released.owner)
            .thread(&released.thread_id),
        );
    }
}
