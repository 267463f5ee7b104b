//! Per-thread single-writer lock.
//!
//! A thread with no entry is unlocked. Acquisition either takes the vacant
//! entry or fails fast; there is no waiting and no queue. Entries are removed
//! on release, and a release only succeeds for the token that owns the entry,
//! so a late release from an expired session cannot clobber its successor.

use crate::error::LockBusy;
use crate::types::{SessionToken, ThreadId};
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use serde::Serialize;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;

/// Sent to the watchdog for every successful acquisition.
#[derive(Debug, Clone)]
pub struct LeaseNotice {
    pub thread_id: ThreadId,
    pub token: SessionToken,
    pub acquired_at: Instant,
}

pub type LeaseReceiver = mpsc::UnboundedReceiver<LeaseNotice>;

#[derive(Debug, Clone)]
struct LockEntry {
    owner: SessionToken,
    acquired_at: Instant,
}

#[derive(Debug, Clone, Serialize)]
pub struct HeldLock {
    pub thread_id: ThreadId,
    pub owner: SessionToken,
    pub held_for_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReleasedLock {
    pub thread_id: ThreadId,
    pub owner: SessionToken,
    pub held_for: Duration,
}

#[derive(Default)]
pub struct ThreadLock {
    entries: DashMap<ThreadId, LockEntry>,
    leases: Option<mpsc::UnboundedSender<LeaseNotice>>,
}

impl ThreadLock {
    pub fn new() -> Self {
        Self::default()
    }

    /// A lock whose acquisitions are reported on the returned receiver.
    pub fn watched() -> (Self, LeaseReceiver) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Self {
                entries: DashMap::new(),
                leases: Some(tx),
            },
            rx,
        )
    }

    pub fn try_acquire(&self, thread_id: &ThreadId) -> Result<SessionToken, LockBusy> {
        let now = Instant::now();
        let token = match self.entries.entry(thread_id.clone()) {
            Entry::Occupied(held) => {
                return Err(LockBusy {
                    held_for: now.saturating_duration_since(held.get().acquired_at),
                });
            }
            Entry::Vacant(vacant) => {
                let token = SessionToken::new();
                vacant.insert(LockEntry {
                    owner: token,
                    acquired_at: now,
                });
                token
            }
        };

        if let Some(leases) = self.leases.as_ref() {
            let notice = LeaseNotice {
                thread_id: thread_id.clone(),
                token,
                acquired_at: now,
            };
            if leases.send(notice).is_err() {
                tracing::debug!(thread_id = %thread_id, "lock watchdog gone; lease not tracked");
            }
        }
        Ok(token)
    }

    /// Clears the owner if `token` matches it. Returns whether it did.
    pub fn release(&self, thread_id: &ThreadId, token: SessionToken) -> bool {
        let released = self
            .entries
            .remove_if(thread_id, |_, entry| entry.owner == token)
            .is_some();
        if !released {
            tracing::debug!(
                thread_id = %thread_id,
                token = %token,
                "ignoring release from a session that no longer owns the thread"
            );
        }
        released
    }

    /// Administrative release regardless of owner.
    pub fn force_release(&self, thread_id: &ThreadId) -> Option<ReleasedLock> {
        let (_, entry) = self.entries.remove(thread_id)?;
        let held_for = entry.acquired_at.elapsed();
        tracing::warn!(
            thread_id = %thread_id,
            owner = %entry.owner,
            held_for_ms = held_for.as_millis() as u64,
            "thread lock force-released"
        );
        Some(ReleasedLock {
            thread_id: thread_id.clone(),
            owner: entry.owner,
            held_for,
        })
    }

    /// Watchdog path: releases only if `token` still owns the thread and has
    /// held it for at least `staleness`.
    pub fn expire(
        &self,
        thread_id: &ThreadId,
        token: SessionToken,
        staleness: Duration,
    ) -> Option<ReleasedLock> {
        let now = Instant::now();
        let (_, entry) = self.entries.remove_if(thread_id, |_, entry| {
            entry.owner == token && now.saturating_duration_since(entry.acquired_at) >= staleness
        })?;
        let held_for = now.saturating_duration_since(entry.acquired_at);
        tracing::warn!(
            thread_id = %thread_id,
            owner = %entry.owner,
            held_for_ms = held_for.as_millis() as u64,
            staleness_ms = staleness.as_millis() as u64,
            "stale thread lock force-released"
        );
        Some(ReleasedLock {
            thread_id: thread_id.clone(),
            owner: entry.owner,
            held_for,
        })
    }

    pub fn owner(&self, thread_id: &ThreadId) -> Option<SessionToken> {
        self.entries.get(thread_id).map(|entry| entry.owner)
    }

    pub fn is_locked(&self, thread_id: &ThreadId) -> bool {
        self.entries.contains_key(thread_id)
    }

    pub fn held(&self) -> Vec<HeldLock> {
        let now = Instant::now();
        let mut out: Vec<HeldLock> = self
            .entries
            .iter()
            .map(|entry| HeldLock {
                thread_id: entry.key().clone(),
                owner: entry.value().owner,
                held_for_ms: now
                    .saturating_duration_since(entry.value().acquired_at)
                    .as_millis() as u64,
            })
            .collect();
        out.sort_by(|a, b| b.held_for_ms.cmp(&a.held_for_ms));
        out
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Barrier};

    fn thread() -> ThreadId {
        ThreadId::new("T1")
    }

    #[test]
    fn second_acquire_is_busy() {
        let locks = ThreadLock::new();
        let token = locks.try_acquire(&thread()).expect("first acquire");
        assert!(locks.try_acquire(&thread()).is_err());
        assert_eq!(locks.owner(&thread()), Some(token));
    }

    #[test]
    fn release_frees_the_thread() {
        let locks = ThreadLock::new();
        let token = locks.try_acquire(&thread()).expect("acquire");
        assert!(locks.release(&thread(), token));
        assert!(!locks.is_locked(&thread()));
        assert!(locks.try_acquire(&thread()).is_ok());
    }

    #[test]
    fn stale_release_does_not_clobber_new_owner() {
        let locks = ThreadLock::new();
        let old = locks.try_acquire(&thread()).expect("acquire");
        locks.force_release(&thread()).expect("was held");
        let new = locks.try_acquire(&thread()).expect("re-acquire");

        assert!(!locks.release(&thread(), old));
        assert_eq!(locks.owner(&thread()), Some(new));
        assert!(!locks.release(&thread(), old));
        assert_eq!(locks.owner(&thread()), Some(new));
    }

    #[test]
    fn threads_are_independent() {
        let locks = ThreadLock::new();
        locks.try_acquire(&thread()).expect("T1");
        locks
            .try_acquire(&ThreadId::new("T2"))
            .expect("T2 unaffected by T1");
        assert_eq!(locks.len(), 2);
    }

    #[test]
    fn concurrent_acquires_yield_one_owner() {
        let locks = Arc::new(ThreadLock::new());
        let workers = 16;
        let barrier = Arc::new(Barrier::new(workers));
        let handles: Vec<_> = (0..workers)
            .map(|_| {
                let locks = locks.clone();
                let barrier = barrier.clone();
                std::thread::spawn(move || {
                    barrier.wait();
                    locks.try_acquire(&thread()).ok()
                })
            })
            .collect();
        let winners: Vec<SessionToken> = handles
            .into_iter()
            .filter_map(|h| h.join().expect("worker panicked"))
            .collect();
        assert_eq!(winners.len(), 1);
        assert_eq!(locks.owner(&thread()), Some(winners[0]));
    }

    #[test]
    fn expire_requires_matching_token_and_age() {
        let locks = ThreadLock::new();
        let token = locks.try_acquire(&thread()).expect("acquire");
        assert!(
            locks
                .expire(&thread(), token, Duration::from_secs(3600))
                .is_none()
        );
        assert!(
            locks
                .expire(&thread(), SessionToken::new(), Duration::ZERO)
                .is_none()
        );
        let released = locks
            .expire(&thread(), token, Duration::ZERO)
            .expect("expired");
        assert_eq!(released.owner, token);
        assert!(!locks.is_locked(&thread()));
    }

    #[tokio::test]
    async fn watched_lock_reports_leases() {
        let (locks, mut leases) = ThreadLock::watched();
        let token = locks.try_acquire(&thread()).expect("acquire");
        let notice = leases.recv().await.expect("lease notice");
        assert_eq!(notice.thread_id, thread());
        assert_eq!(notice.token, token);
        assert!(locks.try_acquire(&thread()).is_err());
        assert!(leases.try_recv().is_err());
    }
}
