//! # Active Session Registry
//!
//! Tracks which relay sessions are alive so the health endpoints can report
//! load and shutdown can wait for sessions to drain.
//!
//! ## Retirement by lease:
//! `register` hands out a `SessionLease`. The client actor and the upstream
//! writer task each hold an `Arc` of it; when the last clone is dropped both
//! legs of the session are finished and the session is retired. A session is
//! therefore removed exactly once, however its two sockets end.

use crate::relay::session::SessionId;
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;
use tokio::sync::watch;
use tracing::debug;

/// Shared handle to the process-wide registry. Cloning is cheap (one `Arc`).
#[derive(Debug, Clone)]
pub struct SessionRegistry {
    inner: Arc<RegistryInner>,
}

#[derive(Debug)]
struct RegistryInner {
    next_id: AtomicU64,
    total: AtomicU64,
    active: RwLock<HashSet<SessionId>>,
    accepting: AtomicBool,
    /// Publishes the active count after every change, for `wait_drained`
    active_tx: watch::Sender<usize>,
}

/// Point-in-time view of the registry. May be stale by the time it is read.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegistrySnapshot {
    pub active: usize,
    pub total: u64,
    pub accepting: bool,
}

/// Result of waiting for active sessions during shutdown.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DrainOutcome {
    Drained,
    TimedOut { remaining: usize },
}

/// Keeps a session registered for as long as it is alive.
#[derive(Debug)]
pub struct SessionLease {
    id: SessionId,
    registry: SessionRegistry,
}

impl SessionLease {
    pub fn id(&self) -> SessionId {
        self.id
    }
}

impl Drop for SessionLease {
    fn drop(&mut self) {
        self.registry.retire(self.id);
    }
}

impl Default for SessionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionRegistry {
    pub fn new() -> Self {
        let (active_tx, _) = watch::channel(0);
        Self {
            inner: Arc::new(RegistryInner {
                next_id: AtomicU64::new(1),
                total: AtomicU64::new(0),
                active: RwLock::new(HashSet::new()),
                accepting: AtomicBool::new(true),
                active_tx,
            }),
        }
    }

    /// Register a new session, or `None` once draining has begun.
    pub fn register(&self) -> Option<SessionLease> {
        if !self.is_accepting() {
            return None;
        }

        let id = SessionId(self.inner.next_id.fetch_add(1, Ordering::SeqCst));
        let active = {
            let mut sessions = self.inner.active.write().unwrap_or_else(PoisonError::into_inner);
            sessions.insert(id);
            sessions.len()
        };
        self.inner.total.fetch_add(1, Ordering::Relaxed);
        self.inner.active_tx.send_replace(active);
        debug!(session_id = %id, active, "Session registered");

        Some(SessionLease {
            id,
            registry: self.clone(),
        })
    }

    /// Remove `id`; returns false if it was not (or no longer) registered.
    fn retire(&self, id: SessionId) -> bool {
        let (removed, active) = {
            let mut sessions = self.inner.active.write().unwrap_or_else(PoisonError::into_inner);
            let removed = sessions.remove(&id);
            (removed, sessions.len())
        };
        if removed {
            self.inner.active_tx.send_replace(active);
            debug!(session_id = %id, active, "Session retired");
        }
        removed
    }

    pub fn active_count(&self) -> usize {
        self.inner.active.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    #[cfg(test)]
    pub fn is_active(&self, id: SessionId) -> bool {
        self.inner
            .active
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains(&id)
    }

    pub fn is_accepting(&self) -> bool {
        self.inner.accepting.load(Ordering::SeqCst)
    }

    pub fn snapshot(&self) -> RegistrySnapshot {
        RegistrySnapshot {
            active: self.active_count(),
            total: self.inner.total.load(Ordering::Relaxed),
            accepting: self.is_accepting(),
        }
    }

    /// Stop handing out new leases. Existing sessions are unaffected.
    pub fn begin_drain(&self) {
        self.inner.accepting.store(false, Ordering::SeqCst);
    }

    /// Wait until no session is active, or give up after `timeout`.
    pub async fn wait_drained(&self, timeout: Duration) -> DrainOutcome {
        let mut rx = self.inner.active_tx.subscribe();
        let drained = tokio::time::timeout(timeout, rx.wait_for(|active| *active == 0))
            .await
            .is_ok();
        if drained {
            DrainOutcome::Drained
        } else {
            DrainOutcome::TimedOut {
                remaining: self.active_count(),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ids_are_monotonic() {
        let registry = SessionRegistry::new();
        let a = registry.register().unwrap();
        let b = registry.register().unwrap();
        assert!(b.id() > a.id());
        assert_eq!(registry.snapshot().active, 2);
        assert_eq!(registry.snapshot().total, 2);
    }

    #[test]
    fn test_lease_retires_once_when_last_clone_drops() {
        let registry = SessionRegistry::new();
        let lease = Arc::new(registry.register().unwrap());
        let id = lease.id();
        let writer_side = Arc::clone(&lease);

        drop(lease);
        assert!(registry.is_active(id));
        assert_eq!(registry.active_count(), 1);

        drop(writer_side);
        assert!(!registry.is_active(id));
        assert_eq!(registry.active_count(), 0);
        // A stray second retirement is a no-op
        assert!(!registry.retire(id));
        assert_eq!(registry.active_count(), 0);
    }

    #[test]
    fn test_count_returns_to_baseline_for_any_interleaving() {
        let registry = SessionRegistry::new();
        let baseline = registry.active_count();

        let leases: Vec<_> = (0..10).map(|_| Arc::new(registry.register().unwrap())).collect();
        let mut halves: Vec<_> = leases.iter().map(Arc::clone).collect();
        // Drop client sides in order, upstream sides in reverse
        drop(leases);
        assert_eq!(registry.active_count(), 10);
        while let Some(half) = halves.pop() {
            drop(half);
        }
        assert_eq!(registry.active_count(), baseline);
        assert_eq!(registry.snapshot().total, 10);
    }

    #[test]
    fn test_draining_rejects_new_sessions() {
        let registry = SessionRegistry::new();
        let _lease = registry.register().unwrap();
        registry.begin_drain();
        assert!(registry.register().is_none());
        let snapshot = registry.snapshot();
        assert!(!snapshot.accepting);
        assert_eq!(snapshot.active, 1);
    }

    #[tokio::test]
    async fn test_wait_drained_completes_when_sessions_end() {
        let registry = SessionRegistry::new();
        let lease = registry.register().unwrap();
        registry.begin_drain();

        let waiter = {
            let registry = registry.clone();
            tokio::spawn(async move { registry.wait_drained(Duration::from_secs(5)).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        drop(lease);

        assert_eq!(waiter.await.unwrap(), DrainOutcome::Drained);
    }

    #[tokio::test]
    async fn test_wait_drained_reports_timeout() {
        let registry = SessionRegistry::new();
        let _lease = registry.register().unwrap();
        let outcome = registry.wait_drained(Duration::from_millis(50)).await;
        assert_eq!(outcome, DrainOutcome::TimedOut { remaining: 1 });
    }

    #[tokio::test]
    async fn test_wait_drained_immediate_when_idle() {
        let registry = SessionRegistry::new();
        let outcome = registry.wait_drained(Duration::from_millis(10)).await;
        assert_eq!(outcome, DrainOutcome::Drained);
    }
}
