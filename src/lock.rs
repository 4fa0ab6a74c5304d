// Credential refresh coordinator.
//
// Single-flight mutual exclusion per (provider, integration_id). Only
// one refresh may be in flight for a given integration, across every
// concurrent caller in the process. Release is tied to a drop guard, so
// it happens on success, error, panic and task cancellation alike; a
// crashed holder frees the lock immediately instead of stalling every
// booking request against that integration for the 90 s abandonment
// window.

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use futures::FutureExt;
use log::warn;

use crate::error::{SyncError, SyncResult};
use crate::models::Provider;

/// Age after which a held lock is considered abandoned and reclaimable.
/// Only reached when a holder leaks without its guard ever dropping,
/// e.g. a deadlocked task that never completes.
pub const LOCK_ABANDON_TIMEOUT: Duration = Duration::from_secs(90);

pub type LockKey = (Provider, i64);

#[derive(Debug)]
struct LockEntry {
    holder: String,
    acquired_at: Instant,
    ticket: u64,
}

#[derive(Debug)]
pub struct RefreshCoordinator {
    locks: Mutex<HashMap<LockKey, LockEntry>>,
    abandon_timeout: Duration,
    next_ticket: AtomicU64,
}

impl Default for RefreshCoordinator {
    fn default() -> Self {
        Self::new()
    }
}

impl RefreshCoordinator {
    pub fn new() -> Self {
        Self::with_timeout(LOCK_ABANDON_TIMEOUT)
    }

    pub fn with_timeout(abandon_timeout: Duration) -> Self {
        Self {
            locks: Mutex::new(HashMap::new()),
            abandon_timeout,
            next_ticket: AtomicU64::new(1),
        }
    }

    /// Try to take the lock for `key`. Granted when no lock is held or
    /// the held lock has aged past the abandonment timeout (the stale
    /// holder's bookkeeping is evicted first). Returns a ticket that
    /// must accompany the release.
    fn try_acquire(&self, key: LockKey, holder: &str) -> Option<u64> {
        let mut locks = lock_table(&self.locks);

        if let Some(entry) = locks.get(&key) {
            if entry.acquired_at.elapsed() < self.abandon_timeout {
                return None;
            }
            warn!(
                "Reclaiming abandoned refresh lock for {}/{} (held by '{}' for {:?})",
                key.0.as_str(),
                key.1,
                entry.holder,
                entry.acquired_at.elapsed()
            );
        }

        let ticket = self.next_ticket.fetch_add(1, Ordering::Relaxed);
        locks.insert(
            key,
            LockEntry {
                holder: holder.to_string(),
                acquired_at: Instant::now(),
                ticket,
            },
        );
        Some(ticket)
    }

    /// Release is ticket-checked: a stale holder whose lock was
    /// reclaimed must not free the successor's lock.
    fn release(&self, key: &LockKey, ticket: u64) {
        let mut locks = lock_table(&self.locks);
        if locks.get(key).map(|entry| entry.ticket) == Some(ticket) {
            locks.remove(key);
        }
    }

    /// Run `fut` as the exclusive refresh for `key`.
    ///
    /// A denied caller gets `SyncError::RefreshInProgress` without the
    /// critical section ever running; it should re-read persisted state
    /// shortly, since the other refresh is likely completing. Panics
    /// inside the critical section are caught here so the lock is still
    /// released and the failure surfaces as a hard error.
    pub async fn with_lock<T, F>(&self, key: LockKey, holder: &str, fut: F) -> SyncResult<T>
    where
        F: Future<Output = SyncResult<T>>,
    {
        let ticket = match self.try_acquire(key, holder) {
            Some(ticket) => ticket,
            None => return Err(SyncError::RefreshInProgress),
        };

        let _guard = LockGuard {
            coordinator: self,
            key,
            ticket,
        };

        match std::panic::AssertUnwindSafe(fut).catch_unwind().await {
            Ok(result) => result,
            Err(_) => Err(SyncError::permanent(format!(
                "refresh for {}/{} crashed",
                key.0.as_str(),
                key.1
            ))),
        }
    }

    // --- Test-only escape hatch; not part of the production contract ---

    #[cfg(test)]
    pub(crate) fn seed_lock(&self, key: LockKey, holder: &str, age: Duration) {
        let ticket = self.next_ticket.fetch_add(1, Ordering::Relaxed);
        lock_table(&self.locks).insert(
            key,
            LockEntry {
                holder: holder.to_string(),
                acquired_at: Instant::now().checked_sub(age).unwrap(),
                ticket,
            },
        );
    }

    #[cfg(test)]
    pub(crate) fn holder_of(&self, key: &LockKey) -> Option<String> {
        lock_table(&self.locks)
            .get(key)
            .map(|entry| entry.holder.clone())
    }

    #[cfg(test)]
    pub(crate) fn is_locked(&self, key: &LockKey) -> bool {
        lock_table(&self.locks).contains_key(key)
    }
}

fn lock_table<'a>(
    locks: &'a Mutex<HashMap<LockKey, LockEntry>>,
) -> std::sync::MutexGuard<'a, HashMap<LockKey, LockEntry>> {
    // A poisoned mutex means some other holder panicked between lock
    // and unlock; the table itself is still consistent.
    locks.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

struct LockGuard<'a> {
    coordinator: &'a RefreshCoordinator,
    key: LockKey,
    ticket: u64,
}

impl Drop for LockGuard<'_> {
    fn drop(&mut self) {
        self.coordinator.release(&self.key, self.ticket);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use tokio::time::sleep;

    const KEY: LockKey = (Provider::Google, 7);

    #[tokio::test]
    async fn test_with_lock_runs_critical_section() {
        let coordinator = RefreshCoordinator::new();
        let result = coordinator
            .with_lock(KEY, "test", async { Ok::<_, SyncError>(42) })
            .await;
        assert_eq!(result.unwrap(), 42);
        assert!(!coordinator.is_locked(&KEY));
    }

    #[tokio::test]
    async fn test_concurrent_caller_is_denied() {
        let coordinator = Arc::new(RefreshCoordinator::new());

        let holder = {
            let coordinator = coordinator.clone();
            tokio::spawn(async move {
                coordinator
                    .with_lock(KEY, "first", async {
                        sleep(Duration::from_millis(200)).await;
                        Ok::<_, SyncError>(())
                    })
                    .await
            })
        };

        // Give the first task time to take the lock.
        sleep(Duration::from_millis(50)).await;

        let second = coordinator
            .with_lock(KEY, "second", async { Ok::<_, SyncError>(()) })
            .await;
        assert!(matches!(second, Err(SyncError::RefreshInProgress)));

        holder.await.unwrap().unwrap();
        assert!(!coordinator.is_locked(&KEY));
    }

    #[tokio::test]
    async fn test_locks_are_independent_per_key() {
        let coordinator = RefreshCoordinator::new();
        coordinator.seed_lock(KEY, "other", Duration::from_secs(0));

        let other_key = (Provider::Google, 8);
        let result = coordinator
            .with_lock(other_key, "test", async { Ok::<_, SyncError>(()) })
            .await;
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn test_stale_lock_is_reclaimed() {
        let coordinator = RefreshCoordinator::new();
        coordinator.seed_lock(KEY, "dead-worker", Duration::from_secs(120));

        let result = coordinator
            .with_lock(KEY, "successor", async { Ok::<_, SyncError>(()) })
            .await;
        assert!(result.is_ok());
        assert!(!coordinator.is_locked(&KEY));
    }

    #[tokio::test]
    async fn test_fresh_lock_is_not_reclaimed() {
        let coordinator = RefreshCoordinator::new();
        coordinator.seed_lock(KEY, "live-worker", Duration::from_secs(10));

        let result = coordinator
            .with_lock(KEY, "impatient", async { Ok::<_, SyncError>(()) })
            .await;
        assert!(matches!(result, Err(SyncError::RefreshInProgress)));
        assert_eq!(coordinator.holder_of(&KEY).as_deref(), Some("live-worker"));
    }

    #[tokio::test]
    async fn test_lock_released_on_error() {
        let coordinator = RefreshCoordinator::new();
        let result: SyncResult<()> = coordinator
            .with_lock(KEY, "test", async {
                Err(SyncError::transient("network down"))
            })
            .await;
        assert!(result.is_err());
        assert!(!coordinator.is_locked(&KEY));
    }

    #[tokio::test]
    async fn test_lock_released_on_panic() {
        let coordinator = RefreshCoordinator::new();
        let result: SyncResult<()> = coordinator
            .with_lock(KEY, "test", async {
                panic!("boom");
            })
            .await;
        assert!(matches!(result, Err(SyncError::Permanent(_))));
        assert!(!coordinator.is_locked(&KEY));
    }

    #[tokio::test]
    async fn test_lock_released_when_holder_is_killed() {
        let coordinator = Arc::new(RefreshCoordinator::new());

        let holder = {
            let coordinator = coordinator.clone();
            tokio::spawn(async move {
                coordinator
                    .with_lock(KEY, "doomed", async {
                        sleep(Duration::from_secs(60)).await;
                        Ok::<_, SyncError>(())
                    })
                    .await
            })
        };

        sleep(Duration::from_millis(50)).await;
        assert!(coordinator.is_locked(&KEY));

        // Kill the holder; the dropped future must free the lock
        // promptly, not after the 90 s abandonment timeout.
        holder.abort();
        sleep(Duration::from_millis(50)).await;

        let result = coordinator
            .with_lock(KEY, "next", async { Ok::<_, SyncError>(()) })
            .await;
        assert!(result.is_ok());
    }
}
