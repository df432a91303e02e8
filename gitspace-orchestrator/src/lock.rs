//! Per-gitspace mutual exclusion.
//!
//! Every state transition of a gitspace runs under its lock. Acquisition
//! waits up to the configured timeout and then fails with `Conflict` instead
//! of queueing indefinitely.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};
use tracing::debug;

use crate::error::{OrchestratorError, Result};

/// Held for the duration of one operation on a gitspace.
pub struct LockGuard {
    identifier: String,
    _guard: OwnedMutexGuard<()>,
}

impl LockGuard {
    pub fn identifier(&self) -> &str {
        &self.identifier
    }
}

impl std::fmt::Debug for LockGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LockGuard")
            .field("identifier", &self.identifier)
            .finish()
    }
}

pub struct LockManager {
    locks: Mutex<HashMap<String, Arc<AsyncMutex<()>>>>,
    timeout: Duration,
}

impl LockManager {
    pub fn new(timeout: Duration) -> Self {
        Self {
            locks: Mutex::new(HashMap::new()),
            timeout,
        }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    fn entry(&self, identifier: &str) -> Arc<AsyncMutex<()>> {
        let mut locks = self.locks.lock().unwrap_or_else(|p| p.into_inner());
        // Entries only the map references have no holder and no waiter.
        locks.retain(|_, lock| Arc::strong_count(lock) > 1);
        locks
            .entry(identifier.to_string())
            .or_insert_with(|| Arc::new(AsyncMutex::new(())))
            .clone()
    }

    pub async fn acquire(&self, identifier: &str) -> Result<LockGuard> {
        self.acquire_within(identifier, self.timeout).await
    }

    pub async fn acquire_within(&self, identifier: &str, timeout: Duration) -> Result<LockGuard> {
        let lock = self.entry(identifier);
        match tokio::time::timeout(timeout, lock.lock_owned()).await {
            Ok(guard) => {
                debug!("Acquired lock for {}", identifier);
                Ok(LockGuard {
                    identifier: identifier.to_string(),
                    _guard: guard,
                })
            }
            Err(_) => Err(OrchestratorError::Conflict(format!(
                "another operation on {} is in progress",
                identifier
            ))),
        }
    }

    pub fn is_locked(&self, identifier: &str) -> bool {
        let locks = self.locks.lock().unwrap_or_else(|p| p.into_inner());
        locks
            .get(identifier)
            .map(|lock| lock.try_lock().is_err())
            .unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use gitspace_core::ErrorKind;

    #[tokio::test]
    async fn test_second_acquire_times_out_with_conflict() {
        let locks = LockManager::new(Duration::from_millis(50));
        let _held = locks.acquire("c1").await.unwrap();

        let err = locks.acquire("c1").await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Conflict);
        assert!(locks.is_locked("c1"));
    }

    #[tokio::test]
    async fn test_identifiers_are_independent() {
        let locks = LockManager::new(Duration::from_millis(50));
        let _c1 = locks.acquire("c1").await.unwrap();
        let c2 = locks.acquire("c2").await.unwrap();
        assert_eq!(c2.identifier(), "c2");
    }

    #[tokio::test]
    async fn test_waiter_gets_lock_after_release() {
        let locks = Arc::new(LockManager::new(Duration::from_secs(2)));
        let held = locks.acquire("c1").await.unwrap();

        let waiter = {
            let locks = locks.clone();
            tokio::spawn(async move { locks.acquire("c1").await.map(|_| ()) })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        drop(held);

        waiter.await.unwrap().unwrap();
        assert!(!locks.is_locked("c1"));
    }
}
