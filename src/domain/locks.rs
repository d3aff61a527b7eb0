use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::{Mutex, OwnedMutexGuard};

type Slots = DashMap<String, Arc<Mutex<()>>>;

/// One async mutex per key, created on first use and dropped with its last user.
#[derive(Debug, Default)]
pub struct KeyedLocks {
    locks: Slots,
}

/// Holds a key until dropped.
pub struct KeyGuard<'a> {
    guard: Option<OwnedMutexGuard<()>>,
    key: String,
    locks: &'a Slots,
}

impl Drop for KeyGuard<'_> {
    fn drop(&mut self) {
        drop(self.guard.take());
        // Waiters hold their own clone of the slot, so it only goes when nobody wants it.
        self.locks
            .remove_if(&self.key, |_, slot| Arc::strong_count(slot) == 1);
    }
}

impl KeyedLocks {
    pub fn new() -> Self {
        Self::default()
    }

    fn slot(&self, key: &str) -> Arc<Mutex<()>> {
        // Clone out of the map so no shard lock is held while awaiting.
        Arc::clone(
            self.locks
                .entry(key.to_string())
                .or_insert_with(|| Arc::new(Mutex::new(())))
                .value(),
        )
    }

    fn guard(&self, key: &str, guard: Option<OwnedMutexGuard<()>>) -> KeyGuard<'_> {
        KeyGuard {
            guard,
            key: key.to_string(),
            locks: &self.locks,
        }
    }

    pub async fn lock(&self, key: &str) -> KeyGuard<'_> {
        let guard = self.slot(key).lock_owned().await;
        self.guard(key, Some(guard))
    }

    /// `None` when another holder already owns `key`.
    pub fn try_lock(&self, key: &str) -> Option<KeyGuard<'_>> {
        match self.slot(key).try_lock_owned() {
            Ok(guard) => Some(self.guard(key, Some(guard))),
            Err(_) => {
                // Drops the slot again if it was created just now.
                drop(self.guard(key, None));
                None
            }
        }
    }

    pub fn is_locked(&self, key: &str) -> bool {
        self.locks
            .get(key)
            .is_some_and(|slot| slot.try_lock().is_err())
    }

    pub fn len(&self) -> usize {
        self.locks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.locks.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn keys_are_independent() {
        let locks = KeyedLocks::new();
        let a = locks.try_lock("a").expect("a is free");
        assert!(locks.try_lock("a").is_none());
        assert!(locks.try_lock("b").is_some());
        drop(a);
        assert!(locks.try_lock("a").is_some());
    }

    #[tokio::test]
    async fn released_keys_leave_no_slot_behind() {
        let locks = KeyedLocks::new();
        for i in 0..100 {
            let _guard = locks.lock(&format!("key{i}")).await;
        }
        assert_eq!(locks.len(), 0);

        let held = locks.try_lock("busy").expect("busy is free");
        assert!(locks.is_locked("busy"));
        assert!(locks.try_lock("busy").is_none());
        assert_eq!(locks.len(), 1);
        drop(held);
        assert!(!locks.is_locked("busy"));
        assert_eq!(locks.len(), 0);
    }

    #[tokio::test]
    async fn slot_survives_while_someone_waits() {
        let locks = Arc::new(KeyedLocks::new());
        let guard = locks.lock("k").await;
        let waiter = {
            let locks = Arc::clone(&locks);
            tokio::spawn(async move {
                let _guard = locks.lock("k").await;
                locks.is_locked("k")
            })
        };
        tokio::task::yield_now().await;
        drop(guard);
        assert!(waiter.await.unwrap());
        assert_eq!(locks.len(), 0);
    }

    #[tokio::test]
    async fn lock_waits_for_release() {
        let locks = Arc::new(KeyedLocks::new());
        let guard = locks.lock("k").await;
        let waiter = {
            let locks = Arc::clone(&locks);
            tokio::spawn(async move {
                let _guard = locks.lock("k").await;
            })
        };
        tokio::task::yield_now().await;
        assert!(!waiter.is_finished());
        drop(guard);
        waiter.await.unwrap();
    }
}
