//! Per-entity lock table.
//!
//! Each entity key maps to its own async mutex, created on first use. Calls
//! for the same key run one at a time in grant order; distinct keys never
//! contend. Idle slots are evicted by [`LockTable::sweep_idle`].

use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::Mutex;
use tokio::time::Instant;

/// The bounded wait for an entity's lock elapsed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockTimeout {
    pub entity: String,
    pub waited: Duration,
}

struct Slot {
    mutex: Mutex<()>,
    /// Milliseconds since the table's epoch at last release.
    last_used_ms: AtomicU64,
}

pub struct LockTable {
    slots: DashMap<String, Arc<Slot>>,
    epoch: Instant,
}

impl Default for LockTable {
    fn default() -> Self {
        Self::new()
    }
}

impl LockTable {
    pub fn new() -> Self {
        Self {
            slots: DashMap::new(),
            epoch: Instant::now(),
        }
    }

    /// Run `f` while holding `entity`'s lock.
    ///
    /// Waits at most `timeout` for the lock. The lock is released when `f`
    /// completes, panics, or the returned future is dropped.
    pub async fn with_entity_lock<F, Fut, T>(
        &self,
        entity: &str,
        timeout: Duration,
        f: F,
    ) -> Result<T, LockTimeout>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = T>,
    {
        let slot = self.slot(entity);

        let guard = match tokio::time::timeout(timeout, slot.mutex.lock()).await {
            Ok(guard) => guard,
            Err(_) => {
                self.touch(&slot);
                return Err(LockTimeout {
                    entity: entity.to_string(),
                    waited: timeout,
                });
            }
        };

        let out = f().await;
        drop(guard);
        self.touch(&slot);
        Ok(out)
    }

    /// Evict slots idle for at least `max_idle` that nobody holds or awaits.
    pub fn sweep_idle(&self, max_idle: Duration) -> usize {
        let now = self.elapsed_ms();
        let max_idle_ms = max_idle.as_millis() as u64;
        let before = self.slots.len();

        // `retain` holds each shard's write lock, so no caller can clone a
        // slot out of the map while its reference count is inspected.
        self.slots.retain(|_, slot| {
            let in_use = Arc::strong_count(slot) > 1;
            let idle = now.saturating_sub(slot.last_used_ms.load(Ordering::Relaxed));
            in_use || idle < max_idle_ms
        });

        let evicted = before.saturating_sub(self.slots.len());
        if evicted > 0 {
            tracing::debug!(evicted, live = self.slots.len(), "evicted idle entity locks");
        }
        evicted
    }

    /// Number of live slots.
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    fn slot(&self, entity: &str) -> Arc<Slot> {
        if let Some(slot) = self.slots.get(entity) {
            return Arc::clone(slot.value());
        }
        let now = self.elapsed_ms();
        self.slots
            .entry(entity.to_string())
            .or_insert_with(|| {
                Arc::new(Slot {
                    mutex: Mutex::new(()),
                    last_used_ms: AtomicU64::new(now),
                })
            })
            .value()
            .clone()
    }

    fn touch(&self, slot: &Slot) {
        slot.last_used_ms.store(self.elapsed_ms(), Ordering::Relaxed);
    }

    fn elapsed_ms(&self) -> u64 {
        self.epoch.elapsed().as_millis() as u64
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[tokio::test]
    async fn test_same_key_is_serialized() {
        let table = Arc::new(LockTable::new());
        let active = Arc::new(AtomicUsize::new(0));
        let max_seen = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..16 {
            let (table, active, max_seen) = (table.clone(), active.clone(), max_seen.clone());
            handles.push(tokio::spawn(async move {
                table
                    .with_entity_lock("hot", Duration::from_secs(5), || async {
                        let now = active.fetch_add(1, Ordering::SeqCst) + 1;
                        max_seen.fetch_max(now, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(2)).await;
                        active.fetch_sub(1, Ordering::SeqCst);
                    })
                    .await
                    .unwrap();
            }));
        }
        for h in handles {
            h.await.unwrap();
        }
        assert_eq!(max_seen.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_timeout_while_held() {
        let table = Arc::new(LockTable::new());
        let (tx, rx) = tokio::sync::oneshot::channel::<()>();

        let holder = {
            let table = table.clone();
            tokio::spawn(async move {
                table
                    .with_entity_lock("k", Duration::from_secs(1), || async {
                        let _ = rx.await;
                    })
                    .await
            })
        };
        tokio::task::yield_now().await;
        tokio::time::sleep(Duration::from_millis(10)).await;

        let err = table
            .with_entity_lock("k", Duration::from_millis(20), || async {})
            .await
            .unwrap_err();
        assert_eq!(err.entity, "k");

        // A different key is unaffected.
        assert!(table
            .with_entity_lock("other", Duration::from_millis(20), || async {})
            .await
            .is_ok());

        tx.send(()).unwrap();
        holder.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_released_after_error_and_panic() {
        let table = Arc::new(LockTable::new());

        let r: Result<Result<(), &str>, _> = table
            .with_entity_lock("k", Duration::from_millis(50), || async { Err("boom") })
            .await;
        assert!(r.unwrap().is_err());

        let t = table.clone();
        let panicked = tokio::spawn(async move {
            t.with_entity_lock("k", Duration::from_millis(50), || async {
                panic!("inside lock");
            })
            .await
        })
        .await;
        assert!(panicked.is_err());

        assert!(table
            .with_entity_lock("k", Duration::from_millis(50), || async {})
            .await
            .is_ok());
    }

    #[tokio::test]
    async fn test_sweep_keeps_held_slots() {
        let table = Arc::new(LockTable::new());
        table
            .with_entity_lock("idle", Duration::from_millis(50), || async {})
            .await
            .unwrap();

        let (tx, rx) = tokio::sync::oneshot::channel::<()>();
        let holder = {
            let table = table.clone();
            tokio::spawn(async move {
                table
                    .with_entity_lock("held", Duration::from_secs(1), || async {
                        let _ = rx.await;
                    })
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(table.len(), 2);

        assert_eq!(table.sweep_idle(Duration::ZERO), 1);
        assert_eq!(table.len(), 1);

        tx.send(()).unwrap();
        holder.await.unwrap().unwrap();
        assert_eq!(table.sweep_idle(Duration::ZERO), 1);
        assert!(table.is_empty());
    }
}
