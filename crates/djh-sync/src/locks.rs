use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex as StdMutex};

use tokio::sync::{Mutex, OwnedMutexGuard};

/// Async mutexes keyed by string, created on first use.
#[derive(Debug, Default)]
pub struct KeyedLocks {
    slots: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl KeyedLocks {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn lock(&self, key: &str) -> OwnedMutexGuard<()> {
        let slot = {
            let mut slots = self.slots.lock().await;
            // Slots nobody holds or waits on are dropped.
            slots.retain(|_, slot| Arc::strong_count(slot) > 1);
            slots
                .entry(key.to_string())
                .or_insert_with(|| Arc::new(Mutex::new(())))
                .clone()
        };
        slot.lock_owned().await
    }
}

/// Set of sources with a job in flight.
#[derive(Debug, Clone, Default)]
pub struct InFlight {
    sources: Arc<StdMutex<HashSet<String>>>,
}

impl InFlight {
    pub fn new() -> Self {
        Self::default()
    }

    /// `None` when the source is already claimed.
    pub fn claim(&self, source_id: &str) -> Option<InFlightGuard> {
        let mut sources = self.sources.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        if !sources.insert(source_id.to_string()) {
            return None;
        }
        Some(InFlightGuard {
            sources: Arc::clone(&self.sources),
            source_id: source_id.to_string(),
        })
    }
}

#[derive(Debug)]
pub struct InFlightGuard {
    sources: Arc<StdMutex<HashSet<String>>>,
    source_id: String,
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.sources
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .remove(&self.source_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn claim_is_exclusive_until_the_guard_drops() {
        let in_flight = InFlight::new();
        let guard = in_flight.claim("agency").expect("first claim");
        assert!(in_flight.claim("agency").is_none());
        assert!(in_flight.claim("other").is_some());

        drop(guard);
        assert!(in_flight.claim("agency").is_some());
    }

    #[tokio::test]
    async fn same_key_is_serialized_and_idle_slots_are_pruned() {
        let locks = Arc::new(KeyedLocks::new());
        let held = locks.lock("r1").await;

        let contender = {
            let locks = Arc::clone(&locks);
            tokio::spawn(async move {
                let _guard = locks.lock("r1").await;
            })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!contender.is_finished());

        drop(held);
        contender.await.expect("contender");

        let _other = locks.lock("r2").await;
        assert_eq!(locks.slots.lock().await.len(), 1);
    }
}
