//! Shared counting backend used to reconcile windows across limiter instances.

use crate::error::LimiterResult;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::time::{Duration, Instant};

/// Central datastore holding one atomic counter per `(key, window start)`.
///
/// `start` is the window's left boundary in Unix nanoseconds, so every
/// instance using the same window size addresses the same counter.
pub trait Datastore: Send + Sync {
    /// Adds `delta` to the count of the window represented by `start` and
    /// returns the new total.
    fn add(&self, key: &str, start: i64, delta: i64) -> LimiterResult<i64>;

    /// Returns the count of the window represented by `start`.
    fn get(&self, key: &str, start: i64) -> LimiterResult<i64>;

    /// Checks that the datastore is reachable.
    fn ping(&self) -> LimiterResult<()> {
        Ok(())
    }
}

/// Builds the storage key for one window's counter.
pub fn full_key(key: &str, start: i64) -> String {
    format!("{}@{}", key, start)
}

struct Entry {
    count: i64,
    expires_at: Option<Instant>,
}

impl Entry {
    fn is_expired(&self, now: Instant) -> bool {
        self.expires_at.is_some_and(|at| now >= at)
    }
}

/// In-process datastore, shared between limiters living in one process.
#[derive(Default)]
pub struct MemoryDatastore {
    data: RwLock<HashMap<String, Entry>>,
    ttl: Option<Duration>,
}

impl MemoryDatastore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Entries untouched for longer than `ttl` read as zero and are purged.
    pub fn with_ttl(ttl: Duration) -> Self {
        Self {
            data: RwLock::new(HashMap::new()),
            ttl: Some(ttl),
        }
    }

    /// Number of live counters.
    pub fn len(&self) -> usize {
        let now = Instant::now();
        self.data
            .read()
            .values()
            .filter(|entry| !entry.is_expired(now))
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Datastore for MemoryDatastore {
    fn add(&self, key: &str, start: i64, delta: i64) -> LimiterResult<i64> {
        let now = Instant::now();
        let mut data = self.data.write();
        data.retain(|_, entry| !entry.is_expired(now));

        let entry = data.entry(full_key(key, start)).or_insert(Entry {
            count: 0,
            expires_at: None,
        });
        entry.count += delta;
        entry.expires_at = self.ttl.map(|ttl| now + ttl);

        Ok(entry.count)
    }

    fn get(&self, key: &str, start: i64) -> LimiterResult<i64> {
        let now = Instant::now();
        let data = self.data.read();

        Ok(data
            .get(&full_key(key, start))
            .filter(|entry| !entry.is_expired(now))
            .map(|entry| entry.count)
            .unwrap_or(0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn test_full_key() {
        assert_eq!(full_key("test", 1_000_000_000), "test@1000000000");
    }

    #[test]
    fn test_add_and_get() {
        let store = MemoryDatastore::new();
        assert_eq!(store.get("test", 0).unwrap(), 0);

        assert_eq!(store.add("test", 0, 3).unwrap(), 3);
        assert_eq!(store.add("test", 0, 2).unwrap(), 5);
        assert_eq!(store.get("test", 0).unwrap(), 5);

        // Different windows and keys are independent counters
        assert_eq!(store.get("test", 1).unwrap(), 0);
        assert_eq!(store.get("other", 0).unwrap(), 0);
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn test_ttl_expiry() {
        let store = MemoryDatastore::with_ttl(Duration::from_millis(20));
        store.add("test", 0, 4).unwrap();
        assert_eq!(store.get("test", 0).unwrap(), 4);

        thread::sleep(Duration::from_millis(40));
        assert_eq!(store.get("test", 0).unwrap(), 0);
        assert!(store.is_empty());

        // An expired counter starts over
        assert_eq!(store.add("test", 0, 1).unwrap(), 1);
    }

    #[test]
    fn test_concurrent_adds_are_atomic() {
        let store = std::sync::Arc::new(MemoryDatastore::new());
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let store = store.clone();
                thread::spawn(move || {
                    for _ in 0..250 {
                        store.add("test", 0, 1).unwrap();
                    }
                })
            })
            .collect();

        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(store.get("test", 0).unwrap(), 1000);
    }
}
