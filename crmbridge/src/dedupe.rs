//! Idempotency tracking for upstream event ids.
//!
//! Upstream providers redeliver on any non-2xx (and sometimes on slow 2xx),
//! so the same event id can arrive more than once, including concurrently.
//! The store answers "has this id been handled" with an atomic insert-if-
//! absent: exactly one caller wins the mark, everyone else observes a
//! duplicate. Entries expire after the configured TTL.

use std::time::Duration;

use moka::future::Cache;

/// TTL cache of processed event ids.
#[derive(Debug, Clone)]
pub struct IdempotencyStore {
    cache: Cache<String, ()>,
}

impl IdempotencyStore {
    pub fn new(ttl: Duration, max_entries: u64) -> Self {
        Self {
            cache: Cache::builder().time_to_live(ttl).max_capacity(max_entries).build(),
        }
    }

    /// Atomically mark an event id as processed.
    ///
    /// Returns `true` if this caller inserted the mark, `false` if the id was
    /// already present. Taken immediately before the first downstream write
    /// (or window append) so two concurrent deliveries of the same id cannot
    /// both apply.
    pub async fn mark_processed(&self, event_id: &str) -> bool {
        self.cache.entry(event_id.to_string()).or_insert(()).await.is_fresh()
    }

    /// Whether an event id has already been marked, without marking it.
    pub async fn has_processed(&self, event_id: &str) -> bool {
        self.cache.get(event_id).await.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> IdempotencyStore {
        IdempotencyStore::new(Duration::from_secs(7 * 24 * 3600), 10_000)
    }

    #[tokio::test]
    async fn first_mark_wins_second_is_noop() {
        let store = store();

        assert!(store.mark_processed("evt_1").await);
        assert!(!store.mark_processed("evt_1").await);
        assert!(store.has_processed("evt_1").await);
    }

    #[tokio::test]
    async fn distinct_ids_do_not_interfere() {
        let store = store();

        assert!(store.mark_processed("evt_1").await);
        assert!(!store.has_processed("evt_2").await);
        assert!(store.mark_processed("evt_2").await);
    }

    #[tokio::test]
    async fn concurrent_marks_admit_exactly_one_winner() {
        let store = store();

        let mut handles = Vec::new();
        for _ in 0..16 {
            let store = store.clone();
            handles.push(tokio::spawn(async move { store.mark_processed("evt_contested").await }));
        }

        let mut winners = 0;
        for handle in handles {
            if handle.await.unwrap() {
                winners += 1;
            }
        }
        assert_eq!(winners, 1);
    }

    #[tokio::test]
    async fn entries_expire_after_ttl() {
        let store = IdempotencyStore::new(Duration::from_millis(50), 10_000);

        assert!(store.mark_processed("evt_ttl").await);
        tokio::time::sleep(Duration::from_millis(80)).await;

        // The mark has lapsed, so a late redelivery would apply again
        assert!(!store.has_processed("evt_ttl").await);
        assert!(store.mark_processed("evt_ttl").await);
    }
}
