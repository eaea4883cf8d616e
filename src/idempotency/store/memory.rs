use super::{IdempotencyStore, StoreBackend};
use crate::error::Result;
use crate::idempotency::key::IdempotencyKey;
use crate::idempotency::record::{expiry_from, IdempotencyRecord, IdempotencyState};
use crate::observability::{get_metrics, LatencyTimer};
use async_trait::async_trait;
use chrono::Utc;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;

/// In-process claim store.
///
/// Only guards callers inside one process; use the PostgreSQL or Redis store
/// when several instances share keys.
#[derive(Debug, Default)]
pub struct MemoryIdempotencyStore {
    records: DashMap<String, IdempotencyRecord>,
}

impl MemoryIdempotencyStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of physically present records, expired ones included.
    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn clear(&self) {
        self.records.clear();
    }

    fn observe(&self, operation: &str, timer: &LatencyTimer) {
        get_metrics().record_store_operation(
            StoreBackend::Memory.as_str(),
            operation,
            timer.elapsed_ms(),
            true,
        );
    }

    fn try_claim(&self, key: &IdempotencyKey, ttl_seconds: u64) -> bool {
        let now = Utc::now();

        // The entry guard holds the shard lock across the check and the insert.
        match self.records.entry(key.canonical().to_string()) {
            Entry::Occupied(mut occupied) => {
                if occupied.get().is_live_at(now) {
                    tracing::debug!(key = %key.redacted(), "Idempotency key already claimed");
                    return false;
                }
                occupied.insert(IdempotencyRecord::pending(key.canonical(), ttl_seconds, now));
            }
            Entry::Vacant(vacant) => {
                vacant.insert(IdempotencyRecord::pending(key.canonical(), ttl_seconds, now));
            }
        }

        tracing::debug!(key = %key.redacted(), ttl_seconds, "Idempotency key claimed");
        true
    }

    fn try_get(&self, key: &IdempotencyKey) -> Option<IdempotencyRecord> {
        let now = Utc::now();
        if let Some(record) = self.records.get(key.canonical()) {
            if record.is_live_at(now) {
                return Some(record.clone());
            }
        }

        self.records
            .remove_if(key.canonical(), |_, record| !record.is_live_at(now));
        None
    }

    /// Applies `update` to the live record; an expired one is dropped.
    fn update_live<F>(&self, key: &IdempotencyKey, update: F)
    where
        F: FnOnce(&mut IdempotencyRecord, chrono::DateTime<Utc>),
    {
        let now = Utc::now();
        if let Entry::Occupied(mut occupied) = self.records.entry(key.canonical().to_string()) {
            if occupied.get().is_live_at(now) {
                update(occupied.get_mut(), now);
            } else {
                occupied.remove();
            }
        }
    }
}

#[async_trait]
impl IdempotencyStore for MemoryIdempotencyStore {
    async fn claim(&self, key: &IdempotencyKey, ttl_seconds: u64) -> Result<bool> {
        let timer = LatencyTimer::new();
        let claimed = self.try_claim(key, ttl_seconds);
        self.observe("claim", &timer);
        Ok(claimed)
    }

    async fn get(&self, key: &IdempotencyKey) -> Result<Option<IdempotencyRecord>> {
        let timer = LatencyTimer::new();
        let record = self.try_get(key);
        self.observe("get", &timer);
        Ok(record)
    }

    async fn set_state(&self, key: &IdempotencyKey, state: IdempotencyState) -> Result<()> {
        let timer = LatencyTimer::new();
        self.update_live(key, |record, _| {
            record.state = state;
            tracing::debug!(key = %key.redacted(), state = %state, "Idempotency state updated");
        });
        self.observe("set_state", &timer);
        Ok(())
    }

    async fn release(&self, key: &IdempotencyKey) -> Result<()> {
        let timer = LatencyTimer::new();
        self.records.remove(key.canonical());
        self.observe("release", &timer);
        tracing::debug!(key = %key.redacted(), "Idempotency key released");
        Ok(())
    }

    async fn extend(&self, key: &IdempotencyKey, ttl_seconds: u64) -> Result<()> {
        let timer = LatencyTimer::new();
        self.update_live(key, |record, now| {
            record.expires_at = expiry_from(now, ttl_seconds);
            tracing::debug!(key = %key.redacted(), ttl_seconds, "Idempotency claim extended");
        });
        self.observe("extend", &timer);
        Ok(())
    }

    async fn purge_expired(&self) -> Result<u64> {
        let timer = LatencyTimer::new();
        let now = Utc::now();
        let before = self.records.len();
        self.records.retain(|_, record| record.is_live_at(now));
        self.observe("purge_expired", &timer);
        Ok(before.saturating_sub(self.records.len()) as u64)
    }

    async fn ping(&self) -> Result<()> {
        Ok(())
    }

    fn backend(&self) -> StoreBackend {
        StoreBackend::Memory
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    fn key(discriminator: &str) -> IdempotencyKey {
        IdempotencyKey::new("http", "POST /orders", discriminator).unwrap()
    }

    #[tokio::test]
    async fn test_claim_is_exclusive_while_live() {
        let store = MemoryIdempotencyStore::new();
        let key = key("order-123");

        assert!(store.claim(&key, 300).await.unwrap());
        assert!(!store.claim(&key, 300).await.unwrap());

        let record = store.get(&key).await.unwrap().expect("live record");
        assert_eq!(record.key, "http:POST /orders:order-123");
        assert_eq!(record.state, IdempotencyState::Pending);
    }

    #[tokio::test]
    async fn test_release_allows_reclaim() {
        let store = MemoryIdempotencyStore::new();
        let key = key("order-1");

        assert!(store.claim(&key, 300).await.unwrap());
        store.release(&key).await.unwrap();
        assert!(store.get(&key).await.unwrap().is_none());
        assert!(store.claim(&key, 300).await.unwrap());
    }

    #[tokio::test]
    async fn test_set_state_on_missing_key_is_noop() {
        let store = MemoryIdempotencyStore::new();
        let key = key("missing");

        store.set_state(&key, IdempotencyState::Success).await.unwrap();
        store.extend(&key, 60).await.unwrap();
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn test_set_state_updates_live_record() {
        let store = MemoryIdempotencyStore::new();
        let key = key("order-2");

        store.claim(&key, 300).await.unwrap();
        store.set_state(&key, IdempotencyState::Success).await.unwrap();

        let record = store.get(&key).await.unwrap().unwrap();
        assert_eq!(record.state, IdempotencyState::Success);
    }

    #[tokio::test]
    async fn test_expired_record_is_absent_and_reclaimable() {
        let store = MemoryIdempotencyStore::new();
        let key = key("order-3");

        assert!(store.claim(&key, 1).await.unwrap());
        tokio::time::sleep(Duration::from_millis(1100)).await;

        assert!(store.get(&key).await.unwrap().is_none());
        assert_eq!(store.len(), 0, "expired record is removed lazily on read");
        assert!(store.claim(&key, 1).await.unwrap());
    }

    #[tokio::test]
    async fn test_extend_pushes_expiry() {
        let store = MemoryIdempotencyStore::new();
        let key = key("order-4");

        store.claim(&key, 1).await.unwrap();
        let before = store.get(&key).await.unwrap().unwrap().expires_at;

        store.extend(&key, 600).await.unwrap();
        let after = store.get(&key).await.unwrap().unwrap().expires_at;

        assert!(after > before);
        assert!(after - before > chrono::Duration::seconds(500));
    }

    #[tokio::test]
    async fn test_purge_expired_counts_removed() {
        let store = MemoryIdempotencyStore::new();
        store.claim(&key("short-1"), 1).await.unwrap();
        store.claim(&key("short-2"), 1).await.unwrap();
        store.claim(&key("long"), 300).await.unwrap();

        tokio::time::sleep(Duration::from_millis(1100)).await;

        assert_eq!(store.purge_expired().await.unwrap(), 2);
        assert_eq!(store.len(), 1);
    }

    /// Keeps the `backend`/`operation` labels of every store operation counter.
    #[derive(Default)]
    struct OperationRecorder {
        operations: std::sync::Mutex<Vec<(String, String)>>,
    }

    impl metrics::Recorder for OperationRecorder {
        fn describe_counter(&self, _: metrics::KeyName, _: Option<metrics::Unit>, _: metrics::SharedString) {}
        fn describe_gauge(&self, _: metrics::KeyName, _: Option<metrics::Unit>, _: metrics::SharedString) {}
        fn describe_histogram(&self, _: metrics::KeyName, _: Option<metrics::Unit>, _: metrics::SharedString) {}

        fn register_counter(&self, key: &metrics::Key, _: &metrics::Metadata<'_>) -> metrics::Counter {
            if key.name() == "idempotency_store_operations_total" {
                let label = |name: &str| {
                    key.labels()
                        .find(|l| l.key() == name)
                        .map(|l| l.value().to_string())
                        .unwrap_or_default()
                };
                self.operations
                    .lock()
                    .unwrap()
                    .push((label("backend"), label("operation")));
            }
            metrics::Counter::noop()
        }

        fn register_gauge(&self, _: &metrics::Key, _: &metrics::Metadata<'_>) -> metrics::Gauge {
            metrics::Gauge::noop()
        }

        fn register_histogram(&self, _: &metrics::Key, _: &metrics::Metadata<'_>) -> metrics::Histogram {
            metrics::Histogram::noop()
        }
    }

    #[test]
    fn test_operations_are_recorded_as_memory_backend() {
        let recorder = OperationRecorder::default();
        let store = MemoryIdempotencyStore::new();
        let key = key("metered");

        metrics::with_local_recorder(&recorder, || {
            futures::executor::block_on(async {
                store.claim(&key, 300).await.unwrap();
                store.get(&key).await.unwrap();
                store.set_state(&key, IdempotencyState::Success).await.unwrap();
                store.extend(&key, 60).await.unwrap();
                store.release(&key).await.unwrap();
                store.purge_expired().await.unwrap();
            })
        });

        let operations = recorder.operations.lock().unwrap().clone();
        let names: Vec<&str> = operations.iter().map(|(_, op)| op.as_str()).collect();
        assert_eq!(
            names,
            vec!["claim", "get", "set_state", "extend", "release", "purge_expired"]
        );
        assert!(operations.iter().all(|(backend, _)| backend == "memory"));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_claims_single_winner() {
        let store = Arc::new(MemoryIdempotencyStore::new());
        let key = key("race");

        let handles: Vec<_> = (0..64)
            .map(|_| {
                let store = Arc::clone(&store);
                let key = key.clone();
                tokio::spawn(async move { store.claim(&key, 300).await.unwrap() })
            })
            .collect();

        let mut winners = 0;
        for handle in handles {
            if handle.await.unwrap() {
                winners += 1;
            }
        }
        assert_eq!(winners, 1);
    }
}
