//! Keyed integer counters on top of a durable store.

use std::sync::Arc;
use std::time::Duration;
use tracing::trace;

use super::store::KeyValueStore;
use crate::error::{KeygateError, Result};
use crate::partition::PartitionMap;
use crate::ratelimit::PartitionKey;

/// Store field holding a counter's value.
pub const VALUE_FIELD: &str = "value";

/// An operation on a single key's counter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CounterOp {
    Read,
    Increment(i64),
    Decrement(i64),
}

impl CounterOp {
    /// Whether the operation writes to the store.
    pub fn is_mutation(&self) -> bool {
        !matches!(self, CounterOp::Read)
    }
}

/// One integer per key, persisted through a [`KeyValueStore`].
///
/// Read-modify-write cycles for the same key are serialized, including
/// across the store's await points, so concurrent updates are never lost.
pub struct KeyedCounter {
    store: Arc<dyn KeyValueStore>,
    locks: PartitionMap<()>,
}

impl KeyedCounter {
    pub fn new(store: Arc<dyn KeyValueStore>) -> Self {
        Self {
            store,
            locks: PartitionMap::new(),
        }
    }

    /// Current value for `key`, 0 if never written.
    pub async fn get_value(&self, key: &PartitionKey) -> Result<i64> {
        let _guard = self.locks.lock(key).await;
        self.load(key).await
    }

    /// Add `amount` to the counter and return the new value.
    pub async fn increment(&self, key: &PartitionKey, amount: i64) -> Result<i64> {
        self.update(key, |value| value.checked_add(amount)).await
    }

    /// Subtract `amount` from the counter and return the new value.
    pub async fn decrement(&self, key: &PartitionKey, amount: i64) -> Result<i64> {
        self.update(key, |value| value.checked_sub(amount)).await
    }

    pub async fn apply(&self, key: &PartitionKey, op: CounterOp) -> Result<i64> {
        match op {
            CounterOp::Read => self.get_value(key).await,
            CounterOp::Increment(amount) => self.increment(key, amount).await,
            CounterOp::Decrement(amount) => self.decrement(key, amount).await,
        }
    }

    /// Drop lock handles for keys idle longer than `max_idle`, here and in
    /// the store.
    ///
    /// Values live in the store, so nothing is lost.
    pub fn evict_idle(&self, max_idle: Duration) -> usize {
        self.locks.evict_idle(max_idle) + self.store.evict_idle(max_idle)
    }

    async fn load(&self, key: &PartitionKey) -> Result<i64> {
        Ok(self.store.get(key, VALUE_FIELD).await?.unwrap_or(0))
    }

    async fn update<F>(&self, key: &PartitionKey, apply: F) -> Result<i64>
    where
        F: FnOnce(i64) -> Option<i64>,
    {
        let _guard = self.locks.lock(key).await;
        let current = self.load(key).await?;
        let next = apply(current).ok_or_else(|| KeygateError::Overflow {
            key: key.to_string(),
        })?;
        self.store.put(key, VALUE_FIELD, next).await?;

        trace!(key = %key, from = current, to = next, "Counter updated");
        Ok(next)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::counter::store::MemoryStore;
    use async_trait::async_trait;
    use futures::future::join_all;

    fn counter() -> KeyedCounter {
        KeyedCounter::new(Arc::new(MemoryStore::new()))
    }

    /// Yields inside every store call so read-modify-write cycles overlap
    /// unless the counter serializes them.
    struct YieldingStore(MemoryStore);

    #[async_trait]
    impl KeyValueStore for YieldingStore {
        async fn get(&self, key: &PartitionKey, field: &str) -> Result<Option<i64>> {
            tokio::task::yield_now().await;
            self.0.get(key, field).await
        }

        async fn put(&self, key: &PartitionKey, field: &str, value: i64) -> Result<()> {
            tokio::task::yield_now().await;
            self.0.put(key, field, value).await
        }
    }

    struct BrokenStore;

    #[async_trait]
    impl KeyValueStore for BrokenStore {
        async fn get(&self, _key: &PartitionKey, _field: &str) -> Result<Option<i64>> {
            Err(KeygateError::Storage("unavailable".into()))
        }

        async fn put(&self, _key: &PartitionKey, _field: &str, _value: i64) -> Result<()> {
            Err(KeygateError::Storage("unavailable".into()))
        }
    }

    #[tokio::test]
    async fn test_unwritten_key_reads_zero() {
        let counter = counter();
        assert_eq!(counter.get_value(&PartitionKey::from("new")).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_increment_then_decrement_restores_value() {
        let counter = counter();
        let key = PartitionKey::from("a");

        counter.increment(&key, 4).await.unwrap();
        let before = counter.get_value(&key).await.unwrap();
        assert_eq!(counter.increment(&key, 1).await.unwrap(), before + 1);
        assert_eq!(counter.decrement(&key, 1).await.unwrap(), before);
        assert_eq!(counter.get_value(&key).await.unwrap(), 4);
    }

    #[tokio::test]
    async fn test_decrement_goes_negative() {
        let counter = counter();
        let key = PartitionKey::from("a");
        assert_eq!(counter.decrement(&key, 3).await.unwrap(), -3);
    }

    #[tokio::test]
    async fn test_apply_dispatches_ops() {
        let counter = counter();
        let key = PartitionKey::from("a");

        assert_eq!(counter.apply(&key, CounterOp::Increment(5)).await.unwrap(), 5);
        assert_eq!(counter.apply(&key, CounterOp::Decrement(2)).await.unwrap(), 3);
        assert_eq!(counter.apply(&key, CounterOp::Read).await.unwrap(), 3);
        assert!(CounterOp::Increment(1).is_mutation());
        assert!(!CounterOp::Read.is_mutation());
    }

    #[tokio::test]
    async fn test_keys_are_isolated() {
        let counter = counter();
        let a = PartitionKey::from("a");
        let b = PartitionKey::from("b");

        counter.increment(&a, 10).await.unwrap();
        counter.decrement(&a, 3).await.unwrap();
        assert_eq!(counter.get_value(&b).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_overflow_is_an_error() {
        let counter = counter();
        let key = PartitionKey::from("a");

        counter.increment(&key, i64::MAX).await.unwrap();
        let result = counter.increment(&key, 1).await;
        assert!(matches!(result, Err(KeygateError::Overflow { .. })));
        assert_eq!(counter.get_value(&key).await.unwrap(), i64::MAX);
    }

    #[tokio::test]
    async fn test_store_failure_propagates() {
        let counter = KeyedCounter::new(Arc::new(BrokenStore));
        let key = PartitionKey::from("a");

        assert!(matches!(counter.get_value(&key).await, Err(KeygateError::Storage(_))));
        assert!(matches!(counter.increment(&key, 1).await, Err(KeygateError::Storage(_))));
    }

    #[tokio::test]
    async fn test_concurrent_increments_are_not_lost() {
        let counter = Arc::new(KeyedCounter::new(Arc::new(YieldingStore(MemoryStore::new()))));
        let key = PartitionKey::from("hot");

        let tasks = (0..50).map(|_| {
            let counter = Arc::clone(&counter);
            let key = key.clone();
            tokio::spawn(async move { counter.increment(&key, 1).await })
        });
        for result in join_all(tasks).await {
            result.unwrap().unwrap();
        }

        assert_eq!(counter.get_value(&key).await.unwrap(), 50);
    }

    #[tokio::test]
    async fn test_evict_idle_keeps_values() {
        let counter = counter();
        let key = PartitionKey::from("a");

        counter.increment(&key, 2).await.unwrap();
        assert_eq!(counter.evict_idle(Duration::ZERO), 1);
        assert_eq!(counter.get_value(&key).await.unwrap(), 2);
    }
}
