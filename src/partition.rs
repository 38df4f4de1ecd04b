//! Keyed partitions of single-owner state.
//!
//! A [`PartitionMap`] resolves a [`PartitionKey`] to a handle guarding that
//! key's state. Holding the guard is the only way to read or write the state,
//! so requests for the same key run one at a time (tokio's mutex is fair, so
//! in arrival order) while requests for different keys never contend on
//! anything but the map shard during lookup.

use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::sync::OwnedMutexGuard;
use tracing::{debug, trace};

use crate::ratelimit::PartitionKey;

/// Exclusive access to one key's state, held across await points.
pub type PartitionGuard<T> = OwnedMutexGuard<T>;

struct Partition<T> {
    state: Arc<tokio::sync::Mutex<T>>,
    last_access: Mutex<Instant>,
}

impl<T: Default> Partition<T> {
    fn new() -> Self {
        Self {
            state: Arc::new(tokio::sync::Mutex::new(T::default())),
            last_access: Mutex::new(Instant::now()),
        }
    }

    fn touch(&self) -> Arc<tokio::sync::Mutex<T>> {
        *self.last_access.lock() = Instant::now();
        Arc::clone(&self.state)
    }

    /// Nobody holds or waits on the state; only the map references it.
    fn is_unreferenced(&self) -> bool {
        Arc::strong_count(&self.state) == 1
    }
}

/// Map from key to independently serialized state.
///
/// State is created with `T::default()` on first access and may be evicted
/// once idle. An evicted key starts again from `T::default()`.
pub struct PartitionMap<T> {
    partitions: DashMap<PartitionKey, Partition<T>>,
}

impl<T: Default + Send + 'static> PartitionMap<T> {
    /// Create an empty partition map.
    pub fn new() -> Self {
        Self {
            partitions: DashMap::new(),
        }
    }

    /// Acquire exclusive access to the state for `key`.
    ///
    /// Waits for any in-flight holder of the same key to release its guard.
    pub async fn lock(&self, key: &PartitionKey) -> PartitionGuard<T> {
        // The shard guard must be released before awaiting the key's mutex.
        let state = match self.partitions.get(key) {
            Some(partition) => partition.touch(),
            None => {
                trace!(key = %key, "Creating partition");
                self.partitions
                    .entry(key.clone())
                    .or_insert_with(Partition::new)
                    .touch()
            }
        };
        state.lock_owned().await
    }

    /// Clone the current state for `key` without creating it.
    pub async fn snapshot(&self, key: &PartitionKey) -> Option<T>
    where
        T: Clone,
    {
        let state = self.partitions.get(key).map(|p| Arc::clone(&p.state))?;
        let guard = state.lock().await;
        Some(guard.clone())
    }

    /// Drop the state for `key` if nobody is using it.
    ///
    /// Returns `true` if the key was evicted.
    pub fn evict(&self, key: &PartitionKey) -> bool {
        self.partitions
            .remove_if(key, |_, partition| partition.is_unreferenced())
            .is_some()
    }

    /// Drop every partition untouched for at least `max_idle` and not in use.
    ///
    /// Returns the number of evicted partitions.
    pub fn evict_idle(&self, max_idle: Duration) -> usize {
        let before = self.partitions.len();
        self.partitions.retain(|_, partition| {
            !(partition.is_unreferenced() && partition.last_access.lock().elapsed() >= max_idle)
        });
        let evicted = before.saturating_sub(self.partitions.len());
        if evicted > 0 {
            debug!(evicted, remaining = self.partitions.len(), "Evicted idle partitions");
        }
        evicted
    }

    /// Whether state currently exists for `key`.
    pub fn contains(&self, key: &PartitionKey) -> bool {
        self.partitions.contains_key(key)
    }

    /// Get the number of live partitions.
    pub fn len(&self) -> usize {
        self.partitions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.partitions.is_empty()
    }
}

impl<T: Default + Send + 'static> Default for PartitionMap<T> {
    fn default() -> Self {
        Self::new()
    }
}
