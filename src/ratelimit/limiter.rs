//! Adaptive per-key rate limiter.

use std::time::Duration;
use tracing::{debug, trace};

use super::key::PartitionKey;
use super::policy::BackoffPolicy;
use crate::partition::{PartitionGuard, PartitionMap};

/// Rate limit bookkeeping for a single key.
///
/// Both fields are always read and written together under the key's guard.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LimiterState {
    /// Earliest time (ms) a request is accepted without penalty; 0 means open now
    pub next_allowed_time: u64,
    /// Requests received back-to-back while penalized
    pub consecutive_hits: u32,
}

impl LimiterState {
    /// Wait, in milliseconds, to report to a request arriving at `now`.
    pub fn check(&self, now: u64, policy: &BackoffPolicy) -> u64 {
        policy.reported_wait(self.next_allowed_time, now)
    }

    /// Fold a request arriving at `now` into the state.
    ///
    /// Open requests reset the penalty and arm the base spacing. Penalized
    /// requests escalate it; the boundary never moves backward.
    pub fn record(&mut self, now: u64, policy: &BackoffPolicy) {
        if now >= self.next_allowed_time {
            self.consecutive_hits = 0;
            self.next_allowed_time = now.saturating_add(policy.base_wait);
        } else {
            self.consecutive_hits = self.consecutive_hits.saturating_add(1);
            let wait = policy.penalty_for(self.consecutive_hits);
            self.next_allowed_time = self.next_allowed_time.max(now.saturating_add(wait));
        }
    }
}

/// Per-key slot: limiter state plus the latest timestamp seen for the key.
#[derive(Debug, Clone, Default)]
pub struct LimiterSlot {
    state: LimiterState,
    last_seen: u64,
}

impl LimiterSlot {
    /// Clamp `now` so time never runs backward for this key.
    fn observe(&mut self, now: u64) -> u64 {
        self.last_seen = self.last_seen.max(now);
        self.last_seen
    }
}

/// Exclusive handle on one key's limiter state.
///
/// Check and record calls made through the same guard cannot interleave
/// with any other request for that key.
pub struct LimiterGuard {
    key: PartitionKey,
    slot: PartitionGuard<LimiterSlot>,
    policy: BackoffPolicy,
}

impl LimiterGuard {
    pub fn key(&self) -> &PartitionKey {
        &self.key
    }

    pub fn state(&self) -> LimiterState {
        self.slot.state
    }

    /// Wait to report to a request at `now`. Advances the key's clock clamp
    /// but leaves the limiter state untouched.
    pub fn check(&mut self, now: u64) -> u64 {
        let now = self.slot.observe(now);
        self.slot.state.check(now, &self.policy)
    }

    /// Record a request at `now`, admitted or not.
    pub fn record(&mut self, now: u64) {
        let now = self.slot.observe(now);
        self.slot.state.record(now, &self.policy);
    }

    /// Check and record with one timestamp. Returns the reported wait.
    pub fn admit(&mut self, now: u64) -> u64 {
        let wait = self.check(now);
        self.record(now);

        trace!(
            key = %self.key,
            now,
            wait_ms = wait,
            next_allowed_time = self.slot.state.next_allowed_time,
            "Rate limit decision"
        );
        if wait > 0 {
            debug!(
                key = %self.key,
                wait_ms = wait,
                consecutive_hits = self.slot.state.consecutive_hits,
                "Rate limit exceeded"
            );
        }
        wait
    }
}

/// The adaptive rate limiter, one isolated state machine per key.
///
/// This struct is thread-safe and can be shared across multiple tasks.
pub struct AdaptiveLimiter {
    partitions: PartitionMap<LimiterSlot>,
    policy: BackoffPolicy,
}

impl AdaptiveLimiter {
    /// Create a new limiter with the given backoff policy.
    pub fn new(policy: BackoffPolicy) -> Self {
        Self {
            partitions: PartitionMap::new(),
            policy,
        }
    }

    pub fn policy(&self) -> &BackoffPolicy {
        &self.policy
    }

    /// Take exclusive ownership of the state for `key`.
    ///
    /// Callers that need check, record and follow-up work to form one atomic
    /// unit keep the guard alive for the whole sequence.
    pub async fn lock(&self, key: &PartitionKey) -> LimiterGuard {
        let slot = self.partitions.lock(key).await;
        LimiterGuard {
            key: key.clone(),
            slot,
            policy: self.policy,
        }
    }

    pub async fn check(&self, key: &PartitionKey, now: u64) -> u64 {
        self.lock(key).await.check(now)
    }

    pub async fn record(&self, key: &PartitionKey, now: u64) {
        self.lock(key).await.record(now)
    }

    /// Check then record for `key` at `now`, atomically.
    pub async fn admit(&self, key: &PartitionKey, now: u64) -> u64 {
        self.lock(key).await.admit(now)
    }

    /// Current state for `key`, or `None` if the key has none in memory.
    pub async fn snapshot(&self, key: &PartitionKey) -> Option<LimiterState> {
        self.partitions.snapshot(key).await.map(|slot| slot.state)
    }

    /// Forget the state for `key`. The next request starts from zero.
    pub fn evict(&self, key: &PartitionKey) -> bool {
        self.partitions.evict(key)
    }

    pub fn evict_idle(&self, max_idle: Duration) -> usize {
        self.partitions.evict_idle(max_idle)
    }

    /// Get the number of keys with state in memory.
    pub fn key_count(&self) -> usize {
        self.partitions.len()
    }
}

impl Default for AdaptiveLimiter {
    fn default() -> Self {
        Self::new(BackoffPolicy::default())
    }
}
