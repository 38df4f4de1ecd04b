//! Request admission and dispatch to keyed counters.

use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, info, instrument, warn};

use crate::config::KeygateConfig;
use crate::counter::{CounterOp, KeyValueStore, KeyedCounter};
use crate::error::{KeygateError, Result};
use crate::ratelimit::{
    AdaptiveLimiter, Clock, KeyResolver, PartitionKey, RequestContext, SystemClock,
};

/// Composes the adaptive limiter with the keyed counter.
///
/// Every request is checked and recorded by the limiter for its key; only
/// admitted requests reach the counter.
pub struct Gateway {
    limiter: AdaptiveLimiter,
    counter: KeyedCounter,
    clock: Arc<dyn Clock>,
    resolver: Box<dyn KeyResolver>,
}

impl Gateway {
    pub fn new(
        limiter: AdaptiveLimiter,
        counter: KeyedCounter,
        clock: Arc<dyn Clock>,
        resolver: Box<dyn KeyResolver>,
    ) -> Self {
        Self {
            limiter,
            counter,
            clock,
            resolver,
        }
    }

    /// Build a gateway on the wall clock from service configuration.
    pub fn from_config(config: &KeygateConfig, store: Arc<dyn KeyValueStore>) -> Result<Self> {
        let policy = config.limiter.policy()?;
        info!(
            base_wait_ms = policy.base_wait,
            max_wait_ms = policy.max_wait,
            grace_period_ms = policy.grace_period,
            key_source = ?config.limiter.key_source,
            "Gateway configured"
        );
        Ok(Self::new(
            AdaptiveLimiter::new(policy),
            KeyedCounter::new(store),
            Arc::new(SystemClock),
            config.limiter.key_source.resolver(),
        ))
    }

    pub fn limiter(&self) -> &AdaptiveLimiter {
        &self.limiter
    }

    pub fn counter(&self) -> &KeyedCounter {
        &self.counter
    }

    /// Keys a request is limited and counted under.
    ///
    /// Returns `(limiter_key, counter_key)`.
    pub fn resolve_keys(&self, ctx: &RequestContext) -> (PartitionKey, PartitionKey) {
        let limiter_key = self.resolver.resolve(ctx);
        let counter_key = PartitionKey::new(ctx.path_key.as_str());
        (limiter_key, counter_key)
    }

    /// Run a request described by `ctx` through admission and the counter.
    pub async fn handle_request(&self, ctx: &RequestContext, op: CounterOp) -> Result<i64> {
        let (limiter_key, counter_key) = self.resolve_keys(ctx);
        self.handle(&limiter_key, &counter_key, op).await
    }

    /// Admit or reject one request, then apply `op` if admitted.
    pub async fn handle(
        &self,
        limiter_key: &PartitionKey,
        counter_key: &PartitionKey,
        op: CounterOp,
    ) -> Result<i64> {
        self.admit_then(limiter_key, counter_key, Ok(op)).await
    }

    /// Admit or reject one request, then apply `op` if admitted.
    ///
    /// `op` is only inspected after admission, so a request that failed to
    /// parse is still checked and recorded against its key; its error is
    /// returned once admitted.
    ///
    /// The limiter guard for `limiter_key` is held until the counter
    /// operation, including its store write, has finished. A second request
    /// for the same key waits for all of it before its own check.
    #[instrument(
        skip(self, limiter_key, counter_key),
        fields(limiter_key = %limiter_key, counter_key = %counter_key)
    )]
    pub async fn admit_then(
        &self,
        limiter_key: &PartitionKey,
        counter_key: &PartitionKey,
        op: Result<CounterOp>,
    ) -> Result<i64> {
        let mut guard = self.limiter.lock(limiter_key).await;
        let now = self.clock.now_millis();

        let wait = guard.admit(now);
        if wait > 0 {
            return Err(KeygateError::RateLimited {
                retry_after_ms: wait,
            });
        }

        let op = match op {
            Ok(op) => op,
            Err(e) => {
                debug!(error = %e, "Rejecting malformed request after admission");
                return Err(e);
            }
        };

        let result = self.counter.apply(counter_key, op).await;
        drop(guard);

        match &result {
            Ok(value) => debug!(?op, value, "Request served"),
            Err(e) => warn!(?op, error = %e, "Counter operation failed"),
        }
        result
    }

    /// Drop in-memory state for keys idle at least `max_idle`.
    pub fn sweep_idle(&self, max_idle: Duration) -> usize {
        let limiters = self.limiter.evict_idle(max_idle);
        let counters = self.counter.evict_idle(max_idle);
        limiters + counters
    }

    /// Periodically sweep idle keys until the returned task is aborted.
    pub fn spawn_sweeper(self: Arc<Self>, interval: Duration, max_idle: Duration) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let evicted = self.sweep_idle(max_idle);
                if evicted > 0 {
                    debug!(evicted, "Idle sweep finished");
                }
            }
        })
    }
}
