//! Adaptive rate limiting logic and per-key state.

mod clock;
mod key;
mod limiter;
mod policy;

pub use clock::{Clock, ManualClock, SystemClock};
pub use key::{
    ClientAddrResolver, KeyResolver, KeySource, PartitionKey, PathKeyResolver, RequestContext,
};
pub use limiter::{AdaptiveLimiter, LimiterGuard, LimiterState};
pub use policy::{BackoffPolicy, BASE_WAIT_TIME_MS, GRACE_PERIOD_MS, MAX_WAIT_TIME_MS};
