//! Keygate - Adaptive Per-Key Rate Limiting Gateway
//!
//! This crate implements a request-gated, per-key state service. Each key
//! owns an isolated integer counter and its own adaptive rate limiter; a
//! request reaches the counter only after the limiter for its key admits it.
//! Requests for the same key are serialized, requests for different keys
//! never interact.

pub mod config;
pub mod counter;
pub mod error;
pub mod gateway;
pub mod partition;
pub mod ratelimit;
