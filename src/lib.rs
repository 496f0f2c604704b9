//! Adaptive load management for the soffio HTTP server.
//!
//! The guard sits in front of request handlers and combines four parts:
//!
//! - [`load::LoadMonitor`] sheds every request while the runtime is lagging
//! - [`rate_limit::RateLimiter`] enforces sliding-window quotas per tier and subject
//! - [`cache::CacheStore`] keeps a shared, TTL-bound response cache with LRU eviction
//! - [`pipeline::RequestPipeline`] composes them into one admission state machine
//!
//! Shared state lives in an [`store::EphemeralStore`] (Redis in production) so
//! several guard instances agree on cache contents and rate-limit windows.

pub mod cache;
pub mod clock;
pub mod config;
pub mod error;
pub mod infra;
pub mod load;
pub mod pipeline;
pub mod rate_limit;
pub mod store;
