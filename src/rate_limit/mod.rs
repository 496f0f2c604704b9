//! Multi-tier sliding-window rate limiting over the shared ephemeral store.
//!
//! Each tier owns an independent window per subject, so a caller throttled on
//! one tier keeps its budget on every other tier.

mod config;
mod limiter;

pub use config::{SubjectSource, TierConfig, TierConfigError};
pub use limiter::{Admission, Decision, RateLimiter, Verdict};
