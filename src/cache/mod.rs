//! Shared response cache.
//!
//! Entries and their recency index live in the shared ephemeral store so every
//! guard instance serves the same cached responses.
//!
//! ## Configuration
//!
//! Cache behavior is controlled via `soffio-guard.toml`:
//!
//! ```toml
//! [cache]
//! enabled = true
//! default_ttl_seconds = 300
//! max_entries = 10000
//! # ... see config.rs for all options
//! ```

mod config;
mod keys;
mod response;
mod store;

pub use config::CacheConfig;
pub(crate) use config::{
    DEFAULT_EVICTION_PERCENT, DEFAULT_MAX_BODY_BYTES, DEFAULT_MAX_ENTRIES, DEFAULT_NAMESPACE,
    DEFAULT_TTL_SECONDS,
};
pub use keys::{RequestKeyParts, normalize_path, request_cache_key};
pub use response::CachedResponse;
pub use store::CacheStore;
