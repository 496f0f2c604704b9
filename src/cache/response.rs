use serde::{Deserialize, Serialize};

/// Origin response captured for replay: the status and the JSON body.
///
/// Only 2xx responses are ever stored, so a cache hit always replays a success.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CachedResponse {
    pub status: u16,
    pub body: serde_json::Value,
}

impl CachedResponse {
    pub fn new(status: u16, body: serde_json::Value) -> Self {
        Self { status, body }
    }

    pub fn is_cacheable_status(status: u16) -> bool {
        (200..300).contains(&status)
    }
}
