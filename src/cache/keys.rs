//! Request-scoped cache key derivation.
//!
//! Keys are `<scope>:<sha256>` where the digest covers method, normalized path,
//! the whitelisted query parameters present on the request and the caller
//! identity. The scope is the route's cache namespace, so `invalidate("posts:")`
//! drops every cached variant of that route. Raw query values never reach the
//! store.

use sha2::{Digest, Sha256};

const FIELD_SEPARATOR: u8 = 0x1e;
const PAIR_SEPARATOR: u8 = 0x1f;

/// Inputs that identify one cacheable response variant.
#[derive(Debug, Clone, Copy)]
pub struct RequestKeyParts<'a> {
    pub method: &'a str,
    pub path: &'a str,
    pub query: &'a [(String, String)],
    pub query_whitelist: &'a [String],
    pub identity: Option<&'a str>,
}

/// Derive the cache key for a request under `scope`.
pub fn request_cache_key(scope: &str, parts: RequestKeyParts<'_>) -> String {
    let mut hasher = Sha256::new();
    hasher.update(parts.method.to_ascii_uppercase().as_bytes());
    hasher.update([FIELD_SEPARATOR]);
    hasher.update(normalize_path(parts.path).as_bytes());
    hasher.update([FIELD_SEPARATOR]);

    for (name, value) in whitelisted_query(parts.query, parts.query_whitelist) {
        hasher.update(name.as_bytes());
        hasher.update(b"=");
        hasher.update(value.as_bytes());
        hasher.update([PAIR_SEPARATOR]);
    }
    hasher.update([FIELD_SEPARATOR]);

    match parts.identity {
        Some(identity) => {
            hasher.update(b"id:");
            hasher.update(identity.as_bytes());
        }
        None => hasher.update(b"anonymous"),
    }

    format!("{scope}:{}", hex::encode(hasher.finalize()))
}

/// Collapse duplicate slashes and drop a trailing slash (except for the root).
pub fn normalize_path(path: &str) -> String {
    let mut normalized = String::with_capacity(path.len() + 1);
    for segment in path.split('/').filter(|segment| !segment.is_empty()) {
        normalized.push('/');
        normalized.push_str(segment);
    }
    if normalized.is_empty() {
        normalized.push('/');
    }
    normalized
}

/// Whitelisted pairs ordered by name; repeated names keep their request order.
fn whitelisted_query<'a>(
    query: &'a [(String, String)],
    whitelist: &[String],
) -> Vec<(&'a str, &'a str)> {
    let mut pairs: Vec<(&str, &str)> = query
        .iter()
        .filter(|(name, _)| whitelist.iter().any(|allowed| allowed == name))
        .map(|(name, value)| (name.as_str(), value.as_str()))
        .collect();
    pairs.sort_by(|a, b| a.0.cmp(b.0));
    pairs
}
