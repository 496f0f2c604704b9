use std::net::{IpAddr, SocketAddr};

use axum::extract::{ConnectInfo, Query};
use axum::http::{HeaderMap, Method, request::Parts};

/// Authenticated caller id placed in request extensions by an auth layer that
/// runs before the guard. Takes precedence over a trusted identity header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallerIdentity(pub String);

/// How the guard derives caller address and identity from a raw request.
#[derive(Debug, Clone)]
pub struct RequestConfig {
    pub identity_header: String,
    /// Honor `identity_header` from the wire. Only safe when a trusted auth proxy
    /// sets it and drops client-supplied values.
    pub trust_identity_header: bool,
    /// Honor `x-forwarded-for` / `x-real-ip`. Only safe behind a trusted proxy.
    pub trust_forwarded_for: bool,
}

impl Default for RequestConfig {
    fn default() -> Self {
        Self {
            identity_header: "x-authenticated-user".to_string(),
            trust_identity_header: false,
            trust_forwarded_for: false,
        }
    }
}

/// The parts of an incoming request the guard decides on.
#[derive(Debug, Clone)]
pub struct GuardRequest {
    pub method: Method,
    pub path: String,
    pub query: Vec<(String, String)>,
    pub headers: HeaderMap,
    pub client_ip: String,
    pub identity: Option<String>,
}

impl GuardRequest {
    pub fn new(method: Method, path: impl Into<String>) -> Self {
        Self {
            method,
            path: path.into(),
            query: Vec::new(),
            headers: HeaderMap::new(),
            client_ip: "unknown".to_string(),
            identity: None,
        }
    }

    pub fn with_query(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.query.push((name.into(), value.into()));
        self
    }

    pub fn with_client_ip(mut self, ip: impl Into<String>) -> Self {
        self.client_ip = ip.into();
        self
    }

    pub fn with_identity(mut self, identity: impl Into<String>) -> Self {
        self.identity = Some(identity.into());
        self
    }

    pub fn from_parts(parts: &Parts, config: &RequestConfig) -> Self {
        let query = Query::<Vec<(String, String)>>::try_from_uri(&parts.uri)
            .map(|Query(pairs)| pairs)
            .unwrap_or_default();

        let connect_addr = parts
            .extensions
            .get::<ConnectInfo<SocketAddr>>()
            .map(|ConnectInfo(addr)| *addr);
        let client_ip = client_ip(&parts.headers, connect_addr, config.trust_forwarded_for)
            .map_or_else(|| "unknown".to_string(), |ip| ip.to_string());

        Self {
            method: parts.method.clone(),
            path: parts.uri.path().to_string(),
            query,
            headers: parts.headers.clone(),
            client_ip,
            identity: identity(parts, config),
        }
    }
}

fn identity(parts: &Parts, config: &RequestConfig) -> Option<String> {
    if let Some(CallerIdentity(id)) = parts.extensions.get::<CallerIdentity>() {
        return Some(id.clone());
    }
    if !config.trust_identity_header {
        return None;
    }
    parts
        .headers
        .get(config.identity_header.as_str())
        .and_then(|value| value.to_str().ok())
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .map(str::to_string)
}

fn client_ip(headers: &HeaderMap, connect: Option<SocketAddr>, trust_forwarded: bool) -> Option<IpAddr> {
    if trust_forwarded {
        // First hop of x-forwarded-for is the original client.
        let forwarded = headers
            .get("x-forwarded-for")
            .and_then(|value| value.to_str().ok())
            .and_then(|value| value.split(',').next())
            .and_then(|first| first.trim().parse().ok());
        if forwarded.is_some() {
            return forwarded;
        }

        let real_ip = headers
            .get("x-real-ip")
            .and_then(|value| value.to_str().ok())
            .and_then(|value| value.trim().parse().ok());
        if real_ip.is_some() {
            return real_ip;
        }
    }

    connect.map(|addr| addr.ip())
}
