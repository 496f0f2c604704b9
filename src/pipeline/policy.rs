use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use axum::http::{HeaderName, Method};

use super::request::GuardRequest;

pub type BypassFn = Arc<dyn Fn(&GuardRequest) -> bool + Send + Sync>;

/// Caching rules for one route.
#[derive(Clone)]
pub struct CachePolicy {
    /// Scope prefixed to every key, used for prefix invalidation.
    pub namespace: String,
    /// Falls back to the cache default when unset.
    pub ttl: Option<Duration>,
    /// Query parameters that select distinct cached variants.
    pub query_whitelist: Vec<String>,
    /// Requests carrying any of these headers skip the cache.
    pub bypass_headers: Vec<HeaderName>,
    pub bypass: Option<BypassFn>,
}

impl CachePolicy {
    pub fn new(namespace: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            ttl: None,
            query_whitelist: Vec::new(),
            bypass_headers: Vec::new(),
            bypass: None,
        }
    }

    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = Some(ttl);
        self
    }

    pub fn with_query(mut self, names: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.query_whitelist.extend(names.into_iter().map(Into::into));
        self
    }

    pub fn with_bypass_header(mut self, name: HeaderName) -> Self {
        self.bypass_headers.push(name);
        self
    }

    pub fn with_bypass(
        mut self,
        predicate: impl Fn(&GuardRequest) -> bool + Send + Sync + 'static,
    ) -> Self {
        self.bypass = Some(Arc::new(predicate));
        self
    }

    pub fn should_bypass(&self, request: &GuardRequest) -> bool {
        self.bypass_headers
            .iter()
            .any(|name| request.headers.contains_key(name))
            || self.bypass.as_ref().is_some_and(|predicate| predicate(request))
    }
}

impl fmt::Debug for CachePolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CachePolicy")
            .field("namespace", &self.namespace)
            .field("ttl", &self.ttl)
            .field("query_whitelist", &self.query_whitelist)
            .field("bypass_headers", &self.bypass_headers)
            .field("bypass", &self.bypass.is_some())
            .finish()
    }
}

/// Tiers and caching applied to requests under a path prefix.
#[derive(Debug, Clone)]
pub struct RoutePolicy {
    pub prefix: String,
    /// `None` matches every method.
    pub methods: Option<Vec<Method>>,
    pub tiers: Vec<String>,
    pub cache: Option<CachePolicy>,
}

impl RoutePolicy {
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
            methods: None,
            tiers: Vec::new(),
            cache: None,
        }
    }

    pub fn with_methods(mut self, methods: impl IntoIterator<Item = Method>) -> Self {
        self.methods = Some(methods.into_iter().collect());
        self
    }

    pub fn with_tier(mut self, tier: impl Into<String>) -> Self {
        self.tiers.push(tier.into());
        self
    }

    pub fn with_cache(mut self, cache: CachePolicy) -> Self {
        self.cache = Some(cache);
        self
    }

    fn matches(&self, method: &Method, path: &str) -> bool {
        let method_ok = self
            .methods
            .as_ref()
            .is_none_or(|methods| methods.contains(method));
        method_ok && prefix_matches(&self.prefix, path)
    }

    /// Cache rules that apply to `request`, if it may be served from cache.
    /// Only `GET` responses are cached.
    pub fn cache_for(&self, request: &GuardRequest) -> Option<&CachePolicy> {
        if request.method != Method::GET {
            return None;
        }
        self.cache.as_ref()
    }
}

impl From<&crate::config::RouteSettings> for RoutePolicy {
    fn from(settings: &crate::config::RouteSettings) -> Self {
        let cache = settings.cache.as_ref().map(|cache| {
            let mut policy =
                CachePolicy::new(cache.namespace.clone()).with_query(cache.query.iter().cloned());
            if let Some(ttl) = cache.ttl_seconds {
                policy = policy.with_ttl(Duration::from_secs(ttl.get()));
            }
            for header in &cache.bypass_headers {
                policy = policy.with_bypass_header(header.clone());
            }
            policy
        });
        Self {
            prefix: settings.prefix.clone(),
            methods: settings.methods.clone(),
            tiers: settings.tiers.clone(),
            cache,
        }
    }
}

/// Prefix match on segment boundaries: `/posts` covers `/posts/a` but not
/// `/postscript`.
fn prefix_matches(prefix: &str, path: &str) -> bool {
    let Some(rest) = path.strip_prefix(prefix) else {
        return false;
    };
    rest.is_empty() || prefix.ends_with('/') || rest.starts_with('/')
}

/// Route policies ordered so the longest matching prefix wins.
#[derive(Debug, Clone, Default)]
pub struct RouteTable {
    routes: Vec<RoutePolicy>,
}

impl RouteTable {
    pub fn new(mut routes: Vec<RoutePolicy>) -> Self {
        // Stable sort keeps declaration order among equal-length prefixes.
        routes.sort_by(|a, b| b.prefix.len().cmp(&a.prefix.len()));
        Self { routes }
    }

    pub fn resolve(&self, method: &Method, path: &str) -> Option<&RoutePolicy> {
        self.routes
            .iter()
            .find(|route| route.matches(method, path))
    }

    pub fn routes(&self) -> &[RoutePolicy] {
        &self.routes
    }
}

impl From<&[crate::config::RouteSettings]> for RouteTable {
    fn from(settings: &[crate::config::RouteSettings]) -> Self {
        RouteTable::new(settings.iter().map(RoutePolicy::from).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table() -> RouteTable {
        RouteTable::new(vec![
            RoutePolicy::new("/").with_tier("api"),
            RoutePolicy::new("/posts")
                .with_tier("api")
                .with_cache(CachePolicy::new("posts")),
            RoutePolicy::new("/posts")
                .with_methods([Method::POST, Method::PUT])
                .with_tier("api")
                .with_tier("content"),
        ])
    }

    #[test]
    fn longest_prefix_wins() {
        let table = table();
        let route = table.resolve(&Method::GET, "/posts/hello").expect("route");
        assert_eq!(route.prefix, "/posts");
        assert!(route.cache.is_some());

        let route = table.resolve(&Method::GET, "/tags").expect("route");
        assert_eq!(route.prefix, "/");
    }

    #[test]
    fn prefix_respects_segment_boundaries() {
        assert!(prefix_matches("/posts", "/posts"));
        assert!(prefix_matches("/posts", "/posts/a"));
        assert!(!prefix_matches("/posts", "/postscript"));
        assert!(prefix_matches("/", "/anything"));
    }

    #[test]
    fn method_filter_selects_between_equal_prefixes() {
        let table = table();
        // Declaration order decides between equal prefixes; the unfiltered
        // route comes first and therefore also covers POST.
        let route = table.resolve(&Method::POST, "/posts").expect("route");
        assert_eq!(route.tiers, vec!["api".to_string()]);

        let table = RouteTable::new(vec![
            RoutePolicy::new("/posts")
                .with_methods([Method::POST])
                .with_tier("content"),
            RoutePolicy::new("/posts").with_tier("api"),
        ]);
        assert_eq!(
            table.resolve(&Method::POST, "/posts").expect("route").tiers,
            vec!["content".to_string()]
        );
        assert_eq!(
            table.resolve(&Method::GET, "/posts").expect("route").tiers,
            vec!["api".to_string()]
        );
    }

    #[test]
    fn only_get_is_cacheable() {
        let route = RoutePolicy::new("/posts").with_cache(CachePolicy::new("posts"));
        assert!(route.cache_for(&GuardRequest::new(Method::GET, "/posts")).is_some());
        assert!(route.cache_for(&GuardRequest::new(Method::POST, "/posts")).is_none());
    }

    #[test]
    fn bypass_by_header_or_predicate() {
        let policy = CachePolicy::new("posts")
            .with_bypass_header(HeaderName::from_static("authorization"))
            .with_bypass(|request| request.query.iter().any(|(name, _)| name == "preview"));

        let plain = GuardRequest::new(Method::GET, "/posts");
        assert!(!policy.should_bypass(&plain));

        let mut with_header = plain.clone();
        with_header
            .headers
            .insert("authorization", "Bearer x".parse().expect("header"));
        assert!(policy.should_bypass(&with_header));

        assert!(policy.should_bypass(&plain.with_query("preview", "1")));
    }

    #[test]
    fn table_from_route_settings() {
        use crate::config::{RouteCacheSettings, RouteSettings};

        let settings = vec![
            RouteSettings {
                prefix: "/".to_string(),
                methods: None,
                tiers: vec!["api".to_string()],
                cache: None,
            },
            RouteSettings {
                prefix: "/posts".to_string(),
                methods: Some(vec![Method::GET]),
                tiers: vec!["api".to_string()],
                cache: Some(RouteCacheSettings {
                    namespace: "posts".to_string(),
                    ttl_seconds: std::num::NonZeroU64::new(60),
                    query: vec!["page".to_string()],
                    bypass_headers: vec![HeaderName::from_static("authorization")],
                }),
            },
        ];

        let table = RouteTable::from(settings.as_slice());
        assert_eq!(table.routes()[0].prefix, "/posts");
        let cache = table.routes()[0].cache.as_ref().expect("cache policy");
        assert_eq!(cache.ttl, Some(Duration::from_secs(60)));
        assert_eq!(cache.query_whitelist, vec!["page".to_string()]);
        assert_eq!(cache.bypass_headers.len(), 1);
    }
}
