//! Request pipeline: load check, rate limit, cache lookup, handler, cache populate.
//!
//! Each stage is exposed separately ([`RequestPipeline::admit`],
//! [`RequestPipeline::plan_cache`], [`RequestPipeline::populate`]) so the axum
//! middleware can drive them around `Next`, while [`RequestPipeline::process`]
//! runs the whole state machine against a [`Handler`].

mod middleware;
mod policy;
mod request;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::debug;

use crate::cache::{CacheStore, CachedResponse, RequestKeyParts, request_cache_key};
use crate::load::LoadMonitor;
use crate::rate_limit::{Admission, Decision, RateLimiter, TierConfigError, Verdict};

pub use middleware::{CACHE_STATUS_HEADER, GuardOutcome, guard_layer};
pub use policy::{BypassFn, CachePolicy, RoutePolicy, RouteTable};
pub use request::{CallerIdentity, GuardRequest, RequestConfig};

const TARGET: &str = "soffio_guard::pipeline";

/// Downstream business handler. Invoked at most once per admitted request.
#[async_trait]
pub trait Handler: Send + Sync {
    async fn handle(&self, request: &GuardRequest) -> HandlerResponse;
}

/// Status and JSON body produced by a [`Handler`].
pub type HandlerResponse = CachedResponse;

/// Why the guard refused a request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Rejection {
    Overloaded {
        retry_after_secs: u64,
    },
    RateLimited {
        retry_after_secs: u64,
        message: String,
        verdict: Option<Verdict>,
    },
}

/// Whether a request may be answered from cache, and under which key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CachePlan {
    /// Route is not cacheable for this method, or caching is disabled.
    Skip,
    /// The route's bypass predicate matched.
    Bypass,
    Lookup { key: String, ttl: Option<Duration> },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheStatus {
    Hit,
    Miss,
    Bypass,
}

impl CacheStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            CacheStatus::Hit => "HIT",
            CacheStatus::Miss => "MISS",
            CacheStatus::Bypass => "BYPASS",
        }
    }
}

/// Terminal state of one request.
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    Rejected(Rejection),
    ServedFromCache {
        response: CachedResponse,
        admission: Admission,
    },
    ServedFromOrigin {
        response: HandlerResponse,
        cache: CacheStatus,
        admission: Admission,
    },
}

impl Outcome {
    pub fn label(&self) -> &'static str {
        match self {
            Outcome::Rejected(Rejection::Overloaded { .. }) => "rejected_overloaded",
            Outcome::Rejected(Rejection::RateLimited { .. }) => "rejected_rate_limited",
            Outcome::ServedFromCache { .. } => "served_from_cache",
            Outcome::ServedFromOrigin { .. } => "served_from_origin",
        }
    }
}

#[derive(Clone)]
pub struct RequestPipeline {
    load: LoadMonitor,
    limiter: RateLimiter,
    cache: Option<CacheStore>,
    routes: Arc<RouteTable>,
    request_config: Arc<RequestConfig>,
}

impl RequestPipeline {
    /// Assemble the pipeline, rejecting routes that name unknown tiers.
    pub fn new(
        load: LoadMonitor,
        limiter: RateLimiter,
        cache: Option<CacheStore>,
        routes: RouteTable,
        request_config: RequestConfig,
    ) -> Result<Self, TierConfigError> {
        for route in routes.routes() {
            limiter.ensure_tiers(&route.prefix, route.tiers.iter().map(String::as_str))?;
        }
        let cache = cache.filter(|cache| cache.config().enabled);
        Ok(Self {
            load,
            limiter,
            cache,
            routes: Arc::new(routes),
            request_config: Arc::new(request_config),
        })
    }

    pub fn load(&self) -> &LoadMonitor {
        &self.load
    }

    pub fn cache(&self) -> Option<&CacheStore> {
        self.cache.as_ref()
    }

    pub fn routes(&self) -> &RouteTable {
        &self.routes
    }

    pub fn request_config(&self) -> &RequestConfig {
        &self.request_config
    }

    /// Load check, then every applicable rate-limit tier.
    pub async fn admit(&self, request: &GuardRequest) -> Result<Admission, Rejection> {
        if self.load.is_overloaded() {
            self.load.note_rejection();
            debug!(
                target: TARGET,
                path = %request.path,
                lag_ms = self.load.lag_ms(),
                "rejecting request; overloaded"
            );
            return Err(Rejection::Overloaded {
                retry_after_secs: self.load.retry_after_secs(),
            });
        }

        let Some(route) = self.routes.resolve(&request.method, &request.path) else {
            return Ok(Admission::default());
        };

        let subjects: Vec<(&str, String)> = route
            .tiers
            .iter()
            .filter_map(|tier| {
                self.limiter.tier(tier).map(|config| {
                    let subject = config
                        .subject
                        .subject(&request.client_ip, request.identity.as_deref());
                    (tier.as_str(), subject)
                })
            })
            .collect();
        let checks: Vec<(&str, &str)> = subjects
            .iter()
            .map(|(tier, subject)| (*tier, subject.as_str()))
            .collect();

        let admission = self.limiter.check_all(&checks).await;
        match admission.decision() {
            Decision::Allowed => Ok(admission),
            Decision::Rejected { retry_after_secs } => {
                let message = admission
                    .rejecting_tier()
                    .and_then(|tier| self.limiter.tier(tier))
                    .map(|tier| tier.message.clone())
                    .unwrap_or_else(|| "Too many requests, please try again later.".to_string());
                let verdict = admission
                    .verdicts
                    .iter()
                    .find(|verdict| !verdict.is_allowed())
                    .cloned();
                Err(Rejection::RateLimited {
                    retry_after_secs,
                    message,
                    verdict,
                })
            }
        }
    }

    /// Decide whether `request` goes through the cache and derive its key.
    pub fn plan_cache(&self, request: &GuardRequest) -> CachePlan {
        if self.cache.is_none() {
            return CachePlan::Skip;
        }
        let Some(policy) = self
            .routes
            .resolve(&request.method, &request.path)
            .and_then(|route| route.cache_for(request))
        else {
            return CachePlan::Skip;
        };
        if policy.should_bypass(request) {
            return CachePlan::Bypass;
        }

        let method = request.method.as_str();
        let key = request_cache_key(
            &policy.namespace,
            RequestKeyParts {
                method,
                path: &request.path,
                query: &request.query,
                query_whitelist: &policy.query_whitelist,
                identity: request.identity.as_deref(),
            },
        );
        CachePlan::Lookup {
            key,
            ttl: policy.ttl,
        }
    }

    pub async fn lookup(&self, plan: &CachePlan) -> Option<CachedResponse> {
        let (CachePlan::Lookup { key, .. }, Some(cache)) = (plan, self.cache.as_ref()) else {
            return None;
        };
        cache
            .get::<CachedResponse>(key)
            .await
            .filter(|cached| CachedResponse::is_cacheable_status(cached.status))
    }

    /// Store a successful origin response on a detached task so the caller
    /// never waits on the write. Returns the task handle, if one was spawned.
    pub fn populate(
        &self,
        plan: &CachePlan,
        response: &CachedResponse,
    ) -> Option<tokio::task::JoinHandle<()>> {
        let (CachePlan::Lookup { key, ttl }, Some(cache)) = (plan, self.cache.as_ref()) else {
            return None;
        };
        if !CachedResponse::is_cacheable_status(response.status) {
            return None;
        }

        let cache = cache.clone();
        let key = key.clone();
        let ttl = *ttl;
        let response = response.clone();
        Some(tokio::spawn(async move {
            cache.set(&key, &response, ttl).await;
        }))
    }

    /// Run the whole state machine for `request`.
    pub async fn process(&self, request: &GuardRequest, handler: &dyn Handler) -> Outcome {
        let admission = match self.admit(request).await {
            Ok(admission) => admission,
            Err(rejection) => return Outcome::Rejected(rejection),
        };

        let plan = self.plan_cache(request);
        if let Some(response) = self.lookup(&plan).await {
            return Outcome::ServedFromCache {
                response,
                admission,
            };
        }

        let response = handler.handle(request).await;
        self.populate(&plan, &response);
        let cache = match plan {
            CachePlan::Lookup { .. } => CacheStatus::Miss,
            CachePlan::Skip | CachePlan::Bypass => CacheStatus::Bypass,
        };
        Outcome::ServedFromOrigin {
            response,
            cache,
            admission,
        }
    }

    /// Wrap `handler` so its successful results populate the cache.
    pub fn wrap<H: Handler>(&self, handler: H) -> CachingHandler<H> {
        CachingHandler {
            inner: handler,
            pipeline: self.clone(),
        }
    }
}

/// A [`Handler`] that caches what the wrapped handler returns. It never reads
/// the cache itself and leaves the handler's result untouched.
pub struct CachingHandler<H> {
    inner: H,
    pipeline: RequestPipeline,
}

#[async_trait]
impl<H: Handler> Handler for CachingHandler<H> {
    async fn handle(&self, request: &GuardRequest) -> HandlerResponse {
        let response = self.inner.handle(request).await;
        let plan = self.pipeline.plan_cache(request);
        self.pipeline.populate(&plan, &response);
        response
    }
}
