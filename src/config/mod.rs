//! Configuration layer: typed settings with layered precedence (file → env → CLI).

mod cli;

use std::{
    collections::BTreeMap,
    net::SocketAddr,
    num::{NonZeroU32, NonZeroU64, NonZeroUsize},
    str::FromStr,
    time::Duration,
};

use axum::http::{HeaderName, Method};
use clap::Parser;
use config::{Config, Environment, File};
use serde::Deserialize;
use thiserror::Error;
use tracing::level_filters::LevelFilter;

use crate::cache::{
    DEFAULT_EVICTION_PERCENT, DEFAULT_MAX_BODY_BYTES, DEFAULT_MAX_ENTRIES, DEFAULT_NAMESPACE,
    DEFAULT_TTL_SECONDS,
};
use crate::load::{DEFAULT_MAX_LAG_MS, DEFAULT_SAMPLE_INTERVAL_MS};
use crate::rate_limit::SubjectSource;

pub use cli::{
    CacheArgs, CacheClearArgs, CacheCommand, CacheInvalidateArgs, CheckConfigArgs, CliArgs,
    Command, ServeArgs, ServeOverrides, StoreOverride,
};

const DEFAULT_CONFIG_BASENAME: &str = "config/default";
const LOCAL_CONFIG_BASENAME: &str = "soffio-guard";
const ENV_PREFIX: &str = "SOFFIO_GUARD";
const DEFAULT_HOST: &str = "127.0.0.1";
const DEFAULT_PUBLIC_PORT: u16 = 3100;
const DEFAULT_ADMIN_PORT: u16 = 3101;
const DEFAULT_GRACEFUL_SHUTDOWN_SECS: u64 = 30;
const DEFAULT_STORE_URL: &str = "redis://127.0.0.1:6379";
const DEFAULT_STORE_POOL_SIZE: u64 = 16;
const DEFAULT_STORE_TIMEOUT_MS: u64 = 250;
const DEFAULT_TIER_WINDOW_MS: u64 = 60_000;
const DEFAULT_TIER_MESSAGE: &str = "Too many requests, please try again later.";
const DEFAULT_IDENTITY_HEADER: &str = "x-authenticated-user";
const DEFAULT_UPSTREAM_URL: &str = "http://127.0.0.1:3000";
const DEFAULT_UPSTREAM_TIMEOUT_MS: u64 = 10_000;

/// Fully-resolved deployment settings after precedence resolution and validation.
#[derive(Debug, Clone)]
pub struct Settings {
    pub server: ServerSettings,
    pub logging: LoggingSettings,
    pub store: StoreSettings,
    pub cache: CacheSettings,
    pub load: LoadSettings,
    pub rate_limit: RateLimitSettings,
    pub identity: IdentitySettings,
    pub routes: Vec<RouteSettings>,
    pub upstream: UpstreamSettings,
}

#[derive(Debug, Clone)]
pub struct ServerSettings {
    pub public_addr: SocketAddr,
    pub admin_addr: SocketAddr,
    pub trust_forwarded_for: bool,
    pub graceful_shutdown: Duration,
}

#[derive(Debug, Clone)]
pub struct LoggingSettings {
    pub level: LevelFilter,
    pub format: LogFormat,
}

#[derive(Debug, Clone, Copy)]
pub enum LogFormat {
    Json,
    Compact,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreBackend {
    Redis,
    /// Process-local keyspace. Counts and cache contents are not shared across
    /// instances, so it is only suitable for a single guard.
    Memory,
}

impl StoreBackend {
    pub fn as_str(self) -> &'static str {
        match self {
            StoreBackend::Redis => "redis",
            StoreBackend::Memory => "memory",
        }
    }
}

impl FromStr for StoreBackend {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "redis" => Ok(StoreBackend::Redis),
            "memory" => Ok(StoreBackend::Memory),
            other => Err(format!("unknown store backend `{other}` (expected redis|memory)")),
        }
    }
}

#[derive(Debug, Clone)]
pub struct StoreSettings {
    pub backend: StoreBackend,
    pub url: String,
    pub pool_size: NonZeroU32,
    pub timeout: Duration,
    pub namespace: String,
}

#[derive(Debug, Clone)]
pub struct CacheSettings {
    pub enabled: bool,
    pub default_ttl_seconds: NonZeroU64,
    pub max_entries: NonZeroUsize,
    pub eviction_percent: u8,
    pub max_body_bytes: usize,
    /// Copied from `store.namespace`.
    pub namespace: String,
}

#[derive(Debug, Clone)]
pub struct LoadSettings {
    pub enabled: bool,
    pub max_lag_ms: u64,
    pub sample_interval_ms: NonZeroU64,
}

#[derive(Debug, Clone)]
pub struct RateLimitSettings {
    pub tiers: Vec<TierSettings>,
}

#[derive(Debug, Clone)]
pub struct TierSettings {
    pub name: String,
    pub window_ms: NonZeroU64,
    pub max_requests: NonZeroU32,
    pub message: String,
    pub subject: SubjectSource,
}

#[derive(Debug, Clone)]
pub struct IdentitySettings {
    pub header: String,
    /// Whether `header` is set by a trusted auth proxy in front of the guard.
    pub trust_header: bool,
}

#[derive(Debug, Clone)]
pub struct RouteSettings {
    pub prefix: String,
    pub methods: Option<Vec<Method>>,
    pub tiers: Vec<String>,
    pub cache: Option<RouteCacheSettings>,
}

#[derive(Debug, Clone)]
pub struct RouteCacheSettings {
    pub namespace: String,
    pub ttl_seconds: Option<NonZeroU64>,
    pub query: Vec<String>,
    pub bypass_headers: Vec<HeaderName>,
}

#[derive(Debug, Clone)]
pub struct UpstreamSettings {
    pub url: String,
    pub timeout: Duration,
}

#[derive(Debug, Error)]
pub enum LoadError {
    #[error("failed to build configuration: {0}")]
    Build(#[from] config::ConfigError),
    #[error("invalid configuration for `{key}`: {reason}")]
    Invalid { key: &'static str, reason: String },
}

impl LoadError {
    fn invalid(key: &'static str, reason: impl Into<String>) -> Self {
        Self::Invalid {
            key,
            reason: reason.into(),
        }
    }
}

/// Load settings using the configured precedence (file → environment → CLI).
pub fn load(cli: &CliArgs) -> Result<Settings, LoadError> {
    let mut builder = Config::builder()
        .add_source(File::with_name(DEFAULT_CONFIG_BASENAME).required(false))
        .add_source(File::with_name(LOCAL_CONFIG_BASENAME).required(false));

    if let Some(path) = cli.config_file.as_ref() {
        builder = builder.add_source(File::from(path.as_path()).required(true));
    }

    builder = builder.add_source(Environment::with_prefix(ENV_PREFIX).separator("__"));

    let mut raw: RawSettings = builder.build()?.try_deserialize()?;

    match cli.command.as_ref() {
        Some(Command::Serve(args)) => raw.apply_serve_overrides(&args.overrides),
        Some(Command::CheckConfig(args)) => raw.apply_serve_overrides(&args.overrides),
        Some(Command::Cache(args)) => match &args.command {
            CacheCommand::Clear(clear) => raw.apply_store_override(&clear.store),
            CacheCommand::Invalidate(invalidate) => raw.apply_store_override(&invalidate.store),
        },
        None => raw.apply_serve_overrides(&ServeOverrides::default()),
    }

    Settings::from_raw(raw)
}

/// Resolve configuration using the supplied CLI arguments, returning both for downstream use.
pub fn load_with_cli() -> Result<(CliArgs, Settings), LoadError> {
    let args = CliArgs::parse();
    let settings = load(&args)?;
    Ok((args, settings))
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawSettings {
    server: RawServerSettings,
    logging: RawLoggingSettings,
    store: RawStoreSettings,
    cache: RawCacheSettings,
    load: RawLoadSettings,
    rate_limit: RawRateLimitSettings,
    identity: RawIdentitySettings,
    routes: Option<Vec<RawRouteSettings>>,
    upstream: RawUpstreamSettings,
}

impl RawSettings {
    fn apply_serve_overrides(&mut self, overrides: &ServeOverrides) {
        if let Some(host) = overrides.server_host.as_ref() {
            self.server.host = Some(host.clone());
        }
        if let Some(port) = overrides.public_port {
            self.server.public_port = Some(port);
        }
        if let Some(port) = overrides.admin_port {
            self.server.admin_port = Some(port);
        }
        if let Some(trust) = overrides.trust_forwarded_for {
            self.server.trust_forwarded_for = Some(trust);
        }
        if let Some(level) = overrides.log_level.as_ref() {
            self.logging.level = Some(level.clone());
        }
        if let Some(json) = overrides.log_json {
            self.logging.json = Some(json);
        }
        if let Some(enabled) = overrides.cache_enabled {
            self.cache.enabled = Some(enabled);
        }
        if let Some(max) = overrides.cache_max_entries {
            self.cache.max_entries = Some(max);
        }
        if let Some(lag) = overrides.load_max_lag_ms {
            self.load.max_lag_ms = Some(lag);
        }
        if let Some(url) = overrides.upstream_url.as_ref() {
            self.upstream.url = Some(url.clone());
        }

        self.apply_store_override(&overrides.store);
    }

    fn apply_store_override(&mut self, overrides: &StoreOverride) {
        if let Some(backend) = overrides.store_backend.as_ref() {
            self.store.backend = Some(backend.clone());
        }
        if let Some(url) = overrides.store_url.as_ref() {
            self.store.url = Some(url.clone());
        }
    }
}

impl Settings {
    fn from_raw(raw: RawSettings) -> Result<Self, LoadError> {
        let RawSettings {
            server,
            logging,
            store,
            cache,
            load,
            rate_limit,
            identity,
            routes,
            upstream,
        } = raw;

        let server = build_server_settings(server)?;
        let logging = build_logging_settings(logging)?;
        let store = build_store_settings(store)?;
        let cache = build_cache_settings(cache, &store.namespace)?;
        let load = build_load_settings(load)?;
        let rate_limit = build_rate_limit_settings(rate_limit)?;
        let identity = build_identity_settings(identity)?;
        let routes = build_route_settings(routes, &rate_limit)?;
        let upstream = build_upstream_settings(upstream)?;

        Ok(Self {
            server,
            logging,
            store,
            cache,
            load,
            rate_limit,
            identity,
            routes,
            upstream,
        })
    }
}

fn build_server_settings(server: RawServerSettings) -> Result<ServerSettings, LoadError> {
    let host = server.host.unwrap_or_else(|| DEFAULT_HOST.to_string());
    let admin_host = server.admin_host.unwrap_or_else(|| host.clone());

    let public_port = server.public_port.unwrap_or(DEFAULT_PUBLIC_PORT);
    if public_port == 0 {
        return Err(LoadError::invalid(
            "server.public_port",
            "port must be greater than zero",
        ));
    }

    let admin_port = server.admin_port.unwrap_or(DEFAULT_ADMIN_PORT);
    if admin_port == 0 {
        return Err(LoadError::invalid(
            "server.admin_port",
            "port must be greater than zero",
        ));
    }

    let public_addr = parse_socket_addr(&host, public_port)
        .map_err(|reason| LoadError::invalid("server.public_addr", reason))?;
    let admin_addr = parse_socket_addr(&admin_host, admin_port)
        .map_err(|reason| LoadError::invalid("server.admin_addr", reason))?;
    if public_addr == admin_addr {
        return Err(LoadError::invalid(
            "server.admin_port",
            "admin listener must not share the public address",
        ));
    }

    let graceful_secs = server
        .graceful_shutdown_seconds
        .unwrap_or(DEFAULT_GRACEFUL_SHUTDOWN_SECS);
    if graceful_secs == 0 {
        return Err(LoadError::invalid(
            "server.graceful_shutdown_seconds",
            "must be greater than zero",
        ));
    }

    Ok(ServerSettings {
        public_addr,
        admin_addr,
        trust_forwarded_for: server.trust_forwarded_for.unwrap_or(false),
        graceful_shutdown: Duration::from_secs(graceful_secs),
    })
}

fn build_logging_settings(logging: RawLoggingSettings) -> Result<LoggingSettings, LoadError> {
    let level = match logging.level {
        Some(level) => LevelFilter::from_str(level.as_str()).map_err(|err| {
            LoadError::invalid("logging.level", format!("failed to parse: {err}"))
        })?,
        None => LevelFilter::INFO,
    };

    let format = if logging.json.unwrap_or(false) {
        LogFormat::Json
    } else {
        LogFormat::Compact
    };

    Ok(LoggingSettings { level, format })
}

fn build_store_settings(store: RawStoreSettings) -> Result<StoreSettings, LoadError> {
    let backend = match store.backend {
        Some(value) => StoreBackend::from_str(&value)
            .map_err(|reason| LoadError::invalid("store.backend", reason))?,
        None => StoreBackend::Redis,
    };

    let url = store
        .url
        .map(|value| value.trim().to_string())
        .unwrap_or_else(|| DEFAULT_STORE_URL.to_string());
    if backend == StoreBackend::Redis && url.is_empty() {
        return Err(LoadError::invalid(
            "store.url",
            "must not be empty for the redis backend",
        ));
    }

    let pool_size = non_zero_u32(
        store.pool_size.unwrap_or(DEFAULT_STORE_POOL_SIZE),
        "store.pool_size",
    )?;
    let timeout_ms = non_zero_u64(
        store.timeout_ms.unwrap_or(DEFAULT_STORE_TIMEOUT_MS),
        "store.timeout_ms",
    )?;
    let namespace = store
        .namespace
        .unwrap_or_else(|| DEFAULT_NAMESPACE.to_string());

    Ok(StoreSettings {
        backend,
        url,
        pool_size,
        timeout: Duration::from_millis(timeout_ms.get()),
        namespace,
    })
}

fn build_cache_settings(cache: RawCacheSettings, namespace: &str) -> Result<CacheSettings, LoadError> {
    let default_ttl_seconds = non_zero_u64(
        cache.default_ttl_seconds.unwrap_or(DEFAULT_TTL_SECONDS),
        "cache.default_ttl_seconds",
    )?;

    let max_entries_value = cache.max_entries.unwrap_or(DEFAULT_MAX_ENTRIES as u64);
    let max_entries = usize::try_from(max_entries_value)
        .ok()
        .and_then(NonZeroUsize::new)
        .ok_or_else(|| {
            LoadError::invalid("cache.max_entries", "must be greater than zero")
        })?;

    let eviction_percent = cache.eviction_percent.unwrap_or(DEFAULT_EVICTION_PERCENT.into());
    if !(1..=100).contains(&eviction_percent) {
        return Err(LoadError::invalid(
            "cache.eviction_percent",
            "must be between 1 and 100",
        ));
    }

    let max_body_bytes = usize::try_from(
        cache
            .max_body_bytes
            .unwrap_or(DEFAULT_MAX_BODY_BYTES as u64),
    )
    .map_err(|_| {
        LoadError::invalid(
            "cache.max_body_bytes",
            "value exceeds supported range for usize",
        )
    })?;

    Ok(CacheSettings {
        enabled: cache.enabled.unwrap_or(true),
        default_ttl_seconds,
        max_entries,
        eviction_percent: eviction_percent as u8,
        max_body_bytes,
        namespace: namespace.to_string(),
    })
}

fn build_load_settings(load: RawLoadSettings) -> Result<LoadSettings, LoadError> {
    let sample_interval_ms = non_zero_u64(
        load.sample_interval_ms.unwrap_or(DEFAULT_SAMPLE_INTERVAL_MS),
        "load.sample_interval_ms",
    )?;
    Ok(LoadSettings {
        enabled: load.enabled.unwrap_or(true),
        max_lag_ms: load.max_lag_ms.unwrap_or(DEFAULT_MAX_LAG_MS),
        sample_interval_ms,
    })
}

fn default_tiers() -> BTreeMap<String, RawTierSettings> {
    BTreeMap::from([
        (
            "api".to_string(),
            RawTierSettings {
                window_ms: Some(DEFAULT_TIER_WINDOW_MS),
                max_requests: Some(120),
                message: Some("Too many requests from this address, please try again later.".to_string()),
                subject: Some("address".to_string()),
            },
        ),
        (
            "content".to_string(),
            RawTierSettings {
                window_ms: Some(DEFAULT_TIER_WINDOW_MS),
                max_requests: Some(30),
                message: Some("Too many content changes, please slow down.".to_string()),
                subject: Some("identity".to_string()),
            },
        ),
    ])
}

fn build_rate_limit_settings(
    rate_limit: RawRateLimitSettings,
) -> Result<RateLimitSettings, LoadError> {
    let raw_tiers = rate_limit
        .tiers
        .filter(|tiers| !tiers.is_empty())
        .unwrap_or_else(default_tiers);

    let mut tiers = Vec::with_capacity(raw_tiers.len());
    for (name, tier) in raw_tiers {
        if name.trim().is_empty() {
            return Err(LoadError::invalid(
                "rate_limit.tiers",
                "tier names must not be empty",
            ));
        }

        let window_ms = NonZeroU64::new(tier.window_ms.unwrap_or(DEFAULT_TIER_WINDOW_MS))
            .ok_or_else(|| {
                LoadError::invalid(
                    "rate_limit.tiers",
                    format!("tier `{name}`: window_ms must be greater than zero"),
                )
            })?;
        let max_requests = tier
            .max_requests
            .and_then(|value| u32::try_from(value).ok())
            .and_then(NonZeroU32::new)
            .ok_or_else(|| {
                LoadError::invalid(
                    "rate_limit.tiers",
                    format!("tier `{name}`: max_requests must be between 1 and {}", u32::MAX),
                )
            })?;
        let subject = match tier.subject {
            Some(value) => SubjectSource::from_str(&value).map_err(|reason| {
                LoadError::invalid("rate_limit.tiers", format!("tier `{name}`: {reason}"))
            })?,
            None => SubjectSource::Address,
        };

        tiers.push(TierSettings {
            message: tier
                .message
                .unwrap_or_else(|| DEFAULT_TIER_MESSAGE.to_string()),
            name,
            window_ms,
            max_requests,
            subject,
        });
    }

    Ok(RateLimitSettings { tiers })
}

fn build_identity_settings(identity: RawIdentitySettings) -> Result<IdentitySettings, LoadError> {
    let header = identity
        .header
        .unwrap_or_else(|| DEFAULT_IDENTITY_HEADER.to_string())
        .trim()
        .to_ascii_lowercase();
    HeaderName::from_bytes(header.as_bytes())
        .map_err(|err| LoadError::invalid("identity.header", err.to_string()))?;
    Ok(IdentitySettings {
        header,
        trust_header: identity.trust_header.unwrap_or(false),
    })
}

fn build_route_settings(
    routes: Option<Vec<RawRouteSettings>>,
    rate_limit: &RateLimitSettings,
) -> Result<Vec<RouteSettings>, LoadError> {
    let raw_routes = routes.unwrap_or_else(|| {
        vec![RawRouteSettings {
            prefix: "/".to_string(),
            methods: None,
            tiers: vec!["api".to_string()],
            cache: None,
        }]
    });

    let mut settings = Vec::with_capacity(raw_routes.len());
    for route in raw_routes {
        if !route.prefix.starts_with('/') {
            return Err(LoadError::invalid(
                "routes",
                format!("route prefix `{}` must start with `/`", route.prefix),
            ));
        }

        if let Some(tier) = route
            .tiers
            .iter()
            .find(|tier| !rate_limit.tiers.iter().any(|known| &known.name == *tier))
        {
            return Err(LoadError::invalid(
                "routes",
                format!(
                    "route `{}` references unknown rate limit tier `{tier}`",
                    route.prefix
                ),
            ));
        }

        let methods = match route.methods {
            Some(methods) => Some(
                methods
                    .iter()
                    .map(|method| {
                        Method::from_bytes(method.trim().to_ascii_uppercase().as_bytes()).map_err(
                            |err| {
                                LoadError::invalid(
                                    "routes",
                                    format!("route `{}`: method `{method}`: {err}", route.prefix),
                                )
                            },
                        )
                    })
                    .collect::<Result<Vec<_>, _>>()?,
            ),
            None => None,
        };

        let cache = match route.cache {
            Some(cache) => Some(build_route_cache_settings(&route.prefix, cache)?),
            None => None,
        };

        settings.push(RouteSettings {
            prefix: route.prefix,
            methods,
            tiers: route.tiers,
            cache,
        });
    }

    Ok(settings)
}

fn build_route_cache_settings(
    prefix: &str,
    cache: RawRouteCacheSettings,
) -> Result<RouteCacheSettings, LoadError> {
    let namespace = cache.namespace.trim().to_string();
    if namespace.is_empty() {
        return Err(LoadError::invalid(
            "routes",
            format!("route `{prefix}`: cache.namespace must not be empty"),
        ));
    }

    let ttl_seconds = match cache.ttl_seconds {
        Some(value) => Some(NonZeroU64::new(value).ok_or_else(|| {
            LoadError::invalid(
                "routes",
                format!("route `{prefix}`: cache.ttl_seconds must be greater than zero"),
            )
        })?),
        None => None,
    };

    let bypass_headers = cache
        .bypass_headers
        .iter()
        .map(|name| {
            HeaderName::from_bytes(name.trim().to_ascii_lowercase().as_bytes()).map_err(|err| {
                LoadError::invalid(
                    "routes",
                    format!("route `{prefix}`: bypass header `{name}`: {err}"),
                )
            })
        })
        .collect::<Result<Vec<_>, _>>()?;

    Ok(RouteCacheSettings {
        namespace,
        ttl_seconds,
        query: cache.query,
        bypass_headers,
    })
}

fn build_upstream_settings(upstream: RawUpstreamSettings) -> Result<UpstreamSettings, LoadError> {
    let url = upstream
        .url
        .map(|value| value.trim().trim_end_matches('/').to_string())
        .unwrap_or_else(|| DEFAULT_UPSTREAM_URL.to_string());
    if !(url.starts_with("http://") || url.starts_with("https://")) {
        return Err(LoadError::invalid(
            "upstream.url",
            format!("`{url}` must be an http(s) URL"),
        ));
    }

    let timeout_ms = non_zero_u64(
        upstream.timeout_ms.unwrap_or(DEFAULT_UPSTREAM_TIMEOUT_MS),
        "upstream.timeout_ms",
    )?;

    Ok(UpstreamSettings {
        url,
        timeout: Duration::from_millis(timeout_ms.get()),
    })
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawServerSettings {
    host: Option<String>,
    admin_host: Option<String>,
    public_port: Option<u16>,
    admin_port: Option<u16>,
    trust_forwarded_for: Option<bool>,
    graceful_shutdown_seconds: Option<u64>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawLoggingSettings {
    level: Option<String>,
    json: Option<bool>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawStoreSettings {
    backend: Option<String>,
    url: Option<String>,
    pool_size: Option<u64>,
    timeout_ms: Option<u64>,
    namespace: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawCacheSettings {
    enabled: Option<bool>,
    default_ttl_seconds: Option<u64>,
    max_entries: Option<u64>,
    eviction_percent: Option<u64>,
    max_body_bytes: Option<u64>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawLoadSettings {
    enabled: Option<bool>,
    max_lag_ms: Option<u64>,
    sample_interval_ms: Option<u64>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawRateLimitSettings {
    tiers: Option<BTreeMap<String, RawTierSettings>>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawTierSettings {
    window_ms: Option<u64>,
    max_requests: Option<u64>,
    message: Option<String>,
    subject: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawIdentitySettings {
    header: Option<String>,
    trust_header: Option<bool>,
}

#[derive(Debug, Clone, Deserialize)]
struct RawRouteSettings {
    prefix: String,
    #[serde(default)]
    methods: Option<Vec<String>>,
    #[serde(default)]
    tiers: Vec<String>,
    #[serde(default)]
    cache: Option<RawRouteCacheSettings>,
}

#[derive(Debug, Clone, Deserialize)]
struct RawRouteCacheSettings {
    namespace: String,
    #[serde(default)]
    ttl_seconds: Option<u64>,
    #[serde(default)]
    query: Vec<String>,
    #[serde(default)]
    bypass_headers: Vec<String>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawUpstreamSettings {
    url: Option<String>,
    timeout_ms: Option<u64>,
}

fn parse_socket_addr(host: &str, port: u16) -> Result<SocketAddr, String> {
    let candidate = format!("{host}:{port}");
    candidate
        .parse()
        .map_err(|err| format!("invalid address `{candidate}`: {err}"))
}

fn non_zero_u32(value: u64, key: &'static str) -> Result<NonZeroU32, LoadError> {
    if value == 0 {
        return Err(LoadError::invalid(key, "must be greater than zero"));
    }
    let value_u32: u32 = value
        .try_into()
        .map_err(|_| LoadError::invalid(key, "value exceeds supported range for u32"))?;
    NonZeroU32::new(value_u32).ok_or_else(|| LoadError::invalid(key, "must be greater than zero"))
}

fn non_zero_u64(value: u64, key: &'static str) -> Result<NonZeroU64, LoadError> {
    NonZeroU64::new(value).ok_or_else(|| LoadError::invalid(key, "must be greater than zero"))
}
