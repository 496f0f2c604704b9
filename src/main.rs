use std::{net::SocketAddr, process, sync::Arc, time::Duration};

use soffio_guard::{
    cache::{CacheConfig, CacheStore},
    clock::{Clock, SystemClock},
    config::{self, StoreBackend},
    error::AppError,
    infra::{
        error::InfraError,
        http::{self, AdminState, UpstreamProxy},
        telemetry,
    },
    load::{LoadConfig, LoadMonitor},
    pipeline::{RequestConfig, RequestPipeline, RouteTable},
    rate_limit::{RateLimiter, TierConfig},
    store::{EphemeralStore, MemoryStore, RedisStore, RedisStoreConfig},
};
use tokio::try_join;
use tracing::{Dispatch, Level, dispatcher, error, info, warn};
use tracing_subscriber::fmt as tracing_fmt;

#[tokio::main]
async fn main() {
    if let Err(error) = run().await {
        report_application_error(&error);
        process::exit(1);
    }
}

fn report_application_error(error: &AppError) {
    if dispatcher::has_been_set() {
        error!(error = %error, "application error");
        return;
    }

    let subscriber = tracing_fmt().with_max_level(Level::ERROR).finish();
    let dispatch = Dispatch::new(subscriber);
    dispatcher::with_default(&dispatch, || {
        error!(error = %error, "application error");
    });
}

async fn run() -> Result<(), AppError> {
    let (cli_args, settings) = config::load_with_cli()?;

    let command = cli_args
        .command
        .unwrap_or(config::Command::Serve(Box::<config::ServeArgs>::default()));

    telemetry::init(&settings.logging)?;

    match command {
        config::Command::Serve(_) => run_serve(settings).await,
        config::Command::Cache(args) => run_cache(settings, args).await,
        config::Command::CheckConfig(_) => run_check_config(&settings),
    }
}

async fn run_serve(settings: config::Settings) -> Result<(), AppError> {
    let store = connect_store(&settings.store)?;
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);

    let cache = CacheStore::new(
        store.clone(),
        clock.clone(),
        CacheConfig::from(&settings.cache),
    );
    let limiter = RateLimiter::new(
        store.clone(),
        clock,
        settings
            .rate_limit
            .tiers
            .iter()
            .map(TierConfig::from)
            .collect(),
        settings.store.namespace.clone(),
    )?;
    let (load, monitor_handle) = LoadMonitor::spawn(&LoadConfig::from(&settings.load));

    let request_config = RequestConfig {
        identity_header: settings.identity.header.clone(),
        trust_identity_header: settings.identity.trust_header,
        trust_forwarded_for: settings.server.trust_forwarded_for,
    };
    let pipeline = RequestPipeline::new(
        load.clone(),
        limiter,
        Some(cache.clone()),
        RouteTable::from(settings.routes.as_slice()),
        request_config,
    )?;
    let proxy = UpstreamProxy::new(settings.upstream.url.clone(), settings.upstream.timeout)?;

    let admin_state = AdminState {
        load,
        cache,
        store,
    };

    let result = serve_http(&settings, pipeline, proxy, admin_state).await;

    if let Some(handle) = monitor_handle {
        handle.abort();
        let _ = handle.await;
    }

    result
}

async fn serve_http(
    settings: &config::Settings,
    pipeline: RequestPipeline,
    proxy: UpstreamProxy,
    admin_state: AdminState,
) -> Result<(), AppError> {
    let public_router = http::build_router(pipeline, proxy.clone());
    let admin_router = http::build_admin_router(admin_state);

    let public_listener = tokio::net::TcpListener::bind(settings.server.public_addr)
        .await
        .map_err(InfraError::from)?;
    let admin_listener = tokio::net::TcpListener::bind(settings.server.admin_addr)
        .await
        .map_err(InfraError::from)?;

    info!(
        target: "soffio_guard::http",
        public = %settings.server.public_addr,
        admin = %settings.server.admin_addr,
        upstream = proxy.base_url(),
        "guard listening"
    );

    let public_server = axum::serve(
        public_listener,
        public_router.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal());
    let admin_server = axum::serve(admin_listener, admin_router.into_make_service())
        .with_graceful_shutdown(shutdown_signal());

    let grace = settings.server.graceful_shutdown;
    tokio::select! {
        result = async { try_join!(public_server, admin_server) } => {
            result.map_err(|err| AppError::unexpected(format!("server error: {err}")))?;
        }
        _ = shutdown_deadline(grace) => {
            warn!(
                target: "soffio_guard::http",
                grace_secs = grace.as_secs(),
                "graceful shutdown deadline elapsed; dropping open connections"
            );
        }
    }

    Ok(())
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        warn!(target: "soffio_guard::http", error = %err, "failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
}

async fn shutdown_deadline(grace: Duration) {
    shutdown_signal().await;
    info!(target: "soffio_guard::http", "shutdown requested; draining connections");
    tokio::time::sleep(grace).await;
}

async fn run_cache(settings: config::Settings, args: config::CacheArgs) -> Result<(), AppError> {
    let store = connect_store(&settings.store)?;
    store.ping().await.map_err(InfraError::from)?;

    let cache = CacheStore::new(store, Arc::new(SystemClock), CacheConfig::from(&settings.cache));

    match args.command {
        config::CacheCommand::Clear(_) => {
            cache.clear().await;
            info!(target: "soffio_guard::cache", "cache cleared");
        }
        config::CacheCommand::Invalidate(invalidate) => {
            if invalidate.prefix.is_empty() {
                return Err(AppError::validation(
                    "cache invalidate requires a non-empty prefix; use `cache clear` instead",
                ));
            }
            let removed = cache.invalidate(&invalidate.prefix).await;
            info!(
                target: "soffio_guard::cache",
                prefix = %invalidate.prefix,
                removed,
                "cache invalidated"
            );
        }
    }

    Ok(())
}

fn run_check_config(settings: &config::Settings) -> Result<(), AppError> {
    println!("public listener:  {}", settings.server.public_addr);
    println!("admin listener:   {}", settings.server.admin_addr);
    println!(
        "store:            {} {} (namespace `{}`)",
        settings.store.backend.as_str(),
        settings.store.url,
        settings.store.namespace
    );
    println!(
        "cache:            enabled={} ttl={}s max_entries={} evict={}%",
        settings.cache.enabled,
        settings.cache.default_ttl_seconds,
        settings.cache.max_entries,
        settings.cache.eviction_percent
    );
    println!(
        "load:             enabled={} max_lag={}ms sample={}ms",
        settings.load.enabled, settings.load.max_lag_ms, settings.load.sample_interval_ms
    );
    for tier in &settings.rate_limit.tiers {
        println!(
            "tier {:<12} {} per {}ms by {}",
            tier.name,
            tier.max_requests,
            tier.window_ms,
            tier.subject.as_str()
        );
    }
    for route in &settings.routes {
        println!(
            "route {:<11} tiers=[{}] cache={}",
            route.prefix,
            route.tiers.join(","),
            route
                .cache
                .as_ref()
                .map_or("-", |cache| cache.namespace.as_str())
        );
    }
    println!("upstream:         {}", settings.upstream.url);
    Ok(())
}

fn connect_store(settings: &config::StoreSettings) -> Result<Arc<dyn EphemeralStore>, AppError> {
    match settings.backend {
        StoreBackend::Redis => {
            let store = RedisStore::connect(&RedisStoreConfig {
                url: settings.url.clone(),
                pool_size: settings.pool_size.get() as usize,
                timeout: settings.timeout,
            })
            .map_err(InfraError::from)?;
            Ok(Arc::new(store))
        }
        StoreBackend::Memory => {
            warn!(
                target: "soffio_guard::store",
                "using the in-process memory store; state is not shared between instances"
            );
            Ok(Arc::new(MemoryStore::new()))
        }
    }
}
