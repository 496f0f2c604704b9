use std::path::PathBuf;

use clap::{Args, Parser, Subcommand, builder::BoolishValueParser};

/// Command-line arguments for the soffio-guard binary.
#[derive(Debug, Parser)]
#[command(
    name = "soffio-guard",
    version,
    about = "Adaptive load guard: response cache, rate limiting and load shedding"
)]
pub struct CliArgs {
    /// Optional path to a configuration file.
    #[arg(
        long = "config-file",
        env = "SOFFIO_GUARD_CONFIG_FILE",
        value_name = "PATH"
    )]
    pub config_file: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Debug, Subcommand, Clone)]
pub enum Command {
    /// Run the guard in front of the upstream origin.
    Serve(Box<ServeArgs>),
    /// Administrative cache operations against the configured store.
    Cache(CacheArgs),
    /// Load and validate settings, then print a summary.
    #[command(name = "check-config")]
    CheckConfig(CheckConfigArgs),
}

#[derive(Debug, Args, Default, Clone)]
pub struct ServeArgs {
    #[command(flatten)]
    pub overrides: ServeOverrides,
}

#[derive(Debug, Args, Default, Clone)]
pub struct StoreOverride {
    /// Override the store backend (redis|memory).
    #[arg(long = "store-backend", value_name = "BACKEND")]
    pub store_backend: Option<String>,

    /// Override the store connection URL.
    #[arg(long = "store-url", value_name = "URL")]
    pub store_url: Option<String>,
}

#[derive(Debug, Args, Default, Clone)]
pub struct ServeOverrides {
    #[command(flatten)]
    pub store: StoreOverride,

    /// Override the public listener host.
    #[arg(long = "server-host", value_name = "HOST")]
    pub server_host: Option<String>,

    /// Override the public listener port.
    #[arg(long = "server-public-port", value_name = "PORT")]
    pub public_port: Option<u16>,

    /// Override the administrative listener port.
    #[arg(long = "server-admin-port", value_name = "PORT")]
    pub admin_port: Option<u16>,

    /// Trust x-forwarded-for / x-real-ip for the caller address.
    #[arg(
        long = "trust-forwarded-for",
        value_name = "BOOL",
        value_parser = BoolishValueParser::new()
    )]
    pub trust_forwarded_for: Option<bool>,

    /// Override the base log level (trace|debug|info|warn|error).
    #[arg(long = "log-level", value_name = "LEVEL")]
    pub log_level: Option<String>,

    /// Toggle JSON logging.
    #[arg(
        long = "log-json",
        value_name = "BOOL",
        value_parser = BoolishValueParser::new()
    )]
    pub log_json: Option<bool>,

    /// Toggle the response cache.
    #[arg(
        long = "cache-enabled",
        value_name = "BOOL",
        value_parser = BoolishValueParser::new()
    )]
    pub cache_enabled: Option<bool>,

    /// Override the number of cached entries that triggers eviction.
    #[arg(long = "cache-max-entries", value_name = "COUNT")]
    pub cache_max_entries: Option<u64>,

    /// Override the event loop lag threshold.
    #[arg(long = "load-max-lag-ms", value_name = "MILLIS")]
    pub load_max_lag_ms: Option<u64>,

    /// Override the upstream origin URL.
    #[arg(long = "upstream-url", value_name = "URL")]
    pub upstream_url: Option<String>,
}

#[derive(Debug, Args, Clone)]
pub struct CacheArgs {
    #[command(subcommand)]
    pub command: CacheCommand,
}

#[derive(Debug, Subcommand, Clone)]
pub enum CacheCommand {
    /// Delete every cached response and the recency index.
    Clear(CacheClearArgs),
    /// Delete cached responses whose key starts with PREFIX.
    Invalidate(CacheInvalidateArgs),
}

#[derive(Debug, Args, Clone)]
pub struct CacheClearArgs {
    #[command(flatten)]
    pub store: StoreOverride,
}

#[derive(Debug, Args, Clone)]
pub struct CacheInvalidateArgs {
    #[command(flatten)]
    pub store: StoreOverride,

    /// Cache key prefix, usually a route namespace such as `posts:`.
    #[arg(value_name = "PREFIX")]
    pub prefix: String,
}

#[derive(Debug, Args, Default, Clone)]
pub struct CheckConfigArgs {
    #[command(flatten)]
    pub overrides: ServeOverrides,
}
