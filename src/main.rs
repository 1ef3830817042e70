use apiproxy::apicache::ApiClient;
use apiproxy::cache::{spawn_sweeper, Cacher, SqliteCache};
use apiproxy::config::{self, Config};
use apiproxy::gateway::{build_router, GatewayState, Registry, WorkerPool, WorkerPoolConfig};
use apiproxy::{AppError, AppResult};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

const SWEEP_INTERVAL: Duration = Duration::from_secs(30 * 60);
const DEFAULT_CONFIG_TEMPLATE: &str = "apiproxy.toml.default";

#[derive(Parser)]
#[command(
    name = "apiproxy",
    version,
    about = "Caching, rate-limiting reverse proxy for XML API upstreams"
)]
struct Cli {
    /// Path to the configuration file.
    #[arg(long, default_value = "apiproxy.toml")]
    config: PathBuf,

    /// Enable verbose logging.
    #[arg(long)]
    debug: bool,

    /// Clear the persisted cache at startup instead of reloading it.
    #[arg(long)]
    fast_start: bool,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Write a default configuration file and exit.
    Create,
}

fn main() -> AppResult<()> {
    let cli = Cli::parse();

    if matches!(cli.command, Some(Command::Create)) {
        config::write_default(Path::new(DEFAULT_CONFIG_TEMPLATE))?;
        println!("created {DEFAULT_CONFIG_TEMPLATE}");
        return Ok(());
    }

    let mut cfg = if cli.config.exists() {
        config::load(&cli.config)?
    } else {
        eprintln!(
            "config file {} not found, using defaults",
            cli.config.display()
        );
        Config::default()
    };
    if cli.debug {
        cfg.logging.debug = true;
    }
    if cli.fast_start {
        cfg.fast_start = true;
    }

    init_tracing(&cfg)?;

    let mut builder = tokio::runtime::Builder::new_multi_thread();
    if cfg.threads > 0 {
        builder.worker_threads(cfg.threads);
    }
    let runtime = builder
        .enable_all()
        .build()
        .map_err(|e| AppError::new("RUNTIME_INIT", e.to_string()))?;
    runtime.block_on(run(cfg))
}

fn init_tracing(cfg: &Config) -> AppResult<()> {
    let default_level = if cfg.logging.debug { "debug" } else { "info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    match cfg.logging.log_file.as_deref() {
        Some(path) if !path.trim().is_empty() => {
            let file = std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .map_err(|e| AppError::new("LOG_FILE_OPEN", format!("{path}: {e}")))?;
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_writer(std::sync::Mutex::new(file))
                .with_ansi(false)
                .init();
        }
        _ => {
            tracing_subscriber::fmt().with_env_filter(filter).init();
        }
    }
    Ok(())
}

async fn run(cfg: Config) -> AppResult<()> {
    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        workers = cfg.workers,
        "apiproxy starting up"
    );

    tracing::info!("initializing cache at {}", cfg.cache_path.display());
    let cache: Arc<dyn Cacher> = Arc::new(SqliteCache::open(&cfg.cache_path)?);
    if cfg.fast_start {
        let cleared = cache.purge_all()?;
        tracing::info!(cleared, "cleared existing cache");
    } else {
        let swept = cache.purge_expired()?;
        let stats = cache.stats()?;
        tracing::info!(entries = stats.entries, swept, "cache loaded");
    }
    let _sweeper = spawn_sweeper(cache.clone(), SWEEP_INTERVAL);

    let client = Arc::new(ApiClient::new(
        &cfg.base_url,
        &cfg.user_agent,
        Duration::from_secs(cfg.api_timeout_secs),
        cfg.retries,
        cache.clone(),
    )?);

    let pool = Arc::new(WorkerPool::start(
        client.clone(),
        WorkerPoolConfig {
            workers: cfg.workers,
            requests_per_second: cfg.requests_per_second,
            max_errors: cfg.max_errors,
            error_period: Duration::from_secs(cfg.error_period_secs),
        },
    ));

    let mut registry = Registry::with_defaults();
    registry.extend(&cfg.extra_pages);
    tracing::info!(pages = registry.len(), "handler registry ready");

    let state = GatewayState {
        client,
        pool: pool.clone(),
        registry: Arc::new(registry),
        cache,
        retries: cfg.retries,
        log_requests: cfg.logging.log_requests,
        censor_log: cfg.logging.censor_log,
    };

    let listener = std::net::TcpListener::bind(&cfg.listen)
        .map_err(|e| AppError::new("BIND_FAILED", format!("{}: {e}", cfg.listen)))?;
    listener.set_nonblocking(true)?;
    let listener = tokio::net::TcpListener::from_std(listener)?;
    tracing::info!(listen = %cfg.listen, "listening");

    axum::serve(listener, build_router(state))
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
        })
        .await?;

    tracing::info!("shutting down");
    pool.close().await;
    Ok(())
}
