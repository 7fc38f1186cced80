//! tiercache server
//!
//! Runs a cache coordinator next to its invalidation hub and exposes:
//!
//! ```text
//! ┌───────────────────────────────────────────────────────┐
//! │                    tiercache server                   │
//! ├───────────────────────────────────────────────────────┤
//! │  ws://<ws-addr>        invalidation subscribers       │
//! │  http://<http-addr>    /healthz /readyz /metrics      │
//! └───────────────────────────────────────────────────────┘
//! ```

use std::convert::Infallible;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use http_body_util::Full;
use hyper::body::{Bytes, Incoming};
use hyper::header::{HeaderValue, CONTENT_TYPE};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn, Level};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use tiercache::broadcast::{serve_websocket, CompositeBroadcaster, LoggingBroadcaster};
use tiercache::cache::PostgresStore;
use tiercache::{CacheCoordinator, CoordinatorConfig, InvalidationHub, Result, TierKind, TierStore};

// =============================================================================
// CLI Arguments
// =============================================================================

/// Multi-tier cache coordinator with WebSocket invalidation
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// YAML configuration file; flags below override it
    #[arg(long, env = "TIERCACHE_CONFIG")]
    config: Option<PathBuf>,

    /// Tiers to enable, comma separated (memory, networked, durable)
    #[arg(long, env = "TIERCACHE_TIERS", value_delimiter = ',')]
    tiers: Vec<TierKind>,

    /// Redis URL for the networked tier
    #[arg(long, env = "REDIS_URL")]
    redis_url: Option<String>,

    /// PostgreSQL URL for the durable tier
    #[arg(long, env = "DATABASE_URL")]
    postgres_url: Option<String>,

    /// Invalidation WebSocket bind address
    #[arg(long, env = "WS_ADDR", default_value = "0.0.0.0:8080")]
    ws_addr: SocketAddr,

    /// Health and metrics server bind address
    #[arg(long, env = "HTTP_ADDR", default_value = "0.0.0.0:8081")]
    http_addr: SocketAddr,

    /// Seconds between sweeps of expired durable rows (0 disables)
    #[arg(long, env = "PURGE_INTERVAL_SECONDS", default_value = "300")]
    purge_interval_seconds: u64,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    log_level: String,

    /// Output logs as JSON
    #[arg(long, env = "LOG_JSON")]
    log_json: bool,
}

impl Args {
    fn coordinator_config(&self) -> Result<CoordinatorConfig> {
        let mut config = match &self.config {
            Some(path) => CoordinatorConfig::from_yaml_file(path)?,
            None => CoordinatorConfig::default(),
        };
        if !self.tiers.is_empty() {
            config.tiers = self.tiers.clone();
        }
        if let Some(url) = &self.redis_url {
            config.redis.url = url.clone();
        }
        if let Some(url) = &self.postgres_url {
            config.postgres.url = url.clone();
        }
        Ok(config)
    }
}

// =============================================================================
// Main
// =============================================================================

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_logging(&args);

    info!("Starting tiercache {}", tiercache::VERSION);
    let config = args.coordinator_config()?;
    info!("  Tiers: {}", config.tier_set());
    info!("  WebSocket address: {}", args.ws_addr);
    info!("  HTTP address: {}", args.http_addr);

    let hub = Arc::new(InvalidationHub::new());
    let broadcaster = CompositeBroadcaster::new()
        .with_broadcaster(hub.clone())
        .with_broadcaster(Arc::new(LoggingBroadcaster::new()));

    let mut builder = CacheCoordinator::builder().broadcaster(Arc::new(broadcaster));

    // built here rather than by the coordinator so the sweeper can reach it
    let durable = if config.tier_set().contains(TierKind::Durable) {
        let store = Arc::new(PostgresStore::connect(&config.postgres).await?);
        builder = builder.store(store.clone());
        Some(store)
    } else {
        None
    };

    let cache = builder.config(config).build().await?;

    let report = cache.ping().await;
    for failure in report.failures() {
        warn!(tier = %failure.tier, reason = %failure.reason, "tier not reachable at startup");
    }

    let shutdown = CancellationToken::new();

    let ws_listener = TcpListener::bind(args.ws_addr).await?;
    let ws_task = tokio::spawn(serve_websocket(ws_listener, hub, shutdown.clone()));

    let http_listener = TcpListener::bind(args.http_addr).await?;
    let http_task = tokio::spawn(run_http_server(http_listener, cache.clone(), shutdown.clone()));

    if let (Some(store), true) = (durable, args.purge_interval_seconds > 0) {
        tokio::spawn(run_purge_loop(
            store,
            Duration::from_secs(args.purge_interval_seconds),
            shutdown.clone(),
        ));
    }

    tokio::signal::ctrl_c().await?;
    info!("Shutdown signal received");
    shutdown.cancel();

    if let Ok(Err(e)) = ws_task.await {
        error!("WebSocket server error: {}", e);
    }
    if let Ok(Err(e)) = http_task.await {
        error!("HTTP server error: {}", e);
    }

    info!("tiercache shutdown complete");
    Ok(())
}

// =============================================================================
// Logging Setup
// =============================================================================

fn init_logging(args: &Args) {
    let level = match args.log_level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let mut filter = EnvFilter::from_default_env().add_directive(level.into());
    for directive in ["hyper=warn", "tungstenite=info", "sqlx=warn"] {
        if let Ok(directive) = directive.parse() {
            filter = filter.add_directive(directive);
        }
    }

    if args.log_json {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_target(true))
            .init();
    }
}

// =============================================================================
// Health & Metrics Server
// =============================================================================

fn text_response(status: StatusCode, body: impl Into<Bytes>) -> Response<Full<Bytes>> {
    let mut response = Response::new(Full::new(body.into()));
    *response.status_mut() = status;
    response
}

async fn handle_http(
    req: Request<Incoming>,
    cache: CacheCoordinator,
) -> std::result::Result<Response<Full<Bytes>>, Infallible> {
    let response = match req.uri().path() {
        "/healthz" | "/livez" => text_response(StatusCode::OK, "ok"),
        "/readyz" => {
            let report = cache.ping().await;
            if report.is_complete() {
                text_response(StatusCode::OK, "ok")
            } else {
                let failed: Vec<String> = report
                    .failures()
                    .iter()
                    .map(|f| format!("{}: {}", f.tier, f.reason))
                    .collect();
                text_response(StatusCode::SERVICE_UNAVAILABLE, failed.join("\n"))
            }
        }
        "/metrics" => match cache.metrics_text() {
            Ok(body) => {
                let mut response = text_response(StatusCode::OK, body);
                response.headers_mut().insert(
                    CONTENT_TYPE,
                    HeaderValue::from_static("text/plain; version=0.0.4"),
                );
                response
            }
            Err(e) => text_response(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
        },
        _ => text_response(StatusCode::NOT_FOUND, "not found"),
    };
    Ok(response)
}

async fn run_http_server(
    listener: TcpListener,
    cache: CacheCoordinator,
    shutdown: CancellationToken,
) -> Result<()> {
    info!("HTTP server listening on {}", listener.local_addr()?);

    loop {
        let (stream, _) = tokio::select! {
            _ = shutdown.cancelled() => return Ok(()),
            accepted = listener.accept() => accepted?,
        };

        let io = TokioIo::new(stream);
        let cache = cache.clone();

        tokio::spawn(async move {
            let service = service_fn(move |req| handle_http(req, cache.clone()));
            if let Err(e) = http1::Builder::new().serve_connection(io, service).await {
                tracing::error!("HTTP connection error: {}", e);
            }
        });
    }
}

// =============================================================================
// Durable Tier Maintenance
// =============================================================================

async fn run_purge_loop(store: Arc<PostgresStore>, every: Duration, shutdown: CancellationToken) {
    let mut ticker = tokio::time::interval(every);
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => return,
            _ = ticker.tick() => {}
        }
        match store.purge_expired().await {
            Ok(0) => {}
            Ok(removed) => info!(removed, "purged expired durable rows"),
            Err(e) => warn!(tier = %store.kind(), error = %e, "durable purge failed"),
        }
    }
}
