//! ChargeDB node
//!
//! Loads the configuration, wires the data layer over the internal store,
//! warms the configured cache partitions and serves health and metrics
//! endpoints until interrupted.
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                          ChargeDB node                           │
//! ├─────────────────────────────────────────────────────────────────┤
//! │  ┌──────────────┐    ┌──────────────┐    ┌──────────────┐       │
//! │  │  InternalDb  │◀───│ DataManager  │───▶│  CacheTier   │       │
//! │  └──────────────┘    └──────────────┘    └──────┬───────┘       │
//! │                                                 │               │
//! │          /healthz /livez /readyz      /metrics ◀┘               │
//! └─────────────────────────────────────────────────────────────────┘
//! ```

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use clap::Parser;
use http_body_util::Full;
use hyper::body::Bytes;
use hyper::header::{HeaderValue, CONTENT_TYPE};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use tokio::net::TcpListener;
use tracing::{error, info, warn, Level};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use chargedb::adapters::InternalDb;
use chargedb::cache::CacheTier;
use chargedb::config::Config;
use chargedb::datamanager::DataManager;
use chargedb::error::{Error, Result};
use chargedb::metrics;
use chargedb::Context;

// =============================================================================
// CLI Arguments
// =============================================================================

/// ChargeDB - data layer node for real-time charging
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// YAML configuration file; defaults apply when omitted
    #[arg(long, short, env = "CHARGEDB_CONFIG")]
    config: Option<String>,

    /// Skip warming precached partitions at startup
    #[arg(long, env = "CHARGEDB_NO_PRECACHE")]
    no_precache: bool,

    /// Metrics server bind address
    #[arg(long, env = "METRICS_ADDR", default_value = "0.0.0.0:8080")]
    metrics_addr: String,

    /// Health server bind address
    #[arg(long, env = "HEALTH_ADDR", default_value = "0.0.0.0:8081")]
    health_addr: String,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    log_level: String,

    /// Output logs as JSON
    #[arg(long, env = "LOG_JSON")]
    log_json: bool,
}

// =============================================================================
// Main
// =============================================================================

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    init_logging(&args);

    let config = match &args.config {
        Some(path) => Config::from_file(path).map_err(|e| {
            error!("Failed to load configuration from {}: {}", path, e);
            e
        })?,
        None => Config::default(),
    };
    let config = Arc::new(config);

    info!("Starting ChargeDB node");
    info!("  Default tenant: {}", config.general.default_tenant);
    info!("  Default caching: {}", config.general.default_caching);
    info!(
        "  Locking timeout: {}",
        chargedb::config::format_duration(config.general.locking_timeout)
    );
    info!(
        "  Replication policy: {:?}",
        config.connections.replication_policy
    );

    let tier = Arc::new(CacheTier::new(&config.caches));
    let dm = Arc::new(DataManager::new(
        Arc::new(InternalDb::new()),
        tier.clone(),
        Arc::clone(&config),
    ));

    let ready = Arc::new(AtomicBool::new(false));

    // Start health server
    let health_addr = args.health_addr.clone();
    let health_ready = Arc::clone(&ready);
    tokio::spawn(async move {
        if let Err(e) = run_health_server(&health_addr, health_ready).await {
            error!("Health server error: {}", e);
        }
    });

    // Start metrics server
    let metrics_addr = args.metrics_addr.clone();
    let metrics_tier = tier.clone();
    tokio::spawn(async move {
        if let Err(e) = run_metrics_server(&metrics_addr, metrics_tier).await {
            error!("Metrics server error: {}", e);
        }
    });

    let ctx = Context::new();
    if args.no_precache {
        info!("Precaching skipped");
    } else if let Err(e) = dm.precache(&ctx).await {
        warn!("Precaching failed, continuing with a cold cache: {}", e);
    }
    ready.store(true, Ordering::SeqCst);
    info!("Node ready");

    tokio::signal::ctrl_c().await?;
    ctx.cancel();
    info!("Shutdown complete");
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
    if let Ok(directive) = "hyper=warn".parse() {
        filter = filter.add_directive(directive);
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
// HTTP helpers
// =============================================================================

fn respond(status: StatusCode, body: impl Into<Bytes>) -> Response<Full<Bytes>> {
    let mut resp = Response::new(Full::new(body.into()));
    *resp.status_mut() = status;
    resp
}

async fn bind(addr: &str, what: &str) -> Result<TcpListener> {
    let addr: SocketAddr = addr
        .parse()
        .map_err(|e| Error::Internal(format!("Invalid {} server address: {}", what, e)))?;
    let listener = TcpListener::bind(addr)
        .await
        .map_err(|e| Error::Internal(format!("Failed to bind {} server: {}", what, e)))?;
    info!("{} server listening on {}", what, addr);
    Ok(listener)
}

// =============================================================================
// Health Server
// =============================================================================

async fn run_health_server(addr: &str, ready: Arc<AtomicBool>) -> Result<()> {
    let listener = bind(addr, "Health").await?;

    loop {
        let (stream, _) = listener
            .accept()
            .await
            .map_err(|e| Error::Internal(format!("Health server accept error: {}", e)))?;

        let io = TokioIo::new(stream);
        let ready = Arc::clone(&ready);

        tokio::spawn(async move {
            let service = service_fn(move |req: Request<hyper::body::Incoming>| {
                let ready = ready.load(Ordering::SeqCst);
                async move {
                    let response = match req.uri().path() {
                        "/healthz" | "/livez" => respond(StatusCode::OK, "ok"),
                        "/readyz" if ready => respond(StatusCode::OK, "ok"),
                        "/readyz" => respond(StatusCode::SERVICE_UNAVAILABLE, "warming"),
                        _ => respond(StatusCode::NOT_FOUND, "not found"),
                    };
                    Ok::<_, std::convert::Infallible>(response)
                }
            });
            if let Err(e) = http1::Builder::new().serve_connection(io, service).await {
                error!("Health server connection error: {}", e);
            }
        });
    }
}

// =============================================================================
// Metrics Server
// =============================================================================

async fn run_metrics_server(addr: &str, tier: Arc<CacheTier>) -> Result<()> {
    let listener = bind(addr, "Metrics").await?;

    loop {
        let (stream, _) = listener
            .accept()
            .await
            .map_err(|e| Error::Internal(format!("Metrics server accept error: {}", e)))?;

        let io = TokioIo::new(stream);
        let tier = tier.clone();

        tokio::spawn(async move {
            let service = service_fn(move |req: Request<hyper::body::Incoming>| {
                let tier = tier.clone();
                async move {
                    let response = match req.uri().path() {
                        "/metrics" => {
                            metrics::export_cache_stats(&tier);
                            match metrics::render() {
                                Ok((content_type, body)) => {
                                    let mut resp = respond(StatusCode::OK, body);
                                    if let Ok(value) = HeaderValue::from_str(&content_type) {
                                        resp.headers_mut().insert(CONTENT_TYPE, value);
                                    }
                                    resp
                                }
                                Err(e) => {
                                    respond(StatusCode::INTERNAL_SERVER_ERROR, e.to_string())
                                }
                            }
                        }
                        _ => respond(StatusCode::NOT_FOUND, "not found"),
                    };
                    Ok::<_, std::convert::Infallible>(response)
                }
            });
            if let Err(e) = http1::Builder::new().serve_connection(io, service).await {
                error!("Metrics server connection error: {}", e);
            }
        });
    }
}
