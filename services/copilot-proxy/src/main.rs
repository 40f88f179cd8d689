//! Copilot credential-pool proxy
//!
//! Single-binary Rust service that:
//! 1. Loads a pool of refresh credentials
//! 2. Exchanges the current one for a bearer and keeps it fresh
//! 3. Forwards `/chat/completions` and `/models` to the completion API
//! 4. Fails over to the next healthy credential on rejection
//! 5. Serves the `/tokens` dashboard API and `/usage` token accounting
//!
//! Subcommands `tokens [--watch SECS]`, `switch <index>` and
//! `usage [--hours N]` talk to a running instance instead.

mod config;
mod dashboard;
mod error;
mod limits;
mod metrics;
mod proxy;
mod tokens;
mod usage;

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use axum::Router;
use axum::body::Bytes;
use axum::extract::State;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use clap::{Parser, Subcommand};
use copilot_auth::TokenClient;
use copilot_pool::{Pool, PoolHealth};
use metrics_exporter_prometheus::PrometheusHandle;
use tokio::net::TcpListener;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::config::Config;
use crate::dashboard::DashboardClient;
use crate::limits::RequestLimiter;
use crate::proxy::ProxyState;
use crate::usage::UsageLedger;

/// Time allowed for in-flight requests after a shutdown signal
const DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

/// Shared application state accessible from all handlers
#[derive(Clone)]
struct AppState {
    proxy: ProxyState,
    pool: Pool,
    prometheus: PrometheusHandle,
    started_at: Instant,
}

/// Build the axum router with all routes and shared state.
///
/// Applies a concurrency limit layer based on `max_connections`.
fn build_router(state: AppState, max_connections: usize) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/metrics", get(metrics_handler))
        .route("/chat/completions", post(chat_completions_handler))
        .route("/models", get(models_handler))
        .merge(tokens::router(state.pool.status().clone()))
        .merge(usage::router(state.proxy.usage.clone()))
        .layer(axum::extract::DefaultBodyLimit::max(proxy::MAX_BODY_BYTES))
        .layer(tower::limit::ConcurrencyLimitLayer::new(max_connections))
        .with_state(state)
}

#[derive(Parser, Debug)]
#[command(name = "copilot-proxy", about = "Copilot credential-pool proxy", version)]
struct Cli {
    /// Config file path (overrides CONFIG_PATH)
    #[arg(long, global = true)]
    config: Option<String>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug, PartialEq)]
enum Command {
    /// Run the proxy (the default).
    Serve,

    /// Print the credential table of a running proxy.
    Tokens {
        /// Base URL of the proxy.
        #[arg(long, default_value = dashboard::DEFAULT_URL)]
        url: String,

        /// Keep polling and reprint on change.
        #[arg(long, value_name = "SECS", value_parser = clap::value_parser!(u64).range(1..))]
        watch: Option<u64>,
    },

    /// Make a credential current, cascading past refused ones.
    Switch {
        /// Pool index to switch to.
        index: usize,

        #[arg(long, default_value = dashboard::DEFAULT_URL)]
        url: String,
    },

    /// Print recent per-model token usage of a running proxy.
    Usage {
        /// Look-back period in hours.
        #[arg(long, default_value_t = 1, value_parser = clap::value_parser!(u64).range(1..))]
        hours: u64,

        /// Only report this model.
        #[arg(long)]
        model: Option<String>,

        #[arg(long, default_value = dashboard::DEFAULT_URL)]
        url: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing with JSON output and LOG_LEVEL / RUST_LOG support
    tracing_subscriber::registry()
        .with(
            EnvFilter::try_from_env("LOG_LEVEL")
                .or_else(|_| EnvFilter::try_from_default_env())
                .unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    let cli = Cli::parse();
    match cli.command.unwrap_or(Command::Serve) {
        Command::Serve => serve(cli.config.as_deref()).await,
        Command::Tokens { url, watch: None } => {
            let client = DashboardClient::new(reqwest::Client::new(), url);
            let tokens = client.list().await?;
            print!("{}", dashboard::render_table(&tokens));
            Ok(())
        }
        Command::Tokens {
            url,
            watch: Some(secs),
        } => watch_tokens(url, Duration::from_secs(secs)).await,
        Command::Switch { index, url } => {
            let client = DashboardClient::new(reqwest::Client::new(), url);
            let report = client.switch_with_cascade(index).await?;
            for (skipped, reason) in &report.skipped {
                println!("token {skipped} refused: {reason}");
            }
            println!("token {} is now current", report.index);
            Ok(())
        }
        Command::Usage { hours, model, url } => {
            let client = DashboardClient::new(reqwest::Client::new(), url);
            let report = client.usage(hours, model.as_deref()).await?;
            print!("{}", dashboard::render_usage(&report));
            Ok(())
        }
    }
}

/// Reprint the token table whenever a poll returns a new snapshot, until Ctrl+C.
async fn watch_tokens(url: String, interval: Duration) -> Result<()> {
    let client = DashboardClient::new(reqwest::Client::new(), url);
    let (mut rx, poller) = dashboard::spawn_poller(client, interval);
    loop {
        tokio::select! {
            changed = rx.changed() => {
                if changed.is_err() {
                    break;
                }
                let tokens = rx.borrow_and_update().clone();
                print!("{}", dashboard::render_table(&tokens));
            }
            _ = tokio::signal::ctrl_c() => break,
        }
    }
    drop(rx);
    poller.abort();
    Ok(())
}

async fn serve(cli_config_path: Option<&str>) -> Result<()> {
    info!("starting copilot-proxy");

    // Install Prometheus metrics recorder before any metrics are emitted
    let prometheus_handle = metrics::install_recorder()?;

    let config_path = Config::resolve_path(cli_config_path);
    info!(path = %config_path.display(), "loading configuration");

    let mut config = Config::load(&config_path)
        .with_context(|| format!("failed to load config from {}", config_path.display()))?;

    info!(
        listen_addr = %config.server.listen_addr,
        chat_completions_url = %config.upstream.chat_completions_url,
        credentials = config.pool.refresh_tokens.len(),
        rate_limits = config.rate_limits.len(),
        "configuration loaded"
    );

    let http = reqwest::Client::new();
    let token_client = TokenClient::new(
        http.clone(),
        config.upstream.token_endpoint.clone(),
        config.upstream.editor_version.clone(),
    );
    let pool = Pool::new(config.pool_config(), Arc::new(token_client))
        .context("failed to initialize credential pool")?;

    // Exhaustion is not fatal: the server still starts and /health reports it
    match pool.coordinator().warm_up().await {
        Ok(index) => info!(credential = index, "initial bearer obtained"),
        Err(e) => error!(error = %e, "no credential could be exchanged at startup"),
    }

    if config.pool.refresh_interval_secs > 0 {
        copilot_pool::spawn_refresh_task(
            pool.coordinator().clone(),
            Duration::from_secs(config.pool.refresh_interval_secs),
        );
    }

    let usage = Arc::new(UsageLedger::new(limits::retention_for(&config.rate_limits)));
    let proxy_state = ProxyState {
        client: http,
        coordinator: pool.coordinator().clone(),
        chat_completions_url: config.upstream.chat_completions_url.clone(),
        models_url: config.upstream.models_url.clone(),
        editor_version: config.upstream.editor_version.clone(),
        limiter: Arc::new(RequestLimiter::new(&config.rate_limits, usage.clone())),
        usage,
        requests_total: Arc::new(AtomicU64::new(0)),
        errors_total: Arc::new(AtomicU64::new(0)),
    };

    let app_state = AppState {
        proxy: proxy_state,
        pool,
        prometheus: prometheus_handle,
        started_at: Instant::now(),
    };

    let app = build_router(app_state, config.server.max_connections);

    let listen_addr = config.server.listen_addr;
    let listener = TcpListener::bind(listen_addr)
        .await
        .with_context(|| format!("failed to bind to {listen_addr}"))?;
    info!(addr = %listen_addr, "accepting requests");

    // The drain timeout starts when the shutdown signal fires, not when the
    // server starts: notify the server to drain, then race the drain against
    // the timeout.
    let (shutdown_tx, shutdown_rx) = tokio::sync::oneshot::channel::<()>();

    let server_handle = tokio::spawn(async move {
        axum::serve(listener, app)
            .with_graceful_shutdown(async {
                let _ = shutdown_rx.await;
            })
            .await
    });

    shutdown_signal().await;
    let _ = shutdown_tx.send(());

    match tokio::time::timeout(DRAIN_TIMEOUT, server_handle).await {
        Ok(Ok(Ok(()))) => info!("all in-flight requests drained"),
        Ok(Ok(Err(e))) => error!(error = %e, "server error during shutdown"),
        Ok(Err(e)) => error!(error = %e, "server task panicked"),
        Err(_) => warn!(
            drain_timeout_secs = DRAIN_TIMEOUT.as_secs(),
            "drain timeout exceeded, forcing shutdown"
        ),
    }

    info!("shutdown complete");
    Ok(())
}

/// Health endpoint: pool summary plus request counters.
/// Returns 200 when healthy or degraded, 503 when every credential is in error.
async fn health_handler(State(state): State<AppState>) -> impl IntoResponse {
    let summary = state.pool.status().summary().await;
    let status_code = match summary.status {
        PoolHealth::Healthy | PoolHealth::Degraded => axum::http::StatusCode::OK,
        PoolHealth::Unhealthy => axum::http::StatusCode::SERVICE_UNAVAILABLE,
    };
    let body = serde_json::json!({
        "status": summary.status.as_str(),
        "pool": {
            "total": summary.total,
            "errored": summary.errored,
            "current": summary.current,
        },
        "uptime_seconds": state.started_at.elapsed().as_secs(),
        "requests_served": state.proxy.requests_total.load(Ordering::Relaxed),
        "errors_total": state.proxy.errors_total.load(Ordering::Relaxed),
    });

    (
        status_code,
        [(axum::http::header::CONTENT_TYPE, "application/json")],
        body.to_string(),
    )
}

/// Prometheus metrics endpoint in text exposition format.
async fn metrics_handler(State(state): State<AppState>) -> impl IntoResponse {
    (
        axum::http::StatusCode::OK,
        [(
            axum::http::header::CONTENT_TYPE,
            "text/plain; version=0.0.4; charset=utf-8",
        )],
        state.prometheus.render(),
    )
}

fn request_id() -> String {
    format!("req_{}", uuid::Uuid::new_v4().as_simple())
}

async fn chat_completions_handler(State(state): State<AppState>, body: Bytes) -> Response {
    proxy::chat_completions(&state.proxy, body, request_id()).await
}

async fn models_handler(State(state): State<AppState>) -> Response {
    proxy::models(&state.proxy, request_id()).await
}

/// Wait for SIGTERM or SIGINT for graceful shutdown.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!(error = %e, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("received SIGINT, shutting down"),
        _ = terminate => info!("received SIGTERM, shutting down"),
    }
}
