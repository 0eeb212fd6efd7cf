//! Market Stream Hub Binary
//!
//! Starts the upstream stream client, the broadcast hub and the HTTP server.
//!
//! # Usage
//!
//! ```bash
//! cargo run --bin market-stream-hub
//! ```
//!
//! # Environment Variables
//!
//! - `MARKET_HUB_STREAMS`: Startup streams, e.g. `btcusdt@ticker,ethusdt@kline_1m`
//!   (default: all-symbol mini tickers)
//! - `MARKET_HUB_STREAM_URL`: Upstream WebSocket host (default: wss://stream.binance.com:9443)
//! - `MARKET_HUB_REST_URL`: Upstream REST host (default: https://api.binance.com)
//! - `MARKET_HUB_SEED_TICKERS`: Seed the ticker cache over REST (default: true)
//! - `MARKET_HUB_HTTP_PORT`: HTTP port (default: 8090)
//! - `OTEL_ENABLED`: Export spans over OTLP (default: false)
//! - `RUST_LOG`: Log filter (default: market_stream_hub=info)

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use market_stream_hub::domain::market::EventKind;
use market_stream_hub::infrastructure::server::{HttpServer, ServerState};
use market_stream_hub::infrastructure::telemetry;
use market_stream_hub::infrastructure::upstream::{RestTickerSource, StreamClient};
use market_stream_hub::{
    BroadcastHub, HubConfig, MarketEventBridge, ResilientExecutor, ResilientHttpClient,
    init_metrics,
};
use tokio::signal;
use tokio_util::sync::CancellationToken;

/// Graceful shutdown timeout.
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(30);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    if rustls::crypto::ring::default_provider()
        .install_default()
        .is_err()
    {
        eprintln!("rustls crypto provider already installed");
    }

    load_dotenv();

    let _telemetry_guard = telemetry::init();

    tracing::info!("Starting Market Stream Hub");

    let _metrics_handle = init_metrics().context("installing Prometheus recorder")?;

    let config = HubConfig::from_env().context("loading configuration")?;
    log_config(&config);

    let shutdown_token = CancellationToken::new();

    // Broadcast hub
    let hub = Arc::new(BroadcastHub::new(config.broadcast_config()));
    hub.start();

    // Upstream client
    let client = Arc::new(StreamClient::new(
        config.stream_client_config(),
        shutdown_token.child_token(),
    ));
    for subscription in config.subscriptions()? {
        client.subscribe(subscription);
    }
    let bridge = MarketEventBridge::shared(Arc::clone(&hub));
    for kind in EventKind::ALL {
        client.on(kind, Arc::clone(&bridge));
    }

    // REST snapshot through the resilient executor
    let executor = ResilientExecutor::new(
        "rest-ticker",
        config.retry_policy(),
        config.circuit_breaker_config(),
    )
    .with_call_timeout(config.upstream.request_timeout)
    .with_cancellation(shutdown_token.child_token());
    let breaker = Arc::clone(executor.breaker());
    let http = ResilientHttpClient::new(executor, config.upstream.request_timeout)
        .context("building HTTP client")?;
    let rest = RestTickerSource::new(http, config.upstream.rest_url.clone());

    if config.upstream.seed_tickers {
        let seed_client = Arc::clone(&client);
        let symbols = config.seed_symbols();
        tokio::spawn(async move {
            if let Err(e) = rest.seed(&seed_client, &symbols).await {
                tracing::warn!(error = %e, "Ticker snapshot unavailable, waiting for live frames");
            }
        });
    }

    let client_task = tokio::spawn(Arc::clone(&client).run());

    // HTTP server
    let state = Arc::new(
        ServerState::new(env!("CARGO_PKG_VERSION"), Arc::clone(&hub), Arc::clone(&client))
            .with_breaker(breaker),
    );
    let server = HttpServer::new(config.bind_address(), state, shutdown_token.clone());
    let server_task = tokio::spawn(async move {
        if let Err(e) = server.run().await {
            tracing::error!(error = %e, "HTTP server error");
        }
    });

    tracing::info!("Market stream hub ready");

    await_shutdown(shutdown_token).await;

    let drain = async {
        client.stop();
        hub.stop().await;
        let _ = client_task.await;
        let _ = server_task.await;
    };
    if tokio::time::timeout(SHUTDOWN_TIMEOUT, drain).await.is_err() {
        tracing::warn!("Graceful shutdown timed out");
    }

    tracing::info!("Market stream hub stopped");
    Ok(())
}

/// Log the parsed configuration.
fn log_config(config: &HubConfig) {
    tracing::info!(
        stream_url = %config.upstream.stream_url,
        streams = config.upstream.streams.len(),
        http_port = config.server.http_port,
        max_channels = config.broadcast.max_channels,
        "Configuration loaded"
    );
    tracing::debug!(
        rest_url = %config.upstream.rest_url,
        seed_tickers = config.upstream.seed_tickers,
        pull_queue_capacity = config.broadcast.pull_queue_capacity,
        "Upstream endpoints"
    );
}

/// Load .env file from current directory or any ancestor directory.
fn load_dotenv() {
    if dotenvy::dotenv().is_ok() {
        return;
    }

    if let Ok(cwd) = std::env::current_dir() {
        let mut dir = cwd.as_path();
        while let Some(parent) = dir.parent() {
            let env_path = parent.join(".env");
            if env_path.exists() {
                let _ = dotenvy::from_path(&env_path);
                return;
            }
            dir = parent;
        }
    }
}

/// Wait for shutdown signal (SIGTERM or SIGINT).
async fn await_shutdown(shutdown_token: CancellationToken) {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!(error = %e, "Ctrl+C handler unavailable");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "SIGTERM handler unavailable");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {
            tracing::info!("Received Ctrl+C, initiating shutdown");
        }
        () = terminate => {
            tracing::info!("Received SIGTERM, initiating shutdown");
        }
    }

    shutdown_token.cancel();

    tracing::info!(
        timeout_secs = SHUTDOWN_TIMEOUT.as_secs(),
        "Graceful shutdown started"
    );
}
