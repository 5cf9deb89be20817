//! moldwatch-service - live machine telemetry over REST and WebSocket.
//!
//! Run with: `cargo run -p moldwatch-service`

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use axum::Router;
use clap::Parser;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use moldwatch_core::{HttpHistoryEndpoint, TelemetryHub, WebSocketTransport};
use moldwatch_service::{AppState, Config, DeviceConfig, api, ws};

/// moldwatch-service - live machine telemetry over REST and WebSocket.
#[derive(Parser, Debug)]
#[command(name = "moldwatch-service")]
#[command(version, about, long_about = None)]
struct Args {
    /// Path to configuration file.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Bind address (overrides config).
    #[arg(short, long)]
    bind: Option<String>,

    /// Telemetry channel URL (overrides config).
    #[arg(long)]
    channel_url: Option<String>,

    /// History endpoint base URL (overrides config).
    #[arg(long)]
    query_url: Option<String>,

    /// Extra device to watch (repeatable).
    #[arg(short, long = "device")]
    devices: Vec<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("moldwatch_service=info".parse()?)
                .add_directive("moldwatch_core=info".parse()?)
                .add_directive("tower_http=debug".parse()?),
        )
        .init();

    let mut config = match &args.config {
        Some(path) => Config::load(path)?,
        None => Config::load_default().unwrap_or_default(),
    };

    if let Some(bind) = args.bind {
        config.server.bind = bind;
    }
    if let Some(url) = args.channel_url {
        config.channel.url = url;
    }
    if let Some(url) = args.query_url {
        config.query.base_url = url;
    }
    for id in args.devices {
        if !config.devices.iter().any(|d| d.id.trim() == id.trim()) {
            config.devices.push(DeviceConfig::new(id));
        }
    }
    config.validate()?;

    let transport = Arc::new(WebSocketTransport::new(config.channel.url.clone()));
    let mut endpoint = HttpHistoryEndpoint::new(&config.query.base_url)?;
    if let Some(token) = &config.query.token {
        endpoint = endpoint.bearer_token(token.clone());
    }
    let hub = TelemetryHub::new(transport, Arc::new(endpoint), config.hub_config())?;

    let state = AppState::new(hub, config.clone());
    let watched = state.watch_configured().await;
    info!("Watching {} configured device(s)", watched);

    // The channel keeps retrying in the background if the first attempt fails
    if let Err(e) = state.hub.connect().await {
        warn!("Telemetry channel not available yet: {}", e);
    }

    let app = Router::new()
        .merge(api::router())
        .merge(ws::router())
        .layer(TraceLayer::new_for_http())
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .with_state(Arc::clone(&state));

    let addr: SocketAddr = config.server.bind.parse()?;
    info!("Starting server on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            info!("Shutdown requested");
        })
        .await?;

    state.shutdown().await;
    Ok(())
}
