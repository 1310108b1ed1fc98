use anyhow::{Context, Result};
use axum::http::HeaderValue;
use clap::Parser;
use std::net::SocketAddr;
use std::path::PathBuf;
use tower_http::cors::{AllowOrigin, Any, CorsLayer};
use tower_http::trace::{MakeSpan, TraceLayer};
use tracing::{info, warn};
use tracing_subscriber::prelude::*;
use uuid::Uuid;

use encontro::config::{self, FileConfig, Profile, ServerConfig};
use encontro::{AppState, build_router};

/// Custom span maker that adds a unique request ID to each incoming request
#[derive(Clone)]
struct RequestIdMakeSpan;

impl<B> MakeSpan<B> for RequestIdMakeSpan {
    fn make_span(&mut self, request: &axum::http::Request<B>) -> tracing::Span {
        let request_id = Uuid::new_v4().to_string();
        tracing::info_span!(
            "request",
            method = %request.method(),
            uri = %request.uri(),
            request_id = %request_id,
        )
    }
}

#[derive(Parser)]
#[command(name = "encontro-server")]
#[command(about = "Room-scoped WebRTC signaling relay")]
struct Cli {
    /// Host to bind to (overrides [server].host)
    #[arg(short = 'b', long)]
    host: Option<String>,

    /// Port for the web server (overrides [server].port, 0 = auto-select)
    #[arg(short, long)]
    port: Option<u16>,

    /// Path to the config file
    #[arg(short, long, default_value = config::DEFAULT_CONFIG_FILE)]
    config: PathBuf,

    /// Configuration preset
    #[arg(long, value_enum)]
    profile: Option<Profile>,

    /// Enable debug logging
    #[arg(short, long)]
    debug: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Setup logging
    let default_directive = if cli.debug {
        "encontro=debug,tower_http=debug,info"
    } else {
        "encontro=info,tower_http=info,warn"
    };
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_directive));
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(env_filter)
        .init();

    let mut file_config: FileConfig = config::load_config(&cli.config, cli.profile.as_ref())
        .extract()
        .with_context(|| format!("Failed to load config from {}", cli.config.display()))?;
    if let Some(host) = cli.host {
        file_config.server.host = host;
    }
    if let Some(port) = cli.port {
        file_config.server.port = port;
    }

    info!(
        profile = ?file_config.profile,
        rooms = file_config.rooms.seed.len(),
        auto_create = file_config.rooms.auto_create,
        "Starting encontro signaling relay"
    );

    run_server(file_config).await
}

fn cors_layer(origins: &[String]) -> Result<CorsLayer> {
    if origins.is_empty() {
        return Ok(CorsLayer::permissive());
    }
    let origins = origins
        .iter()
        .map(|o| {
            o.parse::<HeaderValue>()
                .with_context(|| format!("Invalid CORS origin: {}", o))
        })
        .collect::<Result<Vec<_>>>()?;
    Ok(CorsLayer::new()
        .allow_origin(AllowOrigin::list(origins))
        .allow_methods(Any)
        .allow_headers(Any))
}

async fn run_server(file_config: FileConfig) -> Result<()> {
    let server_config = ServerConfig::from_file(&file_config.server);
    let state = AppState::from_config(&file_config);
    let relay = state.relay.clone();
    let grace = relay.config().shutdown_grace;

    let app = build_router(state)
        .layer(TraceLayer::new_for_http().make_span_with(RequestIdMakeSpan))
        .layer(cors_layer(&server_config.cors_origins)?);

    let addr = server_config
        .bind_addr()
        .parse::<SocketAddr>()
        .with_context(|| format!("Invalid bind address {}", server_config.bind_addr()))?;
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind {}", addr))?;
    let actual_addr = listener.local_addr()?;

    info!("Encontro listening on http://{}", actual_addr);
    info!("");
    info!("Endpoints:");
    info!("  GET    /ws/:room              - Signaling WebSocket for a room");
    info!("  GET    /api/rooms             - List rooms");
    info!("  POST   /api/rooms             - Create room");
    info!("  GET    /api/rooms/:id         - Room details with live members");
    info!("  DELETE /api/rooms/:id         - Delete room");
    info!("  GET    /api/rooms/:id/messages - Recorded messages");
    info!("  GET    /health, /metrics      - Observability");

    // Create shutdown signal handler
    let relay_for_signal = relay.clone();
    let shutdown_signal = async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!("Failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
        info!("Received shutdown signal, closing sessions...");
        relay_for_signal.shutdown().await;
    };

    // Run server with graceful shutdown
    let server_result = axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal)
    .await
    .context("Server error");

    // Upgraded sockets are not covered by graceful shutdown; wait for their cleanup
    info!(grace_secs = grace.as_secs(), "Waiting for sessions to finish...");
    if !relay.drain(grace).await {
        warn!("Some sessions did not finish before the grace period expired");
    }

    info!("Shutdown complete");
    server_result
}
