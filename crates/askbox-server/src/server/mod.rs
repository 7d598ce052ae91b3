use crate::config::ServerConfig;
use anyhow::{Context, Result};
use askbox_relay::RelayHub;
use axum::{
    extract::State,
    http::{HeaderValue, Method, StatusCode},
    response::{IntoResponse, Json},
    routing::get,
    Router,
};
use serde_json::json;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tower_http::{
    cors::{AllowOrigin, Any, CorsLayer},
    trace::{DefaultMakeSpan, DefaultOnResponse, TraceLayer},
};
use tracing::{info, warn, Level};

pub mod routes;

/// Server application state
pub struct AppState {
    /// Relay hub shared by every socket
    pub hub: RelayHub,
    /// Configuration the server was started with
    pub config: ServerConfig,
    /// Cancelled when the server shuts down
    pub stop_token: CancellationToken,
}

impl AppState {
    pub fn new(config: ServerConfig, stop_token: CancellationToken) -> Self {
        Self {
            hub: RelayHub::new(config.relay_config()),
            config,
            stop_token,
        }
    }
}

/// Start the relay server and run until Ctrl-C.
pub async fn start(config: ServerConfig) -> Result<()> {
    let addr = config.bind_addr();
    let listener = TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind {addr}"))?;

    let stop_token = CancellationToken::new();
    let signal_token = stop_token.clone();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => info!("Shutdown signal received"),
            Err(e) => warn!(error = %e, "Failed to listen for shutdown signal"),
        }
        signal_token.cancel();
    });

    let state = Arc::new(AppState::new(config, stop_token.clone()));
    serve(listener, state, stop_token).await
}

/// Serve the relay on an already bound listener until `stop_token` is
/// cancelled.
pub async fn serve(
    listener: TcpListener,
    state: Arc<AppState>,
    stop_token: CancellationToken,
) -> Result<()> {
    let app = create_router(state);

    let addr = listener.local_addr()?;
    info!("Starting Axum HTTP server on {}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            stop_token.cancelled().await;
            info!("HTTP server received shutdown signal, draining connections");
        })
        .await?;

    Ok(())
}

/// Configure CORS from the allowed origin list.
///
/// A `*` entry, or a list with no valid origins, allows any origin.
fn configure_cors(config: &ServerConfig) -> CorsLayer {
    if config.allows_any_origin() {
        return CorsLayer::permissive();
    }

    let allowed: Vec<HeaderValue> = config
        .allowed_origins
        .iter()
        .filter_map(|o| o.trim().parse().ok())
        .collect();

    if allowed.is_empty() {
        warn!("No valid CORS origins configured, falling back to permissive CORS");
        return CorsLayer::permissive();
    }

    info!(origins = ?allowed, "Configured CORS with explicit allowed origins");
    CorsLayer::new()
        .allow_origin(AllowOrigin::list(allowed))
        .allow_methods([Method::GET, Method::OPTIONS])
        .allow_headers(Any)
}

/// Create the Axum router with all routes and middleware
pub fn create_router(state: Arc<AppState>) -> Router {
    let cors = configure_cors(&state.config);
    let relay_router = routes::websocket::router(state.clone());

    Router::new()
        .route("/health", get(health_handler))
        .with_state(state)
        .merge(relay_router)
        .layer(
            TraceLayer::new_for_http()
                .make_span_with(DefaultMakeSpan::new().level(Level::INFO))
                .on_response(DefaultOnResponse::new().level(Level::INFO)),
        )
        .layer(cors)
}

/// Health check endpoint (for load balancers)
async fn health_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    (
        StatusCode::OK,
        Json(json!({
            "status": "healthy",
            "service": "askbox-server",
            "version": env!("CARGO_PKG_VERSION"),
            "connections": state.hub.connection_count(),
            "registered_users": state.hub.registered_count(),
        })),
    )
}
