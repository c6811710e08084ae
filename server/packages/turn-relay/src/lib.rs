use std::net::SocketAddr;
use std::sync::Arc;

use app::build_router;
use axum::http::HeaderValue;
use relay::{Relay, RelayConfig};
use tower_http::cors::{AllowOrigin, Any, CorsLayer};

pub mod agent_socket;
pub mod app;
pub mod dispatch;
pub mod hub;
pub mod normalize;
pub mod prompt;
pub mod relay;
pub mod responses;
pub mod sanitize;
pub mod session;
pub mod sse;

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub relay: RelayConfig,
    pub cors_allow_origins: Vec<String>,
}

pub async fn run_server(
    config: ServerConfig,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let relay = Arc::new(Relay::new(config.relay.clone()));
    run_server_with_relay(&config, relay).await
}

pub async fn run_server_with_relay(
    config: &ServerConfig,
    relay: Arc<Relay>,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let mut app = build_router(relay);
    if let Some(cors) = build_cors_layer(&config.cors_allow_origins)? {
        app = app.layer(cors);
    }

    let addr: SocketAddr = format!("{}:{}", config.host, config.port).parse()?;
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!(
        addr = %addr,
        turn_timeout_ms = config.relay.turn_timeout.as_millis() as u64,
        "turn-relay listening"
    );

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;
    Ok(())
}

fn build_cors_layer(
    origins: &[String],
) -> Result<Option<CorsLayer>, Box<dyn std::error::Error + Send + Sync>> {
    if origins.is_empty() {
        return Ok(None);
    }
    let layer = CorsLayer::new().allow_methods(Any).allow_headers(Any);
    if origins.iter().any(|origin| origin == "*") {
        return Ok(Some(layer.allow_origin(Any)));
    }
    let origins = origins
        .iter()
        .map(|origin| origin.parse::<HeaderValue>())
        .collect::<Result<Vec<_>, _>>()?;
    Ok(Some(layer.allow_origin(AllowOrigin::list(origins))))
}

async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
    tracing::info!("shutdown requested");
}
