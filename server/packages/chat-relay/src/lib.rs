use std::net::SocketAddr;
use std::sync::Arc;

use axum::http::Request;
use thiserror::Error;
use tower_http::cors::{AllowOrigin, Any, CorsLayer};
use tower_http::trace::TraceLayer;

use app::build_router;
use backend::{AgentBackend, EchoBackend, HttpAgentBackend};
use config::RelayConfig;
use memory::{InMemorySessionStore, StaticConfigStore};
use relay::ChatRelay;
use side_channel::HttpBrowserSessionSource;

pub mod app;
pub mod backend;
pub mod cancel;
pub mod config;
pub mod finalizer;
pub mod forwarder;
pub mod heartbeat;
pub mod memory;
pub mod relay;
pub mod request;
pub mod session;
pub mod side_channel;
pub mod sse;
pub mod store;
pub mod testing;
pub mod writer;

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    /// Streaming endpoint of the agent service. Without it every turn is
    /// answered by an in-process echo agent.
    pub agent_url: Option<String>,
    /// Base URL of the browser-session status service.
    pub browser_status_url: Option<String>,
    pub cors_allow_origins: Vec<String>,
    pub relay: RelayConfig,
}

#[derive(Debug, Error)]
pub enum ServerError {
    #[error("invalid listen address {addr}: {source}")]
    InvalidAddress {
        addr: String,
        source: std::net::AddrParseError,
    },
    #[error("invalid CORS origin: {0}")]
    InvalidCorsOrigin(String),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

pub async fn run_server(config: ServerConfig) -> Result<(), ServerError> {
    let backend: Arc<dyn AgentBackend> = match &config.agent_url {
        Some(url) => Arc::new(HttpAgentBackend::new(url.clone())),
        None => {
            tracing::warn!("no agent url configured, answering with the echo agent");
            Arc::new(EchoBackend::default())
        }
    };

    let mut relay = ChatRelay::new(
        config.relay.clone(),
        backend,
        Arc::new(InMemorySessionStore::new()),
        Arc::new(StaticConfigStore::new()),
    );
    if let Some(url) = &config.browser_status_url {
        relay = relay.with_side_channel(Arc::new(HttpBrowserSessionSource::new(url.clone())));
    }

    run_server_with_relay(&config, Arc::new(relay)).await
}

pub async fn run_server_with_relay(
    config: &ServerConfig,
    relay: Arc<ChatRelay>,
) -> Result<(), ServerError> {
    let cors = build_cors_layer(&config.cors_allow_origins)?;
    let app = build_router(relay).layer(cors).layer(
        TraceLayer::new_for_http().make_span_with(|req: &Request<_>| {
            tracing::info_span!("http.request", method = %req.method(), uri = %req.uri())
        }),
    );

    let raw = format!("{}:{}", config.host, config.port);
    let addr = raw
        .parse::<SocketAddr>()
        .map_err(|source| ServerError::InvalidAddress { addr: raw, source })?;
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!(addr = %addr, "chat-relay listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;
    Ok(())
}

pub fn build_cors_layer(allow_origins: &[String]) -> Result<CorsLayer, ServerError> {
    let mut origins = Vec::new();
    for origin in allow_origins {
        let value = origin
            .parse()
            .map_err(|_| ServerError::InvalidCorsOrigin(origin.clone()))?;
        origins.push(value);
    }

    let cors = CorsLayer::new().allow_methods(Any).allow_headers(Any);
    if origins.is_empty() {
        Ok(cors.allow_origin(AllowOrigin::predicate(|_, _| false)))
    } else {
        Ok(cors.allow_origin(origins))
    }
}

async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
    tracing::info!("shutdown requested, draining open streams");
}
