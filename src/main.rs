// Main entry point - Dependency injection and server setup
mod application;
mod domain;
mod infrastructure;
mod presentation;

use std::{net::SocketAddr, sync::Arc, time::Duration};
use anyhow::Context;
use tracing_subscriber::EnvFilter;

use crate::application::session_clock::SystemTimeSource;
use crate::application::session_controller::SessionDependencies;
use crate::application::session_runtime::SessionRuntime;
use crate::infrastructure::config::load_config;
use crate::infrastructure::http_gateway::HttpGateway;
use crate::infrastructure::ws_live_stream::WsLiveStream;
use crate::presentation::app_state::AppState;
use crate::presentation::router;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    // Load configuration
    let config = load_config("config/session")?;

    // Create adapters (infrastructure layer)
    let gateway = Arc::new(
        HttpGateway::new(
            config.gateway.base_url.clone(),
            config.gateway.request_timeout_secs.map(Duration::from_secs),
        )
        .context("Failed to build HTTP gateway")?,
    );
    let live_stream = Arc::new(WsLiveStream::new(config.gateway.live_url.clone()));

    // Start the session (application layer)
    let catalog = config.catalog();
    tracing::info!("Metric catalog has {} keys", catalog.definitions().len());
    let deps = SessionDependencies {
        devices: gateway.clone(),
        measurements: gateway,
        live_stream,
        time: Arc::new(SystemTimeSource),
        catalog,
    };
    let (session, runtime) = SessionRuntime::spawn(deps, config.session_settings());

    // Build router (presentation layer)
    let state = Arc::new(AppState {
        session: session.clone(),
    });
    let router = router(state);

    // Start server
    let addr: SocketAddr = config
        .server
        .bind
        .parse()
        .with_context(|| format!("Invalid bind address {}", config.server.bind))?;
    tracing::info!(
        "Starting testbench session service on {} (gateway {}, live {})",
        addr,
        config.gateway.base_url,
        config.gateway.live_url
    );

    axum::serve(tokio::net::TcpListener::bind(addr).await?, router)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
        })
        .await?;

    session.shutdown();
    runtime.await.context("Session runtime panicked")?;

    Ok(())
}
