//! Dictionary service entry point.
//! Builds the token service, rate limiter and router, then serves until Ctrl-C.

use anyhow::{Context, Result};
use clap::Parser;
use dotenv::dotenv;
use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use dictionary_backend::{
    api::{build_router, AppState},
    auth::{SessionService, TokenService},
    config::GateConfig,
    middleware::ClientLimiter,
};

#[tokio::main]
async fn main() -> Result<()> {
    load_env();
    init_tracing();

    let config = GateConfig::parse();

    // A missing secret stops the process here, before any request is served.
    let signing = config.signing_config()?;
    let limits = config.rate_limit_config()?;
    let directory = Arc::new(config.directory()?);

    if directory.is_empty() {
        warn!("GATE_USERS is empty - login will reject every request");
    }

    info!(
        access_ttl_secs = signing.access_ttl().as_secs(),
        refresh_ttl_secs = signing.refresh_ttl().as_secs(),
        users = directory.len(),
        "Token service initialized"
    );

    let tokens = Arc::new(TokenService::new(signing));
    let sessions = Arc::new(SessionService::new(tokens.clone(), directory.clone()));
    let limiter = Arc::new(ClientLimiter::new(limits));
    let sweeper = limiter.spawn_sweeper();

    let app = build_router(AppState {
        tokens,
        sessions,
        credentials: directory,
        limiter,
        trust_forwarded_for: config.trust_forwarded_for,
    });

    let listener = TcpListener::bind(config.bind_addr)
        .await
        .with_context(|| format!("Failed to bind {}", config.bind_addr))?;
    info!("API server listening on {}", config.bind_addr);

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await
    .context("Server error")?;

    sweeper.stop().await;
    info!("Shutdown complete");

    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!("Failed to listen for shutdown signal: {}", e);
        std::future::pending::<()>().await;
    }
    info!("Shutdown signal received");
}

fn load_env() {
    // Standard dotenv search (cwd + parents), then the crate directory.
    let _ = dotenv();

    let manifest_env = Path::new(env!("CARGO_MANIFEST_DIR")).join(".env");
    if manifest_env.exists() {
        let _ = dotenv::from_path(&manifest_env);
    }
}

/// Initialize tracing
fn init_tracing() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "dictionary_backend=debug,dictionary=info,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();
}
