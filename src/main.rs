//! Job Orchestrator entry point.
//!
//! Wires up [`state::AppState`] (persistence, workers, the job registry,
//! secret resilience, the event bus, the activity feed, the report
//! coordinator) and serves the demo HTTP/WebSocket surface around it.

mod activity;
mod classifier;
mod core;
mod events;
mod job;
mod persistence;
mod registry;
mod reports;
mod secrets;
mod server;
mod state;
mod workers;

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::state::AppState;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "info,orchestrator_core=debug".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("starting job orchestrator...");

    let app_state = AppState::initialize().await?;

    let config = app_state.config.load_config().unwrap_or_default();
    let host = config
        .get("server")
        .and_then(|s| s.get("host"))
        .and_then(|v| v.as_str())
        .map(str::to_string)
        .or_else(|| std::env::var("ORCHESTRATOR_HOST").ok())
        .unwrap_or_else(|| "127.0.0.1".to_string());
    let port = config
        .get("server")
        .and_then(|s| s.get("port"))
        .and_then(|v| v.as_u64())
        .map(|v| v as u16)
        .or_else(|| std::env::var("ORCHESTRATOR_PORT").ok().and_then(|p| p.parse().ok()))
        .unwrap_or(4100);
    let addr = format!("{host}:{port}");

    let app = server::router(app_state);

    tracing::info!(%addr, "server listening");
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}
