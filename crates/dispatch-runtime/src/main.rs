//! Ride dispatch runtime entry point.

use std::sync::Arc;

use anyhow::{Context, Result};
use dispatch_runtime::{DispatchRuntime, NodeConfig};
use ride_telemetry::{init_logging, TelemetryError};
use shared_bus::{redact_dsn, Dialer};
use tracing::{info, warn};

#[cfg(feature = "amqp")]
fn dialer() -> Arc<dyn Dialer> {
    Arc::new(shared_bus::AmqpDialer::new())
}

#[cfg(not(feature = "amqp"))]
fn dialer() -> Arc<dyn Dialer> {
    warn!("Built without `amqp`; using the in-process broker");
    shared_bus::MemoryBroker::new().dialer()
}

#[cfg(feature = "ws")]
async fn serve_push(runtime: &DispatchRuntime) -> Result<tokio::task::JoinHandle<()>> {
    use tower_http::trace::TraceLayer;

    let addr = runtime.config().ws_addr;
    let app = push_hub::router(runtime.hub().clone(), &runtime.config().hub)
        .layer(TraceLayer::new_for_http());
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind WebSocket listener on {addr}"))?;
    info!(%addr, "Push endpoint listening");

    let shutdown = runtime.shutdown_token();
    Ok(tokio::spawn(async move {
        let served = axum::serve(listener, app)
            .with_graceful_shutdown(async move { shutdown.cancelled().await })
            .await;
        if let Err(e) = served {
            warn!(error = %e, "Push endpoint stopped with error");
        }
    }))
}

#[tokio::main]
async fn main() -> Result<()> {
    let config = NodeConfig::from_env().context("invalid configuration")?;

    match init_logging(&config.telemetry) {
        Ok(()) | Err(TelemetryError::AlreadyInitialized) => {}
        Err(e) => return Err(e).context("failed to initialize logging"),
    }

    info!(broker = %redact_dsn(&config.amqp_url), "Starting ride dispatch runtime");
    let runtime = DispatchRuntime::start(config, dialer())
        .await
        .context("failed to connect to broker")?;

    #[cfg(feature = "ws")]
    let server = serve_push(&runtime).await?;

    info!("Runtime is running. Press Ctrl+C to stop.");
    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for shutdown signal")?;

    runtime.shutdown().await;

    #[cfg(feature = "ws")]
    if let Err(e) = server.await {
        warn!(error = %e, "Push endpoint task panicked");
    }

    Ok(())
}
