//! ChatRelay Worker - Main Entry Point
//!
//! Loads configuration, connects to the orchestration backend and relays
//! generation work to the inference server until interrupted.

use chatrelay_common::{ChatRelayError, RelayConfig, Result, METRICS};
use chatrelay_proto::WorkerIdentity;
use chatrelay_worker::{ConnectionManager, InferenceClient, WorkHandler};
use std::sync::Arc;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[tokio::main]
async fn main() -> Result<()> {
    // Load configuration
    let config = RelayConfig::load()?;

    // Initialize logging
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.log_level()));
    let registry = tracing_subscriber::registry().with(filter);
    if config.structured_logging() {
        registry.with(tracing_subscriber::fmt::layer().json()).init();
    } else {
        registry.with(tracing_subscriber::fmt::layer()).init();
    }

    info!("Starting ChatRelay Worker");
    info!(
        backend = %config.worker.work_endpoint(),
        inference = %config.inference.generate_stream_endpoint(),
        model = %config.worker.model_name,
        "Worker configuration loaded"
    );

    let backend = Arc::new(InferenceClient::new(&config.inference)?);
    let handler = WorkHandler::new(backend).with_error_packets(config.worker.send_error_packets);
    let manager = ConnectionManager::new(
        config.worker.clone(),
        WorkerIdentity::new(config.worker.model_name.clone()),
        handler,
    );

    let shutdown = CancellationToken::new();
    let mut worker_handle = tokio::spawn({
        let shutdown = shutdown.clone();
        async move { manager.run(shutdown).await }
    });

    // Wait for shutdown signal
    tokio::select! {
        _ = signal::ctrl_c() => {
            info!("Received shutdown signal");
            shutdown.cancel();
            (&mut worker_handle)
                .await
                .map_err(|e| ChatRelayError::Internal(e.to_string()))?;
        }
        result = &mut worker_handle => {
            warn!("Connection manager exited unexpectedly");
            result.map_err(|e| ChatRelayError::Internal(e.to_string()))?;
        }
    }

    info!(metrics = %METRICS.summary(), "ChatRelay Worker shutdown complete");
    Ok(())
}
