//! Gateway service entry point.
//!
//! Bridges an AMQP headers exchange to grouped WebSocket clients.

use amqp_client::{AmqpClient, AmqpConfig};
use anyhow::{Context, Result};
use bytes::Bytes;
use gateway::auth::TokenValidator;
use gateway::broker::deliveries;
use gateway::{create_router, AppState, Dispatcher, GatewayConfig, Registry};
use metrics_exporter_prometheus::PrometheusBuilder;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::signal;
use tokio::sync::{mpsc, oneshot};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

#[tokio::main]
async fn main() -> Result<()> {
    // Load environment variables from .env file
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    info!("Starting Gateway service");

    let config = Arc::new(GatewayConfig::load().context("failed to load configuration")?);
    info!("Configuration:");
    info!("  AMQP_URL: {}", config.amqp_url);
    info!("  EXCHANGE_NAME: {}", config.exchange_name);
    info!("  DISPATCH_WORKERS: {}", config.workers);
    info!("  HTTP_PORT: {}", config.http_port);
    info!("  METRICS_PORT: {}", config.metrics_port);
    info!("  ROUTING_MODE: {:?}", config.routing_mode);
    info!("  UNBIND_POLICY: {:?}", config.unbind_policy);
    info!("  DEBUG: {}", config.debug);

    PrometheusBuilder::new()
        .with_http_listener(([0, 0, 0, 0], config.metrics_port))
        .install()
        .context("failed to start Prometheus exporter")?;
    info!("Prometheus metrics server started on port {}", config.metrics_port);

    let index = if config.debug {
        let page = tokio::fs::read(&config.index_path)
            .await
            .with_context(|| format!("failed to read {}", config.index_path.display()))?;
        Some(Bytes::from(page))
    } else {
        None
    };

    // Each process gets its own queue.
    let instance_id = Uuid::new_v4().to_string();

    let amqp = Arc::new(
        AmqpClient::connect_and_declare(AmqpConfig::new(
            config.amqp_url.clone(),
            config.exchange_name.clone(),
            instance_id,
        ))
        .await
        .context("failed to set up broker")?,
    );
    info!(
        "Gateway instance queue '{}' on exchange '{}'",
        amqp.queue_name(),
        amqp.exchange_name()
    );
    let consumer = amqp.consume(config.prefetch_count).await?;

    let registry = Arc::new(Registry::new(amqp.clone(), config.unbind_policy));

    let dispatcher = Dispatcher::new(registry.clone(), config.dispatch());
    let (dispatch_shutdown_tx, dispatch_shutdown_rx) = mpsc::channel(1);
    let (dispatch_done_tx, dispatch_done_rx) = oneshot::channel::<()>();

    let dispatch_handle = tokio::spawn(async move {
        let result = dispatcher
            .run(deliveries(consumer), dispatch_shutdown_rx)
            .await;
        let _ = dispatch_done_tx.send(());
        result
    });

    let state = Arc::new(AppState {
        registry: registry.clone(),
        validator: TokenValidator::new(&config.auth_secret_key, config.routing_mode),
        auth_cookie_name: config.auth_cookie_name.clone(),
        amqp: Some(amqp.clone()),
        index,
    });
    let app = create_router(state);

    let addr = SocketAddr::from(([0, 0, 0, 0], config.http_port));
    let listener = TcpListener::bind(addr).await?;
    info!("Gateway listening on {}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(dispatch_done_rx))
        .await?;

    // Stop ingestion and wait for queued jobs to be fanned out and acked.
    info!("Shutting down dispatch pipeline...");
    let _ = dispatch_shutdown_tx.send(()).await;
    match dispatch_handle.await {
        Ok(Ok(stats)) => info!(
            "Dispatch drained: {} received, {} rejected, {} dispatched",
            stats.received, stats.rejected, stats.dispatched
        ),
        Ok(Err(e)) => error!("Dispatch pipeline error: {}", e),
        Err(e) => error!("Dispatch task failed: {}", e),
    }

    registry.shutdown().await;

    if let Err(e) = amqp.close().await {
        warn!("Failed to close broker connection: {:?}", e);
    }

    info!("Gateway stopped");
    Ok(())
}

/// Resolves on Ctrl+C, SIGTERM, or when the dispatch pipeline stops on its own.
async fn shutdown_signal(dispatch_done: oneshot::Receiver<()>) {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("Failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                error!("Failed to install signal handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received Ctrl+C"),
        _ = terminate => info!("Received terminate signal"),
        _ = dispatch_done => warn!("Dispatch pipeline stopped, shutting down"),
    }
}
