//! Webhook Executor - RabbitMQ consumer delivering callback events to
//! externally registered webhooks.
//!
//! Runs the dispatch consumer, the health endpoint and the metrics endpoint
//! under one supervisor and shuts them down on SIGINT/SIGTERM.

use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::signal;
use tracing::{error, info};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use webhook_executor::health::HealthServer;
use webhook_executor::metrics::MetricsServer;
use webhook_executor::{
    AmqpSubscriber, Config, DeliveryClient, DeliveryMetrics, DispatchConsumer, Manager,
};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize structured JSON logging
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().json().flatten_event(true))
        .init();

    info!("webhook_executor_starting");

    // Load configuration from environment
    let config = Config::from_env();
    info!(
        amqp_url_set = !config.amqp_url.is_empty(),
        consumer_group = %config.consumer_group,
        max_in_flight = config.max_in_flight,
        rate_limit_bytes = config.rate_limit_bytes,
        ack_wait_ms = config.ack_wait.as_millis() as u64,
        request_timeout_ms = config.request_timeout.as_millis() as u64,
        status_policy = %config.status_policy,
        "config_loaded"
    );

    let subscriber = Arc::new(
        AmqpSubscriber::connect(&config)
            .await
            .context("Failed to connect to RabbitMQ")?,
    );

    let http = DeliveryClient::build_http_client(config.request_timeout)
        .context("Failed to create HTTP client")?;

    let metrics = DeliveryMetrics::new().context("Failed to register metrics")?;

    let consumer = DispatchConsumer::new(subscriber.clone(), DispatchConsumer::callback_spec(&config))
        .with_http_client(http)
        .with_request_timeout(config.request_timeout)
        .with_status_policy(config.status_policy.build().into())
        .with_metrics(metrics.clone());

    let mut manager = Manager::new();
    let health = HealthServer::new(config.health_listen, manager.status_board());
    let metrics_server = MetricsServer::new(config.metrics_listen, metrics);
    manager.add_worker(Arc::new(consumer)).await;
    manager.add_worker(Arc::new(health)).await;
    manager.add_worker(Arc::new(metrics_server)).await;

    manager.start_all().await;
    info!("webhook_executor_ready");

    let shutdown = manager.shutdown_token();
    tokio::select! {
        _ = shutdown_signal() => {}
        _ = shutdown.cancelled() => info!("worker_exit_shutdown"),
    }

    manager.stop_all();
    let results = manager.await_all().await;

    subscriber.close().await;

    let mut failed = false;
    for (worker, result) in &results {
        if let Err(e) = result {
            error!(worker = %worker, error = %e, "worker_exit_error");
            failed = true;
        }
    }

    info!("webhook_executor_shutdown_complete");

    if failed {
        anyhow::bail!("one or more workers failed");
    }
    Ok(())
}

/// Create a future that completes when a shutdown signal is received.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received SIGINT"),
        _ = terminate => info!("Received SIGTERM"),
    }
}
