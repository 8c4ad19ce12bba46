//! Prometheus delivery counters and the `/metrics` endpoint.

use std::net::SocketAddr;

use anyhow::Context;
use async_trait::async_trait;
use axum::{
    extract::State,
    http::{header::CONTENT_TYPE, StatusCode},
    response::{IntoResponse, Response},
    routing::get,
    Router,
};
use prometheus::{Encoder, IntCounter, IntCounterVec, Opts, Registry, TextEncoder};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;
use tracing::{error, info};

use crate::error::DeliveryError;
use crate::supervisor::Worker;

/// Settlement and failure counters of the dispatch consumer.
///
/// Cloning shares the underlying counters.
#[derive(Clone)]
pub struct DeliveryMetrics {
    registry: Registry,
    acked: IntCounter,
    nacked: IntCounterVec,
    transport_errors: IntCounter,
    invalid_payloads: IntCounter,
}

impl DeliveryMetrics {
    /// Create the counters in a fresh registry.
    pub fn new() -> Result<Self, prometheus::Error> {
        let registry = Registry::new();

        let acked = IntCounter::new(
            "webhook_deliveries_acked_total",
            "Callbacks acknowledged after a webhook response",
        )?;
        let nacked = IntCounterVec::new(
            Opts::new(
                "webhook_deliveries_nacked_total",
                "Callbacks rejected, by whether redelivery was requested",
            ),
            &["requeue"],
        )?;
        let transport_errors = IntCounter::new(
            "webhook_transport_errors_total",
            "Webhook requests that got no response",
        )?;
        let invalid_payloads = IntCounter::new(
            "webhook_invalid_payloads_total",
            "Callbacks that could not be decoded or carried an unusable URL",
        )?;

        registry.register(Box::new(acked.clone()))?;
        registry.register(Box::new(nacked.clone()))?;
        registry.register(Box::new(transport_errors.clone()))?;
        registry.register(Box::new(invalid_payloads.clone()))?;

        Ok(Self {
            registry,
            acked,
            nacked,
            transport_errors,
            invalid_payloads,
        })
    }

    pub fn record_ack(&self) {
        self.acked.inc();
    }

    pub fn record_nack(&self, requeue: bool) {
        self.nacked
            .with_label_values(&[if requeue { "true" } else { "false" }])
            .inc();
    }

    pub fn record_failure(&self, error: &DeliveryError) {
        match error {
            DeliveryError::Transport { .. } => self.transport_errors.inc(),
            DeliveryError::Decode(_) | DeliveryError::InvalidWebhookUrl { .. } => {
                self.invalid_payloads.inc()
            }
        }
    }

    pub fn acked(&self) -> u64 {
        self.acked.get()
    }

    pub fn nacked(&self, requeue: bool) -> u64 {
        self.nacked
            .with_label_values(&[if requeue { "true" } else { "false" }])
            .get()
    }

    pub fn transport_errors(&self) -> u64 {
        self.transport_errors.get()
    }

    pub fn invalid_payloads(&self) -> u64 {
        self.invalid_payloads.get()
    }

    /// Current values in the Prometheus text exposition format.
    pub fn render(&self) -> Result<String, prometheus::Error> {
        let encoder = TextEncoder::new();
        let mut buffer = Vec::new();
        encoder.encode(&self.registry.gather(), &mut buffer)?;
        String::from_utf8(buffer).map_err(|e| prometheus::Error::Msg(e.to_string()))
    }
}

/// `GET /metrics`: the registry in the text exposition format.
pub async fn scrape(State(metrics): State<DeliveryMetrics>) -> Response {
    match metrics.render() {
        Ok(body) => (
            StatusCode::OK,
            [(CONTENT_TYPE, TextEncoder::new().format_type().to_string())],
            body,
        )
            .into_response(),
        Err(e) => {
            error!(error = %e, "metrics_encode_failed");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

pub fn router(metrics: DeliveryMetrics) -> Router {
    Router::new()
        .route("/metrics", get(scrape))
        .layer(TraceLayer::new_for_http())
        .with_state(metrics)
}

/// Metrics server run as a supervised worker.
pub struct MetricsServer {
    listen: SocketAddr,
    metrics: DeliveryMetrics,
}

impl MetricsServer {
    pub fn new(listen: SocketAddr, metrics: DeliveryMetrics) -> Self {
        Self { listen, metrics }
    }
}

#[async_trait]
impl Worker for MetricsServer {
    fn name(&self) -> &str {
        "metrics"
    }

    async fn run(&self, shutdown: CancellationToken) -> anyhow::Result<()> {
        let listener = TcpListener::bind(self.listen)
            .await
            .context("Failed to bind metrics listener")?;

        info!(address = %self.listen, "metrics_server_listening");

        axum::serve(listener, router(self.metrics.clone()))
            .with_graceful_shutdown(shutdown.cancelled_owned())
            .await
            .context("Metrics server error")?;

        info!("metrics_server_shutdown_complete");
        Ok(())
    }
}
