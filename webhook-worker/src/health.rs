//! Health check endpoint reporting supervisor worker states.

use std::collections::BTreeMap;
use std::net::SocketAddr;

use anyhow::Context;
use async_trait::async_trait;
use axum::{extract::State, http::StatusCode, response::IntoResponse, routing::get, Json, Router};
use serde::Serialize;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::supervisor::{StatusBoard, Worker, WorkerState};

/// Health check response.
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub workers: BTreeMap<String, WorkerState>,
}

/// `GET /status`: 200 while every worker runs, 503 otherwise.
pub async fn status(State(board): State<StatusBoard>) -> impl IntoResponse {
    let healthy = board.all_running().await;
    let workers = board.snapshot().await;

    if healthy {
        (StatusCode::OK, Json(HealthResponse { status: "ok", workers }))
    } else {
        (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(HealthResponse { status: "unavailable", workers }),
        )
    }
}

pub fn router(board: StatusBoard) -> Router {
    Router::new()
        .route("/status", get(status))
        .layer(TraceLayer::new_for_http())
        .with_state(board)
}

/// Health server run as a supervised worker.
pub struct HealthServer {
    listen: SocketAddr,
    board: StatusBoard,
}

impl HealthServer {
    pub fn new(listen: SocketAddr, board: StatusBoard) -> Self {
        Self { listen, board }
    }
}

#[async_trait]
impl Worker for HealthServer {
    fn name(&self) -> &str {
        "health"
    }

    async fn run(&self, shutdown: CancellationToken) -> anyhow::Result<()> {
        let listener = TcpListener::bind(self.listen)
            .await
            .context("Failed to bind health listener")?;

        info!(address = %self.listen, "health_server_listening");

        axum::serve(listener, router(self.board.clone()))
            .with_graceful_shutdown(shutdown.cancelled_owned())
            .await
            .context("Health server error")?;

        info!("health_server_shutdown_complete");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::supervisor::Manager;

    struct Idle;

    #[async_trait]
    impl Worker for Idle {
        fn name(&self) -> &str {
            "idle"
        }

        async fn run(&self, shutdown: CancellationToken) -> anyhow::Result<()> {
            shutdown.cancelled().await;
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_status_ok_while_running() {
        let mut manager = Manager::new();
        manager.add_worker(Arc::new(Idle)).await;
        manager.start_all().await;

        let response = status(State(manager.status_board())).await.into_response();
        assert_eq!(response.status(), StatusCode::OK);

        manager.stop_all();
        manager.await_all().await;
    }

    #[tokio::test]
    async fn test_status_unavailable_before_start() {
        let mut manager = Manager::new();
        manager.add_worker(Arc::new(Idle)).await;

        let response = status(State(manager.status_board())).await.into_response();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    }

    #[tokio::test]
    async fn test_status_unavailable_after_stop() {
        let mut manager = Manager::new();
        manager.add_worker(Arc::new(Idle)).await;
        manager.start_all().await;
        manager.stop_all();
        manager.await_all().await;

        let response = status(State(manager.status_board())).await.into_response();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    }
}
