//! Process supervisor for long-running workers.
//!
//! Every worker gets a child of one root cancellation token. Stopping the
//! manager cancels the root; a worker that fails, or returns before it was
//! asked to stop, also cancels the root so the rest of the process shuts
//! down with it.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

/// A long-running unit of work driven by the [`Manager`].
#[async_trait]
pub trait Worker: Send + Sync {
    fn name(&self) -> &str;

    /// Run until `shutdown` is cancelled, then clean up and return.
    async fn run(&self, shutdown: CancellationToken) -> anyhow::Result<()>;
}

/// Lifecycle state of a registered worker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "state", content = "error", rename_all = "snake_case")]
pub enum WorkerState {
    Registered,
    Running,
    Stopped,
    Failed(String),
}

/// Shared view of worker states, readable while the manager runs.
#[derive(Debug, Clone, Default)]
pub struct StatusBoard {
    states: Arc<RwLock<BTreeMap<String, WorkerState>>>,
}

impl StatusBoard {
    async fn set(&self, name: &str, state: WorkerState) {
        self.states.write().await.insert(name.to_string(), state);
    }

    pub async fn snapshot(&self) -> BTreeMap<String, WorkerState> {
        self.states.read().await.clone()
    }

    /// True when at least one worker is registered and all are running.
    pub async fn all_running(&self) -> bool {
        let states = self.states.read().await;
        !states.is_empty() && states.values().all(|s| *s == WorkerState::Running)
    }
}

/// Registry of workers with collective start, stop and wait.
pub struct Manager {
    workers: Vec<Arc<dyn Worker>>,
    handles: Vec<(String, JoinHandle<anyhow::Result<()>>)>,
    shutdown: CancellationToken,
    board: StatusBoard,
}

impl Default for Manager {
    fn default() -> Self {
        Self::new()
    }
}

impl Manager {
    pub fn new() -> Self {
        Self {
            workers: Vec::new(),
            handles: Vec::new(),
            shutdown: CancellationToken::new(),
            board: StatusBoard::default(),
        }
    }

    pub fn status_board(&self) -> StatusBoard {
        self.board.clone()
    }

    /// Token cancelled once shutdown begins, by request or by worker failure.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    pub async fn add_worker(&mut self, worker: Arc<dyn Worker>) {
        self.board.set(worker.name(), WorkerState::Registered).await;
        self.workers.push(worker);
    }

    /// Spawn every registered worker that is not running yet.
    pub async fn start_all(&mut self) {
        for worker in self.workers.drain(..) {
            let name = worker.name().to_string();
            let token = self.shutdown.child_token();
            let root = self.shutdown.clone();
            let board = self.board.clone();

            board.set(&name, WorkerState::Running).await;
            info!(worker = %name, "worker_starting");

            let task_name = name.clone();
            let handle = tokio::spawn(async move {
                let result = worker.run(token).await;

                match &result {
                    Ok(()) if !root.is_cancelled() => {
                        // Returned before stop_all, nothing is doing its job anymore.
                        error!(worker = %task_name, "worker_exited_unexpectedly");
                        board.set(&task_name, WorkerState::Stopped).await;
                        root.cancel();
                    }
                    Ok(()) => {
                        info!(worker = %task_name, "worker_stopped");
                        board.set(&task_name, WorkerState::Stopped).await;
                    }
                    Err(e) => {
                        error!(worker = %task_name, error = %e, "worker_failed");
                        board.set(&task_name, WorkerState::Failed(e.to_string())).await;
                        root.cancel();
                    }
                }

                result
            });

            self.handles.push((name, handle));
        }
    }

    /// Ask every worker to stop.
    pub fn stop_all(&self) {
        info!(workers = self.handles.len(), "workers_stopping");
        self.shutdown.cancel();
    }

    /// Wait for every started worker and return their results in start order.
    pub async fn await_all(&mut self) -> Vec<(String, anyhow::Result<()>)> {
        let mut results = Vec::with_capacity(self.handles.len());

        for (name, handle) in self.handles.drain(..) {
            let result = match handle.await {
                Ok(result) => result,
                Err(e) => {
                    error!(worker = %name, error = %e, "worker_panicked");
                    self.board.set(&name, WorkerState::Failed(e.to_string())).await;
                    Err(anyhow::anyhow!("worker {name} panicked: {e}"))
                }
            };
            results.push((name, result));
        }

        info!("workers_stopped");
        results
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::time::Duration;

    use super::*;

    struct UntilCancelled {
        stopped: AtomicBool,
    }

    #[async_trait]
    impl Worker for UntilCancelled {
        fn name(&self) -> &str {
            "until-cancelled"
        }

        async fn run(&self, shutdown: CancellationToken) -> anyhow::Result<()> {
            shutdown.cancelled().await;
            self.stopped.store(true, Ordering::SeqCst);
            Ok(())
        }
    }

    struct FailsImmediately;

    #[async_trait]
    impl Worker for FailsImmediately {
        fn name(&self) -> &str {
            "fails"
        }

        async fn run(&self, _shutdown: CancellationToken) -> anyhow::Result<()> {
            anyhow::bail!("subscription refused")
        }
    }

    struct ReturnsImmediately;

    #[async_trait]
    impl Worker for ReturnsImmediately {
        fn name(&self) -> &str {
            "returns"
        }

        async fn run(&self, _shutdown: CancellationToken) -> anyhow::Result<()> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_stop_all_cancels_workers() {
        let worker = Arc::new(UntilCancelled { stopped: AtomicBool::new(false) });
        let mut manager = Manager::new();
        manager.add_worker(worker.clone()).await;

        manager.start_all().await;
        assert!(manager.status_board().all_running().await);

        manager.stop_all();
        let results = manager.await_all().await;

        assert_eq!(results.len(), 1);
        assert!(results[0].1.is_ok());
        assert!(worker.stopped.load(Ordering::SeqCst));
        assert_eq!(
            manager.status_board().snapshot().await.get("until-cancelled"),
            Some(&WorkerState::Stopped)
        );
    }

    #[tokio::test]
    async fn test_failed_worker_shuts_down_the_rest() {
        let survivor = Arc::new(UntilCancelled { stopped: AtomicBool::new(false) });
        let mut manager = Manager::new();
        manager.add_worker(survivor.clone()).await;
        manager.add_worker(Arc::new(FailsImmediately)).await;

        manager.start_all().await;

        tokio::time::timeout(Duration::from_secs(5), manager.shutdown_token().cancelled())
            .await
            .expect("failure should cancel the root token");

        let results = manager.await_all().await;
        assert!(results[0].1.is_ok());
        assert!(results[1].1.is_err());
        assert!(survivor.stopped.load(Ordering::SeqCst));

        let states = manager.status_board().snapshot().await;
        assert!(matches!(states.get("fails"), Some(WorkerState::Failed(msg)) if msg.contains("refused")));
        assert!(!manager.status_board().all_running().await);
    }

    #[tokio::test]
    async fn test_early_return_shuts_down_the_rest() {
        let survivor = Arc::new(UntilCancelled { stopped: AtomicBool::new(false) });
        let mut manager = Manager::new();
        manager.add_worker(survivor.clone()).await;
        manager.add_worker(Arc::new(ReturnsImmediately)).await;

        manager.start_all().await;

        tokio::time::timeout(Duration::from_secs(5), manager.shutdown_token().cancelled())
            .await
            .expect("early return should cancel the root token");

        let results = manager.await_all().await;
        assert!(results.iter().all(|(_, r)| r.is_ok()));
        assert!(survivor.stopped.load(Ordering::SeqCst));
        assert_eq!(
            manager.status_board().snapshot().await.get("returns"),
            Some(&WorkerState::Stopped)
        );
    }
}
