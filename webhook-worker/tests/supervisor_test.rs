//! Supervisor behaviour with the dispatch consumer registered as a worker.

#![allow(clippy::unwrap_used)]

mod common;

use std::sync::Arc;
use std::time::Duration;

use tokio::time::timeout;

use common::{BrokerEvent, MemoryBroker};
use webhook_executor::queue::SubscriptionSpec;
use webhook_executor::supervisor::WorkerState;
use webhook_executor::{DispatchConsumer, Manager};

fn spec() -> SubscriptionSpec {
    SubscriptionSpec {
        group: "test-webhook".to_string(),
        subject: "callback".to_string(),
        max_in_flight: 10,
        rate_limit_bytes: 0,
        ack_wait: Duration::from_secs(60),
    }
}

#[tokio::test]
async fn broker_ending_the_stream_shuts_the_process_down() {
    let broker = MemoryBroker::new();
    let mut manager = Manager::new();
    manager
        .add_worker(Arc::new(DispatchConsumer::new(broker.subscriber(), spec())))
        .await;
    manager.start_all().await;

    broker.end_stream();

    timeout(Duration::from_secs(5), manager.shutdown_token().cancelled())
        .await
        .expect("stream end should cancel the supervisor");

    let results = manager.await_all().await;
    assert_eq!(results.len(), 1);
    assert!(results[0].1.is_ok());
    assert_eq!(broker.events(), vec![BrokerEvent::Closed]);
    assert_eq!(
        manager.status_board().snapshot().await.get("webhook"),
        Some(&WorkerState::Stopped)
    );
}

#[tokio::test]
async fn requested_stop_does_not_count_as_early_exit() {
    let broker = MemoryBroker::new();
    let mut manager = Manager::new();
    manager
        .add_worker(Arc::new(DispatchConsumer::new(broker.subscriber(), spec())))
        .await;
    manager.start_all().await;

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(!manager.shutdown_token().is_cancelled());
    assert!(manager.status_board().all_running().await);

    manager.stop_all();
    let results = manager.await_all().await;

    assert!(results[0].1.is_ok());
    assert_eq!(broker.events(), vec![BrokerEvent::Closed]);
}
