//! Callback dispatch consumer.
//!
//! Subscribes to callback events under the shared consumer group and
//! spawns one task per delivery: decode, validate, POST, then settle the
//! message with the broker. On cancellation it stops pulling deliveries,
//! lets every spawned task finish its request, and only then closes the
//! subscription.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::config::Config;
use crate::delivery::{
    validate, AcknowledgeAll, DeliveryClient, DeliveryObserver, Disposition, StatusPolicy,
};
use crate::error::{ConsumerError, DeliveryError};
use crate::metrics::DeliveryMetrics;
use crate::queue::{
    ByteThrottle, CallbackPayload, InboundMessage, Subscriber, SubscriptionSpec,
    SUBJECT_CALLBACK, WEBHOOK_GROUP,
};
use crate::supervisor::Worker;

/// Consumer of callback events for one logical subscription.
pub struct DispatchConsumer {
    subscriber: Arc<dyn Subscriber>,
    spec: SubscriptionSpec,
    dispatcher: Arc<Dispatcher>,
}

/// Per-message pipeline shared by all delivery tasks.
#[derive(Clone)]
struct Dispatcher {
    client: DeliveryClient,
    policy: Arc<dyn StatusPolicy>,
    metrics: Option<DeliveryMetrics>,
}

impl DispatchConsumer {
    /// Create a consumer with the default delivery client and
    /// [`AcknowledgeAll`] policy.
    pub fn new(subscriber: Arc<dyn Subscriber>, spec: SubscriptionSpec) -> Self {
        Self {
            subscriber,
            spec,
            dispatcher: Arc::new(Dispatcher {
                client: DeliveryClient::default(),
                policy: Arc::new(AcknowledgeAll),
                metrics: None,
            }),
        }
    }

    /// Subscription parameters for callback events derived from config.
    pub fn callback_spec(config: &Config) -> SubscriptionSpec {
        SubscriptionSpec {
            group: config.generate_group_name(WEBHOOK_GROUP),
            subject: SUBJECT_CALLBACK.to_string(),
            max_in_flight: config.max_in_flight,
            rate_limit_bytes: config.rate_limit_bytes,
            ack_wait: config.ack_wait,
        }
    }

    pub fn with_http_client(self, http: Client) -> Self {
        self.map_dispatcher(|d| d.client = d.client.clone().with_http_client(http))
    }

    pub fn with_request_timeout(self, timeout: Duration) -> Self {
        self.map_dispatcher(|d| d.client = d.client.clone().with_timeout(timeout))
    }

    pub fn with_status_policy(self, policy: Arc<dyn StatusPolicy>) -> Self {
        self.map_dispatcher(|d| d.policy = policy)
    }

    pub fn with_observer(self, observer: Arc<dyn DeliveryObserver>) -> Self {
        self.map_dispatcher(|d| d.client = d.client.clone().with_observer(observer))
    }

    /// Count settlements and failures into `metrics`.
    pub fn with_metrics(self, metrics: DeliveryMetrics) -> Self {
        self.map_dispatcher(|d| d.metrics = Some(metrics))
    }

    fn map_dispatcher(mut self, f: impl FnOnce(&mut Dispatcher)) -> Self {
        let mut dispatcher = Dispatcher::clone(&self.dispatcher);
        f(&mut dispatcher);
        self.dispatcher = Arc::new(dispatcher);
        self
    }

    pub fn spec(&self) -> &SubscriptionSpec {
        &self.spec
    }

    /// Consume until `shutdown` is cancelled, then drain and close.
    ///
    /// Returns an error only when the subscription cannot be opened or
    /// cannot be closed. Failures of individual messages are settled with
    /// the broker and never end the run.
    pub async fn start(&self, shutdown: CancellationToken) -> Result<(), ConsumerError> {
        let name = self.spec.name();

        let mut subscription = self
            .subscriber
            .subscribe(&self.spec)
            .await
            .map_err(|source| ConsumerError::SubscriptionSetup {
                name: name.clone(),
                source,
            })?;

        info!(
            consumer = %name,
            max_in_flight = self.spec.max_in_flight,
            rate_limit_bytes = self.spec.rate_limit_bytes,
            ack_wait_ms = self.spec.ack_wait.as_millis() as u64,
            "consumer_ready"
        );

        let mut throttle = ByteThrottle::new(self.spec.rate_limit_bytes);
        let mut in_flight = JoinSet::new();

        loop {
            tokio::select! {
                biased;

                _ = shutdown.cancelled() => {
                    info!(consumer = %name, in_flight = in_flight.len(), "consumer_draining");
                    break;
                }
                Some(joined) = in_flight.join_next(), if !in_flight.is_empty() => {
                    if let Err(e) = joined {
                        error!(consumer = %name, error = %e, "dispatch_task_failed");
                    }
                }
                next = subscription.next_message() => {
                    match next {
                        Some(Ok(message)) => {
                            let cancelled = tokio::select! {
                                biased;
                                _ = shutdown.cancelled() => true,
                                _ = throttle.acquire(message.data.len()) => false,
                            };

                            if cancelled {
                                // Not dispatched; hand it straight back.
                                self.dispatcher.settle(&message, Disposition::Redeliver).await;
                                info!(consumer = %name, in_flight = in_flight.len(), "consumer_draining");
                                break;
                            }

                            let dispatcher = Arc::clone(&self.dispatcher);
                            in_flight.spawn(async move { dispatcher.handle(message).await });
                        }
                        Some(Err(e)) => {
                            error!(consumer = %name, error = %e, "consumer_delivery_error");
                        }
                        None => {
                            error!(consumer = %name, "consumer_stream_ended_unexpectedly");
                            break;
                        }
                    }
                }
            }
        }

        while let Some(joined) = in_flight.join_next().await {
            if let Err(e) = joined {
                error!(consumer = %name, error = %e, "dispatch_task_failed");
            }
        }

        subscription
            .close()
            .await
            .map_err(|source| ConsumerError::SubscriptionClose {
                name: name.clone(),
                source,
            })?;

        info!(consumer = %name, "consumer_stopped");
        Ok(())
    }
}

impl Dispatcher {
    async fn handle(&self, message: InboundMessage) {
        info!(
            delivery_tag = message.delivery_tag,
            message_id = ?message.message_id,
            redelivered = message.redelivered,
            body_length = message.data.len(),
            "callback_received"
        );

        match self.process(&message.data).await {
            Ok(disposition) => {
                info!(
                    delivery_tag = message.delivery_tag,
                    disposition = ?disposition,
                    "callback_dispatched"
                );
                self.settle(&message, disposition).await;
            }
            Err(e) => {
                warn!(
                    delivery_tag = message.delivery_tag,
                    retryable = e.is_retryable(),
                    error = %e,
                    "callback_failed"
                );
                if let Some(metrics) = &self.metrics {
                    metrics.record_failure(&e);
                }
                // Undecodable or invalid payloads would fail the same way
                // again, leave them to the dead-letter policy.
                self.reject(&message, e.is_retryable()).await;
            }
        }
    }

    async fn process(&self, data: &[u8]) -> Result<Disposition, DeliveryError> {
        let payload: CallbackPayload =
            serde_json::from_slice(data).map_err(|e| DeliveryError::Decode(e.to_string()))?;

        let url = validate(&payload)?;
        let status = self.client.execute(&url, &payload.body).await?;

        Ok(self.policy.classify(status))
    }

    /// Settle a message that reached a disposition.
    async fn settle(&self, message: &InboundMessage, disposition: Disposition) {
        match disposition {
            Disposition::Acknowledge => match message.acker.ack().await {
                Ok(()) => {
                    if let Some(metrics) = &self.metrics {
                        metrics.record_ack();
                    }
                }
                Err(e) => {
                    error!(delivery_tag = message.delivery_tag, error = %e, "rabbitmq_ack_failed");
                }
            },
            Disposition::Redeliver => self.reject(message, true).await,
        }
    }

    /// Report failed processing to the broker.
    async fn reject(&self, message: &InboundMessage, requeue: bool) {
        match message.acker.nack(requeue).await {
            Ok(()) => {
                if let Some(metrics) = &self.metrics {
                    metrics.record_nack(requeue);
                }
            }
            Err(e) => {
                error!(
                    delivery_tag = message.delivery_tag,
                    requeue = requeue,
                    error = %e,
                    "rabbitmq_nack_failed"
                );
            }
        }
    }
}

#[async_trait]
impl Worker for DispatchConsumer {
    fn name(&self) -> &str {
        "webhook"
    }

    async fn run(&self, shutdown: CancellationToken) -> anyhow::Result<()> {
        self.start(shutdown).await?;
        Ok(())
    }
}
