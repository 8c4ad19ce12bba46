//! Broker subscription for callback events.
//!
//! The dispatch consumer only sees the [`Subscriber`] / [`Subscription`]
//! traits. [`AmqpSubscriber`] realises them on RabbitMQ with lapin:
//!
//! - the consumer group is one durable queue shared by every instance,
//!   bound to the subject on the events exchange;
//! - the in-flight limit is the channel prefetch (`basic.qos`);
//! - the ack deadline is the queue's `x-consumer-timeout` argument.

use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use lapin::{
    acker::Acker,
    message::Delivery,
    options::{
        BasicAckOptions, BasicCancelOptions, BasicConsumeOptions, BasicNackOptions,
        BasicQosOptions, ExchangeDeclareOptions, QueueBindOptions, QueueDeclareOptions,
    },
    types::{AMQPValue, FieldTable},
    Channel, Connection, ConnectionProperties, Consumer, ExchangeKind,
};
use tokio::time::sleep;
use tracing::{info, warn};

use crate::config::Config;
use crate::error::SubscriptionError;
use crate::queue::types::EVENTS_EXCHANGE;

/// Where to attach and how fast the broker may push.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscriptionSpec {
    /// Consumer group shared by all instances
    pub group: String,
    /// Event subject (routing key)
    pub subject: String,
    /// Maximum delivered-but-unacknowledged messages
    pub max_in_flight: u16,
    /// Byte-rate ceiling, bytes per second (0 disables)
    pub rate_limit_bytes: u64,
    /// Time before an unacknowledged message is redelivered
    pub ack_wait: Duration,
}

impl SubscriptionSpec {
    /// Subscription name, also used as the queue name.
    pub fn name(&self) -> String {
        format!("{}/{}", self.group, self.subject)
    }
}

/// Opens subscriptions on a broker.
#[async_trait]
pub trait Subscriber: Send + Sync {
    async fn subscribe(
        &self,
        spec: &SubscriptionSpec,
    ) -> Result<Box<dyn Subscription>, SubscriptionError>;
}

/// A live attachment to a grouped subject.
///
/// Closing consumes the handle, so it happens at most once.
#[async_trait]
pub trait Subscription: Send {
    /// Next delivered message; `None` once the broker ends the stream.
    async fn next_message(&mut self) -> Option<Result<InboundMessage, SubscriptionError>>;

    /// Release broker-side resources.
    async fn close(self: Box<Self>) -> Result<(), SubscriptionError>;
}

/// Settles one delivery with the broker.
#[async_trait]
pub trait MessageAcker: Send + Sync {
    async fn ack(&self) -> Result<(), SubscriptionError>;

    /// Report failed processing; `requeue` asks for redelivery instead of
    /// dead-lettering.
    async fn nack(&self, requeue: bool) -> Result<(), SubscriptionError>;
}

/// A delivered, not yet settled message.
pub struct InboundMessage {
    pub delivery_tag: u64,
    pub message_id: Option<String>,
    pub redelivered: bool,
    pub data: Vec<u8>,
    pub acker: Box<dyn MessageAcker>,
}

impl fmt::Debug for InboundMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InboundMessage")
            .field("delivery_tag", &self.delivery_tag)
            .field("message_id", &self.message_id)
            .field("redelivered", &self.redelivered)
            .field("data_length", &self.data.len())
            .finish()
    }
}

// =============================================================================
// RabbitMQ
// =============================================================================

/// RabbitMQ subscriber sharing one connection between its subscriptions.
pub struct AmqpSubscriber {
    connection: Connection,
    consumer_tag: String,
}

impl AmqpSubscriber {
    /// Connect to the broker, retrying while it is unreachable.
    pub async fn connect(config: &Config) -> Result<Self, SubscriptionError> {
        let attempts = config.max_reconnects.max(1);
        let mut attempt = 1;

        loop {
            info!(url_length = config.amqp_url.len(), attempt = attempt, "rabbitmq_connecting");

            match Connection::connect(&config.amqp_url, ConnectionProperties::default()).await {
                Ok(connection) => {
                    info!("rabbitmq_connected");
                    return Ok(Self {
                        connection,
                        consumer_tag: format!("webhook-executor-{}", std::process::id()),
                    });
                }
                Err(e) if attempt < attempts => {
                    warn!(
                        attempt = attempt,
                        max_attempts = attempts,
                        retry_in_ms = config.reconnect_timeout.as_millis() as u64,
                        error = %e,
                        "rabbitmq_connect_failed"
                    );
                    attempt += 1;
                    sleep(config.reconnect_timeout).await;
                }
                Err(e) => return Err(SubscriptionError::Connect(e.to_string())),
            }
        }
    }

    /// Close the shared connection once every subscription is closed.
    pub async fn close(&self) {
        if let Err(e) = self.connection.close(200, "Normal shutdown").await {
            warn!(error = %e, "rabbitmq_connection_close_error");
        }
        info!("rabbitmq_connection_closed");
    }
}

#[async_trait]
impl Subscriber for AmqpSubscriber {
    async fn subscribe(
        &self,
        spec: &SubscriptionSpec,
    ) -> Result<Box<dyn Subscription>, SubscriptionError> {
        let queue = spec.name();

        let channel = self
            .connection
            .create_channel()
            .await
            .map_err(|e| SubscriptionError::setup("create_channel", e))?;

        channel
            .basic_qos(spec.max_in_flight, BasicQosOptions::default())
            .await
            .map_err(|e| SubscriptionError::setup("basic_qos", e))?;

        info!(prefetch_count = spec.max_in_flight, "rabbitmq_qos_set");

        channel
            .exchange_declare(
                EVENTS_EXCHANGE,
                ExchangeKind::Topic,
                ExchangeDeclareOptions {
                    durable: true,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(|e| SubscriptionError::setup("exchange_declare", e))?;

        channel
            .queue_declare(
                &queue,
                QueueDeclareOptions {
                    durable: true,
                    ..Default::default()
                },
                queue_arguments(spec),
            )
            .await
            .map_err(|e| SubscriptionError::setup("queue_declare", e))?;

        channel
            .queue_bind(
                &queue,
                EVENTS_EXCHANGE,
                &spec.subject,
                QueueBindOptions::default(),
                FieldTable::default(),
            )
            .await
            .map_err(|e| SubscriptionError::setup("queue_bind", e))?;

        info!(
            queue = %queue,
            exchange = EVENTS_EXCHANGE,
            routing_key = %spec.subject,
            ack_wait_ms = spec.ack_wait.as_millis() as u64,
            "rabbitmq_queue_declared"
        );

        let consumer = channel
            .basic_consume(
                &queue,
                &self.consumer_tag,
                BasicConsumeOptions::default(),
                FieldTable::default(),
            )
            .await
            .map_err(|e| SubscriptionError::setup("basic_consume", e))?;

        info!(queue = %queue, consumer_tag = %self.consumer_tag, "rabbitmq_consumer_started");

        Ok(Box::new(AmqpSubscription {
            queue,
            consumer_tag: self.consumer_tag.clone(),
            channel,
            consumer,
        }))
    }
}

/// Queue arguments carrying the redelivery deadline.
fn queue_arguments(spec: &SubscriptionSpec) -> FieldTable {
    let mut arguments = FieldTable::default();
    arguments.insert(
        "x-consumer-timeout".into(),
        AMQPValue::LongLongInt(spec.ack_wait.as_millis() as i64),
    );
    arguments
}

struct AmqpSubscription {
    queue: String,
    consumer_tag: String,
    channel: Channel,
    consumer: Consumer,
}

#[async_trait]
impl Subscription for AmqpSubscription {
    async fn next_message(&mut self) -> Option<Result<InboundMessage, SubscriptionError>> {
        let delivery = self.consumer.next().await?;
        Some(
            delivery
                .map(into_inbound)
                .map_err(|e| SubscriptionError::Delivery(e.to_string())),
        )
    }

    async fn close(self: Box<Self>) -> Result<(), SubscriptionError> {
        let cancelled = self
            .channel
            .basic_cancel(&self.consumer_tag, BasicCancelOptions::default())
            .await;
        if let Err(e) = &cancelled {
            warn!(queue = %self.queue, error = %e, "rabbitmq_basic_cancel_failed");
        }

        // Prefetched but unsettled deliveries return to the queue here.
        let closed = self.channel.close(200, "Consumer stopped").await;

        first_close_error(cancelled, closed)?;

        info!(queue = %self.queue, "rabbitmq_subscription_closed");
        Ok(())
    }
}

/// Combine the outcomes of the cancel and close steps, keeping the first
/// failure.
fn first_close_error<E: fmt::Display>(
    cancelled: Result<(), E>,
    closed: Result<(), E>,
) -> Result<(), SubscriptionError> {
    cancelled
        .and(closed)
        .map_err(|e| SubscriptionError::Close(e.to_string()))
}

fn into_inbound(delivery: Delivery) -> InboundMessage {
    let message_id = delivery
        .properties
        .message_id()
        .as_ref()
        .map(|s| s.to_string());

    InboundMessage {
        delivery_tag: delivery.delivery_tag,
        message_id,
        redelivered: delivery.redelivered,
        data: delivery.data,
        acker: Box::new(AmqpAcker(delivery.acker)),
    }
}

struct AmqpAcker(Acker);

#[async_trait]
impl MessageAcker for AmqpAcker {
    async fn ack(&self) -> Result<(), SubscriptionError> {
        self.0
            .ack(BasicAckOptions::default())
            .await
            .map(|_| ())
            .map_err(|e| SubscriptionError::Acknowledge(e.to_string()))
    }

    async fn nack(&self, requeue: bool) -> Result<(), SubscriptionError> {
        self.0
            .nack(BasicNackOptions {
                requeue,
                ..Default::default()
            })
            .await
            .map(|_| ())
            .map_err(|e| SubscriptionError::Acknowledge(e.to_string()))
    }
}
