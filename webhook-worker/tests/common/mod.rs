//! In-memory broker standing in for RabbitMQ in consumer tests.

#![allow(dead_code)]

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio::time::{sleep, Instant};

use webhook_executor::queue::{
    InboundMessage, MessageAcker, Subscriber, Subscription, SubscriptionSpec,
};
use webhook_executor::{CallbackPayload, SubscriptionError};

/// Settlement or lifecycle event observed by the broker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BrokerEvent {
    Ack(u64),
    Nack { tag: u64, requeue: bool },
    Closed,
}

#[derive(Default)]
struct Behaviour {
    fail_subscribe: bool,
    fail_close: bool,
}

struct Inner {
    sender: Mutex<Option<mpsc::UnboundedSender<(u64, Vec<u8>)>>>,
    receiver: Mutex<Option<mpsc::UnboundedReceiver<(u64, Vec<u8>)>>>,
    next_tag: AtomicU64,
    events: Mutex<Vec<BrokerEvent>>,
    subscribed: Mutex<Option<SubscriptionSpec>>,
    behaviour: Behaviour,
}

#[derive(Clone)]
pub struct MemoryBroker {
    inner: Arc<Inner>,
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self::with_behaviour(Behaviour::default())
    }

    pub fn failing_subscribe() -> Self {
        Self::with_behaviour(Behaviour { fail_subscribe: true, ..Default::default() })
    }

    pub fn failing_close() -> Self {
        Self::with_behaviour(Behaviour { fail_close: true, ..Default::default() })
    }

    fn with_behaviour(behaviour: Behaviour) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            inner: Arc::new(Inner {
                sender: Mutex::new(Some(tx)),
                receiver: Mutex::new(Some(rx)),
                next_tag: AtomicU64::new(1),
                events: Mutex::new(Vec::new()),
                subscribed: Mutex::new(None),
                behaviour,
            }),
        }
    }

    pub fn subscriber(&self) -> Arc<dyn Subscriber> {
        Arc::new(self.clone())
    }

    /// Enqueue a callback payload and return its delivery tag.
    pub fn publish(&self, payload: &CallbackPayload) -> u64 {
        self.publish_raw(serde_json::to_vec(payload).unwrap())
    }

    pub fn publish_raw(&self, data: Vec<u8>) -> u64 {
        let tag = self.inner.next_tag.fetch_add(1, Ordering::SeqCst);
        let sender = self.inner.sender.lock().unwrap();
        sender.as_ref().expect("stream already ended").send((tag, data)).unwrap();
        tag
    }

    /// End the delivery stream as if the broker cancelled the consumer.
    pub fn end_stream(&self) {
        self.inner.sender.lock().unwrap().take();
    }

    pub fn subscribed_spec(&self) -> Option<SubscriptionSpec> {
        self.inner.subscribed.lock().unwrap().clone()
    }

    pub fn events(&self) -> Vec<BrokerEvent> {
        self.inner.events.lock().unwrap().clone()
    }

    /// Poll until at least `count` events were recorded or five seconds pass.
    pub async fn wait_for_events(&self, count: usize) -> Vec<BrokerEvent> {
        let deadline = Instant::now() + Duration::from_secs(5);
        loop {
            let events = self.events();
            if events.len() >= count || Instant::now() >= deadline {
                return events;
            }
            sleep(Duration::from_millis(10)).await;
        }
    }

    fn record(&self, event: BrokerEvent) {
        self.inner.events.lock().unwrap().push(event);
    }
}

#[async_trait]
impl Subscriber for MemoryBroker {
    async fn subscribe(
        &self,
        spec: &SubscriptionSpec,
    ) -> Result<Box<dyn Subscription>, SubscriptionError> {
        if self.inner.behaviour.fail_subscribe {
            return Err(SubscriptionError::setup("queue_declare", "access refused"));
        }

        let receiver = self
            .inner
            .receiver
            .lock()
            .unwrap()
            .take()
            .ok_or_else(|| SubscriptionError::setup("basic_consume", "already subscribed"))?;

        *self.inner.subscribed.lock().unwrap() = Some(spec.clone());

        Ok(Box::new(MemorySubscription { broker: self.clone(), receiver }))
    }
}

struct MemorySubscription {
    broker: MemoryBroker,
    receiver: mpsc::UnboundedReceiver<(u64, Vec<u8>)>,
}

#[async_trait]
impl Subscription for MemorySubscription {
    async fn next_message(&mut self) -> Option<Result<InboundMessage, SubscriptionError>> {
        let (tag, data) = self.receiver.recv().await?;
        Some(Ok(InboundMessage {
            delivery_tag: tag,
            message_id: None,
            redelivered: false,
            data,
            acker: Box::new(MemoryAcker { broker: self.broker.clone(), tag }),
        }))
    }

    async fn close(self: Box<Self>) -> Result<(), SubscriptionError> {
        if self.broker.inner.behaviour.fail_close {
            return Err(SubscriptionError::Close("channel already closed".to_string()));
        }
        self.broker.record(BrokerEvent::Closed);
        Ok(())
    }
}

struct MemoryAcker {
    broker: MemoryBroker,
    tag: u64,
}

#[async_trait]
impl MessageAcker for MemoryAcker {
    async fn ack(&self) -> Result<(), SubscriptionError> {
        self.broker.record(BrokerEvent::Ack(self.tag));
        Ok(())
    }

    async fn nack(&self, requeue: bool) -> Result<(), SubscriptionError> {
        self.broker.record(BrokerEvent::Nack { tag: self.tag, requeue });
        Ok(())
    }
}
