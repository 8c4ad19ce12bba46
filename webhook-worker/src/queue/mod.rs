//! Queue module for RabbitMQ operations.
//!
//! This module provides:
//! - The callback message type and routing constants
//! - The broker subscription abstraction and its RabbitMQ implementation
//! - The client-side byte-rate throttle
//!
//! ## Topology
//!
//! ```text
//! producers → events exchange ─(callback)→ <group>/callback queue → instances
//! ```

pub mod subscription;
pub mod throttle;
pub mod types;

pub use subscription::{
    AmqpSubscriber, InboundMessage, MessageAcker, Subscriber, Subscription, SubscriptionSpec,
};
pub use throttle::ByteThrottle;
pub use types::{CallbackPayload, EVENTS_EXCHANGE, SUBJECT_CALLBACK, WEBHOOK_GROUP};
