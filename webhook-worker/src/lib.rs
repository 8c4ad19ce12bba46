//! Webhook Executor - delivers callback events from RabbitMQ to HTTP webhooks.
//!
//! The worker consumes callback payloads from a queue shared by every
//! instance of the same consumer group, POSTs each body to its webhook URL,
//! and acknowledges or rejects the message so the broker can redeliver.
//! Delivery is at-least-once.
//!
//! ## Architecture
//!
//! ```text
//! events exchange → <group>/callback queue → DispatchConsumer → DeliveryClient → webhook
//! ```

pub mod config;
pub mod consumer;
pub mod delivery;
pub mod error;
pub mod health;
pub mod metrics;
pub mod queue;
pub mod supervisor;

// Re-export commonly used types
pub use config::Config;
pub use consumer::DispatchConsumer;
pub use delivery::{DeliveryClient, StatusPolicy};
pub use error::{ConsumerError, DeliveryError, SubscriptionError};
pub use metrics::DeliveryMetrics;
pub use queue::{AmqpSubscriber, CallbackPayload, SUBJECT_CALLBACK};
pub use supervisor::{Manager, Worker};
