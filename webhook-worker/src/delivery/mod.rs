//! Webhook delivery: validation, the HTTP client, and how responses are
//! settled with the broker.
//!
//! ## Flow
//!
//! ```text
//! CallbackPayload → validate() → DeliveryClient::execute() → StatusPolicy → ack / nack
//! ```

pub mod client;
pub mod observer;
pub mod policy;
pub mod validate;

pub use client::DeliveryClient;
pub use observer::{DeliveryObserver, DeliveryRecord, TracingObserver};
pub use policy::{AcknowledgeAll, Disposition, RedeliverOnServerError, StatusPolicy, StatusPolicyKind};
pub use validate::validate;
