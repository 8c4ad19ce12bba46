//! Error types for callback dispatch.
//!
//! Per-message failures ([`DeliveryError`]) are reported to the broker and
//! never stop the consumer. Only subscription setup and teardown failures
//! ([`ConsumerError`]) end a consumer run.

use thiserror::Error;

/// Failure while handling a single callback message.
#[derive(Debug, Clone, Error)]
pub enum DeliveryError {
    /// Message body was not a callback payload.
    #[error("undecodable callback payload: {0}")]
    Decode(String),

    /// Target address is absent or not an absolute http(s) URL.
    #[error("invalid webhook url {url:?}: {reason}")]
    InvalidWebhookUrl {
        /// Address as received
        url: String,
        /// Why it was rejected
        reason: String,
    },

    /// Request could not be sent or no response arrived.
    #[error("transport error for {url}: {message}")]
    Transport {
        /// Target address
        url: String,
        /// Underlying client error
        message: String,
        /// Whether the client gave up waiting
        timed_out: bool,
    },
}

impl DeliveryError {
    /// Creates an invalid URL error.
    pub fn invalid_url(url: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidWebhookUrl { url: url.into(), reason: reason.into() }
    }

    /// Creates a transport error from a failed request.
    pub fn transport(url: impl Into<String>, error: &reqwest::Error) -> Self {
        Self::Transport {
            url: url.into(),
            message: error.to_string(),
            timed_out: error.is_timeout(),
        }
    }

    /// Whether a later attempt of the same message could succeed.
    ///
    /// Drives the requeue flag of the negative acknowledgment.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Transport { .. })
    }
}

/// Failure talking to the message broker.
#[derive(Debug, Clone, Error)]
pub enum SubscriptionError {
    #[error("broker connection failed: {0}")]
    Connect(String),

    #[error("subscription setup failed at {step}: {message}")]
    Setup {
        /// Setup step that failed
        step: &'static str,
        /// Broker error message
        message: String,
    },

    #[error("delivery stream error: {0}")]
    Delivery(String),

    #[error("acknowledgment failed: {0}")]
    Acknowledge(String),

    #[error("subscription close failed: {0}")]
    Close(String),
}

impl SubscriptionError {
    pub fn setup(step: &'static str, error: impl ToString) -> Self {
        Self::Setup { step, message: error.to_string() }
    }
}

/// Fatal consumer failure, returned from [`crate::DispatchConsumer::start`].
#[derive(Debug, Error)]
pub enum ConsumerError {
    #[error("consume {name}: {source}")]
    SubscriptionSetup {
        name: String,
        #[source]
        source: SubscriptionError,
    },

    #[error("close {name}: {source}")]
    SubscriptionClose {
        name: String,
        #[source]
        source: SubscriptionError,
    },
}
