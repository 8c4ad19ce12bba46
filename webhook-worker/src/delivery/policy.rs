//! Mapping of webhook response statuses to broker settlement.
//!
//! A received response is never an error of the delivery itself. The policy
//! only decides whether the message is acknowledged or handed back to the
//! broker for redelivery.

use std::fmt;
use std::str::FromStr;

use reqwest::StatusCode;

/// Settlement of a message whose request got a response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    Acknowledge,
    Redeliver,
}

/// Classifies response statuses.
pub trait StatusPolicy: Send + Sync {
    fn classify(&self, status: StatusCode) -> Disposition;
}

/// Acknowledge whatever the endpoint answered. The default.
#[derive(Debug, Clone, Copy, Default)]
pub struct AcknowledgeAll;

impl StatusPolicy for AcknowledgeAll {
    fn classify(&self, _status: StatusCode) -> Disposition {
        Disposition::Acknowledge
    }
}

/// Hand 5xx and 429 responses back to the broker, acknowledge the rest.
#[derive(Debug, Clone, Copy, Default)]
pub struct RedeliverOnServerError;

impl StatusPolicy for RedeliverOnServerError {
    fn classify(&self, status: StatusCode) -> Disposition {
        if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
            Disposition::Redeliver
        } else {
            Disposition::Acknowledge
        }
    }
}

/// Configurable choice of built-in policy.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum StatusPolicyKind {
    #[default]
    AcknowledgeAll,
    RedeliverOnServerError,
}

impl StatusPolicyKind {
    pub fn build(self) -> Box<dyn StatusPolicy> {
        match self {
            Self::AcknowledgeAll => Box::new(AcknowledgeAll),
            Self::RedeliverOnServerError => Box::new(RedeliverOnServerError),
        }
    }
}

impl FromStr for StatusPolicyKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "ack_all" => Ok(Self::AcknowledgeAll),
            "redeliver_server_errors" => Ok(Self::RedeliverOnServerError),
            other => Err(format!(
                "unknown status policy {other:?}, expected ack_all or redeliver_server_errors"
            )),
        }
    }
}

impl fmt::Display for StatusPolicyKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::AcknowledgeAll => f.write_str("ack_all"),
            Self::RedeliverOnServerError => f.write_str("redeliver_server_errors"),
        }
    }
}
