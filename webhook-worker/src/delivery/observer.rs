//! Diagnostic sink for executed webhook requests.

use reqwest::StatusCode;
use url::Url;

/// What was sent where, and what came back.
#[derive(Debug, Clone, Copy)]
pub struct DeliveryRecord<'a> {
    pub url: &'a Url,
    pub content: &'a [u8],
    pub status: StatusCode,
}

/// Receives one record per request that got a response.
///
/// Observers cannot fail and cannot alter the delivery result.
pub trait DeliveryObserver: Send + Sync {
    fn observe(&self, record: &DeliveryRecord<'_>);
}

/// Emits each record as a debug-level tracing event.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingObserver;

impl DeliveryObserver for TracingObserver {
    fn observe(&self, record: &DeliveryRecord<'_>) {
        tracing::debug!(
            content = %String::from_utf8_lossy(record.content),
            url = %record.url,
            status = record.status.as_u16(),
            "webhook_execution"
        );
    }
}
