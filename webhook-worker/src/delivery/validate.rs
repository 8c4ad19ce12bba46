//! Payload validation before any network call.

use url::Url;

use crate::error::DeliveryError;
use crate::queue::CallbackPayload;

/// Check the target address of a payload and return it parsed.
///
/// The address must be present, parse as an absolute URL, and use a scheme
/// the delivery client can send to.
pub fn validate(payload: &CallbackPayload) -> Result<Url, DeliveryError> {
    if payload.webhook_url.is_empty() {
        return Err(DeliveryError::invalid_url("", "empty url"));
    }

    let url = Url::parse(&payload.webhook_url)
        .map_err(|e| DeliveryError::invalid_url(&payload.webhook_url, e.to_string()))?;

    match url.scheme() {
        "http" | "https" => Ok(url),
        other => Err(DeliveryError::invalid_url(
            &payload.webhook_url,
            format!("unsupported scheme {other:?}"),
        )),
    }
}
