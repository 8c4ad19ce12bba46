//! Webhook delivery - one HTTP POST per callback.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use reqwest::{header::CONTENT_TYPE, Client, StatusCode};
use tracing::{debug, error};
use url::Url;

use crate::config::DEFAULT_REQUEST_TIMEOUT_MS;
use crate::delivery::observer::{DeliveryObserver, DeliveryRecord, TracingObserver};
use crate::error::DeliveryError;

/// Stateless HTTP delivery over a shared, pooled client.
#[derive(Clone)]
pub struct DeliveryClient {
    http: Client,
    timeout: Duration,
    observer: Arc<dyn DeliveryObserver>,
}

impl Default for DeliveryClient {
    /// `reqwest::Client::new()` with the default request timeout, reporting
    /// to [`TracingObserver`].
    fn default() -> Self {
        Self::new(Client::new(), Arc::new(TracingObserver))
    }
}

impl DeliveryClient {
    pub fn new(http: Client, observer: Arc<dyn DeliveryObserver>) -> Self {
        Self {
            http,
            timeout: Duration::from_millis(DEFAULT_REQUEST_TIMEOUT_MS),
            observer,
        }
    }

    /// Build the pooled client used in production.
    pub fn build_http_client(timeout: Duration) -> Result<Client, reqwest::Error> {
        Client::builder()
            .timeout(timeout)
            .pool_max_idle_per_host(100)
            .build()
    }

    pub fn with_http_client(mut self, http: Client) -> Self {
        self.http = http;
        self
    }

    /// Bound on each request, applied on top of any client-wide timeout.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn with_observer(mut self, observer: Arc<dyn DeliveryObserver>) -> Self {
        self.observer = observer;
        self
    }

    /// POST `body` to `url` as JSON and return the response status.
    ///
    /// Non-2xx statuses are returned, not raised. The response body is read
    /// to the end and dropped whatever the outcome, so the pooled connection
    /// can be reused.
    pub async fn execute(&self, url: &Url, body: &Bytes) -> Result<StatusCode, DeliveryError> {
        let mut request = self
            .http
            .post(url.clone())
            .timeout(self.timeout)
            .header(CONTENT_TYPE, "application/json");

        if !body.is_empty() {
            request = request.body(body.clone());
        }

        let response = match request.send().await {
            Ok(resp) => resp,
            Err(e) => {
                if e.is_timeout() {
                    error!(url = %url, error = %e, "webhook_request_timeout");
                } else if e.is_connect() {
                    error!(url = %url, error = %e, "webhook_connect_error");
                } else {
                    error!(url = %url, error = %e, "webhook_request_error");
                }
                return Err(DeliveryError::transport(url.as_str(), &e));
            }
        };

        let status = response.status();

        if let Err(e) = response.bytes().await {
            debug!(url = %url, status_code = status.as_u16(), error = %e, "webhook_response_read_failed");
        }

        self.observer.observe(&DeliveryRecord {
            url,
            content: body.as_ref(),
            status,
        });

        Ok(status)
    }
}
