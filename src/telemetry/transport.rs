//! # Telemetry Transport
//!
//! The network boundary of the telemetry sender. [`HttpTransport`] posts
//! JSON over HTTP(S); tests substitute the generated `MockTelemetryTransport`
//! or their own fakes.

use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, warn};

use super::payload::TelemetryPayload;
use crate::error::TransportError;

/// Delivers one payload to the telemetry server
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait TelemetryTransport: Send + Sync {
    /// Push `payload`; any status outside 2xx is a failure
    async fn post(&self, payload: &TelemetryPayload) -> Result<(), TransportError>;

    /// Check whether the server is reachable
    async fn health_check(&self) -> Result<(), TransportError>;
}

/// `User-Agent` sent with every request
pub fn user_agent() -> String {
    format!("FuseMonitor/{}", env!("CARGO_PKG_VERSION"))
}

/// reqwest-backed transport
#[derive(Debug, Clone)]
pub struct HttpTransport {
    client: reqwest::Client,
    server_url: String,
    api_key: Option<String>,
}

impl HttpTransport {
    /// Build a client for `server_url` with a per-request `timeout`
    ///
    /// An empty `api_key` is treated as absent.
    ///
    /// # Errors
    ///
    /// Returns error if the HTTP client cannot be constructed
    pub fn new(
        server_url: impl Into<String>,
        api_key: Option<String>,
        timeout: Duration,
    ) -> Result<Self, TransportError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .user_agent(user_agent())
            .build()
            .map_err(|e| TransportError::Connection(e.to_string()))?;

        Ok(Self {
            client,
            server_url: server_url.into(),
            api_key: api_key.filter(|key| !key.is_empty()),
        })
    }

    /// Target URL for posts
    pub fn server_url(&self) -> &str {
        &self.server_url
    }

    fn authorize(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.api_key {
            Some(key) => request.bearer_auth(key),
            None => request,
        }
    }
}

fn classify(error: reqwest::Error) -> TransportError {
    if error.is_timeout() {
        TransportError::Timeout
    } else if error.is_builder() {
        TransportError::Encode(error.to_string())
    } else {
        TransportError::Connection(error.to_string())
    }
}

#[async_trait]
impl TelemetryTransport for HttpTransport {
    async fn post(&self, payload: &TelemetryPayload) -> Result<(), TransportError> {
        let request = self.client.post(&self.server_url).json(payload);
        let response = self.authorize(request).send().await.map_err(classify)?;

        let status = response.status();
        if status.as_u16() < 300 {
            debug!("Telemetry server accepted frame {}", payload.sequence);
            return Ok(());
        }

        let body = response.text().await.unwrap_or_default();
        warn!("Server returned status {}: {}", status.as_u16(), body);
        Err(TransportError::Status(status.as_u16()))
    }

    async fn health_check(&self) -> Result<(), TransportError> {
        let url = format!("{}/health", self.server_url.trim_end_matches('/'));
        let response = self
            .authorize(self.client.get(&url))
            .send()
            .await
            .map_err(classify)?;

        let status = response.status().as_u16();
        if status < 400 {
            Ok(())
        } else {
            Err(TransportError::Status(status))
        }
    }
}
