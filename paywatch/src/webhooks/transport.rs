//! HTTP transport for webhook deliveries.
//!
//! The sender only depends on [`WebhookTransport`]; [`ReqwestTransport`] is the production
//! implementation.

use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

use super::signing::SIGNATURE_HEADER;

/// A signed request ready to go out.
#[derive(Debug, Clone)]
pub struct WebhookRequest {
    pub url: String,
    pub body: Vec<u8>,
    /// `sha256=<hex>`, or `None` for unsigned webhooks
    pub signature: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WebhookResponse {
    pub status: u16,
}

impl WebhookResponse {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

/// The request never produced a response.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("Request timed out")]
    Timeout,

    #[error("Failed to build HTTP client: {0}")]
    Client(String),

    #[error("Request failed: {0}")]
    Request(String),
}

#[async_trait]
pub trait WebhookTransport: Send + Sync {
    async fn send(&self, request: WebhookRequest) -> Result<WebhookResponse, TransportError>;
}

pub struct ReqwestTransport {
    client: reqwest::Client,
}

impl ReqwestTransport {
    pub fn new(timeout: Duration) -> Result<Self, TransportError> {
        // Already installed when running under the binary
        let _ = rustls::crypto::aws_lc_rs::default_provider().install_default();

        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| TransportError::Client(e.to_string()))?;
        Ok(Self { client })
    }
}

#[async_trait]
impl WebhookTransport for ReqwestTransport {
    async fn send(&self, request: WebhookRequest) -> Result<WebhookResponse, TransportError> {
        tracing::debug!(url = %request.url, bytes = request.body.len(), "Sending webhook HTTP request");

        let mut builder = self
            .client
            .post(&request.url)
            .header("Content-Type", "application/json");
        if let Some(signature) = &request.signature {
            builder = builder.header(SIGNATURE_HEADER, signature);
        }

        match builder.body(request.body).send().await {
            Ok(response) => Ok(WebhookResponse {
                status: response.status().as_u16(),
            }),
            Err(e) if e.is_timeout() => Err(TransportError::Timeout),
            Err(e) => Err(TransportError::Request(e.to_string())),
        }
    }
}
