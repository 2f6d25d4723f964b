//! Models for webhook configuration and delivery tracking.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::types::{DeliveryId, StoreId, WebhookId};
use crate::webhooks::WebhookEventType;

/// Which event types a webhook wants to receive.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthorizedWebhookEvents {
    pub everything: bool,
    #[serde(default)]
    pub specific_events: Vec<WebhookEventType>,
}

impl AuthorizedWebhookEvents {
    pub fn everything() -> Self {
        Self {
            everything: true,
            specific_events: Vec::new(),
        }
    }

    pub fn only(events: impl IntoIterator<Item = WebhookEventType>) -> Self {
        Self {
            everything: false,
            specific_events: events.into_iter().collect(),
        }
    }

    pub fn matches(&self, event_type: WebhookEventType) -> bool {
        self.everything || self.specific_events.contains(&event_type)
    }
}

/// A merchant-configured webhook subscription. Read-only to this crate.
#[derive(Debug, Clone)]
pub struct Webhook {
    pub id: WebhookId,
    pub store_id: StoreId,
    pub url: String,
    pub secret: String,
    pub active: bool,
    pub authorized_events: AuthorizedWebhookEvents,
    pub automatic_redelivery: bool,
    pub created_at: DateTime<Utc>,
}

impl Webhook {
    /// Check if this webhook should receive the given event type.
    pub fn accepts_event(&self, event_type: WebhookEventType) -> bool {
        self.active && self.authorized_events.matches(event_type)
    }
}

/// Delivery status for webhook deliveries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DeliveryStatus {
    /// The attempt never finished (interrupted by shutdown)
    Pending,
    /// Endpoint answered with a 2xx
    HttpSuccess,
    /// Endpoint answered with a non-2xx
    HttpError,
    /// No response: connection error, timeout, ...
    Failed,
}

impl DeliveryStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::HttpSuccess => "http_success",
            Self::HttpError => "http_error",
            Self::Failed => "failed",
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, Self::HttpSuccess)
    }
}

impl std::str::FromStr for DeliveryStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "http_success" => Ok(Self::HttpSuccess),
            "http_error" => Ok(Self::HttpError),
            "failed" => Ok(Self::Failed),
            _ => Err(format!("Unknown delivery status: {}", s)),
        }
    }
}

/// One delivery attempt. Written once, after the attempt finishes.
#[derive(Debug, Clone)]
pub struct WebhookDelivery {
    pub id: DeliveryId,
    pub webhook_id: WebhookId,
    pub original_delivery_id: DeliveryId,
    pub timestamp: DateTime<Utc>,
    /// Exact JSON body that was (or would have been) POSTed
    pub request: Vec<u8>,
    pub status: DeliveryStatus,
    pub http_code: Option<u16>,
    pub error_message: Option<String>,
    /// Request body blanked by the retention job
    pub pruned: bool,
}

impl WebhookDelivery {
    pub fn is_redelivery(&self) -> bool {
        self.original_delivery_id != self.id
    }
}

/// Every attempt sharing one `original_delivery_id`, reduced to what a retry needs.
#[derive(Debug, Clone)]
pub struct DeliveryChain {
    /// Newest attempt of the chain
    pub last: WebhookDelivery,
    /// Number of attempts recorded so far
    pub attempts: u32,
}
