//! Webhook event types and payload builders.
//!
//! A webhook body is a flat JSON object: envelope fields shared by every event
//! (`deliveryId`, `webhookId`, `invoiceId`, ...) followed by a `type` tag and the fields
//! specific to that type.

use chrono::Utc;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::db::models::invoices::{InvoiceExceptionStatus, InvoiceStatus, Payment};
use crate::events::{InvoiceEvent, InvoiceEventCode};
use crate::types::{DeliveryId, InvoiceId, StoreId, WebhookId};

/// Webhook event types a subscription can filter on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum WebhookEventType {
    InvoiceCreated,
    InvoiceReceivedPayment,
    InvoicePaymentSettled,
    InvoiceProcessing,
    InvoiceExpired,
    InvoiceSettled,
    InvoiceInvalid,
}

impl WebhookEventType {
    pub const ALL: [WebhookEventType; 7] = [
        Self::InvoiceCreated,
        Self::InvoiceReceivedPayment,
        Self::InvoicePaymentSettled,
        Self::InvoiceProcessing,
        Self::InvoiceExpired,
        Self::InvoiceSettled,
        Self::InvoiceInvalid,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::InvoiceCreated => "InvoiceCreated",
            Self::InvoiceReceivedPayment => "InvoiceReceivedPayment",
            Self::InvoicePaymentSettled => "InvoicePaymentSettled",
            Self::InvoiceProcessing => "InvoiceProcessing",
            Self::InvoiceExpired => "InvoiceExpired",
            Self::InvoiceSettled => "InvoiceSettled",
            Self::InvoiceInvalid => "InvoiceInvalid",
        }
    }
}

impl std::fmt::Display for WebhookEventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for WebhookEventType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|t| t.as_str() == s)
            .ok_or_else(|| format!("Unknown event type: {}", s))
    }
}

/// Payment as exposed to webhook consumers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WebhookPayment {
    pub id: String,
    /// Unix seconds
    pub received_date: i64,
    pub value: Decimal,
    /// `Processing`, `Settled` or `Invalid`
    pub status: String,
    pub destination: String,
}

impl WebhookPayment {
    fn from_payment(payment: &Payment, settled: bool) -> Self {
        let status = if !payment.accounted {
            "Invalid"
        } else if settled {
            "Settled"
        } else {
            "Processing"
        };
        Self {
            id: payment.id.clone(),
            received_date: payment.received_at.timestamp(),
            value: payment.value,
            status: status.to_string(),
            destination: payment.destination.clone(),
        }
    }
}

/// Type tag plus type-specific fields.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all_fields = "camelCase")]
pub enum WebhookEventData {
    InvoiceCreated,
    InvoiceReceivedPayment {
        after_expiration: bool,
        payment_method: String,
        payment: WebhookPayment,
    },
    InvoicePaymentSettled {
        after_expiration: bool,
        payment_method: String,
        payment: WebhookPayment,
    },
    InvoiceProcessing {
        over_paid: bool,
    },
    InvoiceExpired {
        partially_paid: bool,
    },
    InvoiceSettled {
        manually_marked: bool,
        over_paid: bool,
    },
    InvoiceInvalid {
        manually_marked: bool,
    },
}

impl WebhookEventData {
    pub fn event_type(&self) -> WebhookEventType {
        match self {
            Self::InvoiceCreated => WebhookEventType::InvoiceCreated,
            Self::InvoiceReceivedPayment { .. } => WebhookEventType::InvoiceReceivedPayment,
            Self::InvoicePaymentSettled { .. } => WebhookEventType::InvoicePaymentSettled,
            Self::InvoiceProcessing { .. } => WebhookEventType::InvoiceProcessing,
            Self::InvoiceExpired { .. } => WebhookEventType::InvoiceExpired,
            Self::InvoiceSettled { .. } => WebhookEventType::InvoiceSettled,
            Self::InvoiceInvalid { .. } => WebhookEventType::InvoiceInvalid,
        }
    }

    /// Map an invoice event to its webhook payload.
    ///
    /// Returns `None` for events that have no webhook (`Completed`, `PaidAfterExpiration`).
    /// A partially paid invoice emits both `Expired` and `ExpiredPaidPartial`; only the latter
    /// produces a webhook so the merchant is told once.
    pub fn from_invoice_event(event: &InvoiceEvent) -> Option<Self> {
        let invoice = &event.invoice;
        let over_paid = invoice.exception_status == InvoiceExceptionStatus::PaidOver;
        let after_expiration = matches!(invoice.status, InvoiceStatus::Expired | InvoiceStatus::Invalid);

        match event.code {
            InvoiceEventCode::Created => Some(Self::InvoiceCreated),
            InvoiceEventCode::ReceivedPayment => {
                let payment = event.payment.as_ref()?;
                Some(Self::InvoiceReceivedPayment {
                    after_expiration,
                    payment_method: payment.payment_method_id.to_string(),
                    payment: WebhookPayment::from_payment(payment, payment.is_confirmed(invoice.speed_policy)),
                })
            }
            InvoiceEventCode::PaymentSettled => {
                let payment = event.payment.as_ref()?;
                Some(Self::InvoicePaymentSettled {
                    after_expiration,
                    payment_method: payment.payment_method_id.to_string(),
                    payment: WebhookPayment::from_payment(payment, true),
                })
            }
            InvoiceEventCode::PaidInFull => Some(Self::InvoiceProcessing { over_paid }),
            InvoiceEventCode::Expired if invoice.exception_status == InvoiceExceptionStatus::PaidPartial => None,
            InvoiceEventCode::Expired => Some(Self::InvoiceExpired { partially_paid: false }),
            InvoiceEventCode::ExpiredPaidPartial => Some(Self::InvoiceExpired { partially_paid: true }),
            InvoiceEventCode::Confirmed => Some(Self::InvoiceSettled {
                manually_marked: false,
                over_paid,
            }),
            InvoiceEventCode::MarkedCompleted => Some(Self::InvoiceSettled {
                manually_marked: true,
                over_paid,
            }),
            InvoiceEventCode::FailedToConfirm => Some(Self::InvoiceInvalid { manually_marked: false }),
            InvoiceEventCode::MarkedInvalid => Some(Self::InvoiceInvalid { manually_marked: true }),
            InvoiceEventCode::Completed | InvoiceEventCode::PaidAfterExpiration => None,
        }
    }

    /// Placeholder payload for test deliveries.
    pub fn sample(event_type: WebhookEventType) -> Self {
        let payment = || WebhookPayment {
            id: format!("{}:0", "0".repeat(64)),
            received_date: Utc::now().timestamp(),
            value: Decimal::new(1, 4),
            status: "Settled".to_string(),
            destination: "__test__".to_string(),
        };
        match event_type {
            WebhookEventType::InvoiceCreated => Self::InvoiceCreated,
            WebhookEventType::InvoiceReceivedPayment => Self::InvoiceReceivedPayment {
                after_expiration: false,
                payment_method: "BTC-CHAIN".to_string(),
                payment: payment(),
            },
            WebhookEventType::InvoicePaymentSettled => Self::InvoicePaymentSettled {
                after_expiration: false,
                payment_method: "BTC-CHAIN".to_string(),
                payment: payment(),
            },
            WebhookEventType::InvoiceProcessing => Self::InvoiceProcessing { over_paid: false },
            WebhookEventType::InvoiceExpired => Self::InvoiceExpired { partially_paid: false },
            WebhookEventType::InvoiceSettled => Self::InvoiceSettled {
                manually_marked: false,
                over_paid: false,
            },
            WebhookEventType::InvoiceInvalid => Self::InvoiceInvalid { manually_marked: false },
        }
    }
}

/// Complete webhook payload, as POSTed and stored in the delivery row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WebhookEvent {
    pub delivery_id: DeliveryId,
    pub original_delivery_id: DeliveryId,
    pub webhook_id: WebhookId,
    pub is_redelivery: bool,
    pub invoice_id: InvoiceId,
    pub store_id: StoreId,
    /// Unix seconds
    pub timestamp: i64,
    #[serde(flatten)]
    pub data: WebhookEventData,
}

impl WebhookEvent {
    /// A first delivery: `original_delivery_id` is the delivery itself.
    pub fn new(delivery_id: DeliveryId, webhook_id: WebhookId, invoice_id: InvoiceId, store_id: StoreId, data: WebhookEventData) -> Self {
        Self {
            delivery_id,
            original_delivery_id: delivery_id,
            webhook_id,
            is_redelivery: false,
            invoice_id,
            store_id,
            timestamp: Utc::now().timestamp(),
            data,
        }
    }

    pub fn event_type(&self) -> WebhookEventType {
        self.data.event_type()
    }
}

/// Rewrite a stored payload for redelivery under a new delivery id.
///
/// Business content and timestamp are kept; `originalDeliveryId` keeps pointing at the first
/// delivery of the chain. Works on raw JSON so payloads written by older versions survive.
pub fn redelivery_body(stored: &[u8], new_delivery_id: DeliveryId) -> anyhow::Result<Vec<u8>> {
    let mut body: serde_json::Value = serde_json::from_slice(stored)?;
    let object = body
        .as_object_mut()
        .ok_or_else(|| anyhow::anyhow!("stored webhook payload is not a JSON object"))?;

    let previous_id = object.get("deliveryId").cloned().unwrap_or(serde_json::Value::Null);
    object
        .entry("originalDeliveryId")
        .and_modify(|original| {
            if original.is_null() {
                *original = previous_id.clone();
            }
        })
        .or_insert(previous_id);
    object.insert("deliveryId".to_string(), serde_json::json!(new_delivery_id));
    object.insert("isRedelivery".to_string(), serde_json::Value::Bool(true));

    Ok(serde_json::to_vec(&body)?)
}

/// Pull the `type` tag out of a stored payload.
pub fn stored_event_type(stored: &[u8]) -> Option<WebhookEventType> {
    let body: serde_json::Value = serde_json::from_slice(stored).ok()?;
    body.get("type")?.as_str()?.parse().ok()
}
