//! Merchant webhook notifications for invoice events.
//!
//! - [`events`]: Webhook event types, payloads and the invoice-event mapping
//! - [`signing`]: `BTCPay-Sig` HMAC-SHA256 body signatures
//! - [`transport`]: HTTP transport seam and its reqwest implementation
//! - [`sender`]: Per-subscription ordered delivery, persistence and automatic redelivery

pub mod events;
pub mod sender;
pub mod signing;
pub mod transport;

pub use events::{WebhookEvent, WebhookEventData, WebhookEventType};
pub use sender::{SendOutcome, WebhookSender};
pub use signing::{SIGNATURE_HEADER, sign_payload, verify_signature};
pub use transport::{ReqwestTransport, TransportError, WebhookTransport};
