//! Common type definitions.
//!
//! Invoices and stores are identified by opaque strings handed to us by the surrounding
//! payment processor; webhook subscriptions and deliveries are UUIDs we mint ourselves.
//!
//! - [`InvoiceId`]: Invoice identifier
//! - [`StoreId`]: Merchant store identifier
//! - [`WebhookId`]: Webhook subscription identifier
//! - [`DeliveryId`]: Identifier of one webhook delivery attempt
//!
//! # Utility Functions
//!
//! - [`abbrev_uuid`]: Abbreviate UUIDs to first 8 chars for logging

use uuid::Uuid;

// Type aliases for IDs
pub type InvoiceId = String;
pub type StoreId = String;
pub type WebhookId = Uuid;
pub type DeliveryId = Uuid;

/// Abbreviate a UUID to its first 8 characters for more readable logs and traces
/// Example: "550e8400-e29b-41d4-a716-446655440000" -> "550e8400"
pub fn abbrev_uuid(uuid: &Uuid) -> String {
    uuid.to_string().chars().take(8).collect()
}
