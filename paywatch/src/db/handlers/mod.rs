//! Repository collaborators.
//!
//! The engine talks to storage only through these traits. The in-memory implementations back
//! the standalone binary and the tests.

pub mod invoices;
pub mod webhooks;

pub use invoices::{InMemoryInvoiceRepository, InvoiceRepository, PaymentUpsert};
pub use webhooks::{InMemoryWebhookRepository, WebhookRepository};
