//! Storage collaborators.
//!
//! Invoices and webhook subscriptions are owned by the surrounding payment processor. This
//! crate only sees them through repository traits, following the same layering as a
//! database-backed service:
//!
//! ```text
//! ┌──────────────────────┐
//! │ Watcher / Sender     │  (invoices::watcher, webhooks::sender)
//! └──────────┬───────────┘
//!            │
//!            ↓
//! ┌──────────────────────┐
//! │ Repositories         │  (db::handlers - InvoiceRepository, WebhookRepository)
//! └──────────┬───────────┘
//!            │
//!            ↓
//! ┌──────────────────────┐
//! │ Models               │  (db::models - invoices, payments, webhooks, deliveries)
//! └──────────────────────┘
//! ```
//!
//! # Modules
//!
//! - [`handlers`]: Repository traits and their in-memory implementations
//! - [`models`]: Record structures exchanged with the repositories
//! - [`errors`]: Repository error type
//!
//! ## Example Usage
//!
//! ```
//! use paywatch::db::handlers::{InMemoryWebhookRepository, WebhookRepository};
//!
//! # async fn example() -> Result<(), paywatch::db::errors::DbError> {
//! let repo = InMemoryWebhookRepository::new();
//! let webhooks = repo.get_webhooks_for_store("store-1").await?;
//! assert!(webhooks.is_empty());
//! # Ok(())
//! # }
//! ```

pub mod errors;
pub mod handlers;
pub mod models;
