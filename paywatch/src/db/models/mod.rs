//! Record models exchanged with the repository collaborators.
//!
//! These structs mirror what the surrounding payment processor persists. This crate
//! reads invoices and webhook subscriptions, writes back invoice state, and appends
//! webhook delivery rows.
//!
//! - [`invoices`]: Invoices, payments, payment methods and their statuses
//! - [`webhooks`]: Webhook subscriptions and delivery attempts

pub mod invoices;
pub mod webhooks;
