//! Invoice payment tracking.
//!
//! - [`accounting`]: amounts due and paid per payment method
//! - [`state`]: one pass of the invoice status state machine
//! - [`watcher`]: the task that evaluates, persists and publishes invoice changes
//! - [`listener`]: chain-indexer events in, payments and watch requests out

pub mod accounting;
pub mod listener;
pub mod state;
pub mod watcher;

pub use listener::PaymentListener;
pub use state::{UpdateContext, evaluate};
pub use watcher::{InvoiceWatcher, WatcherHandle, WatcherMessage};
