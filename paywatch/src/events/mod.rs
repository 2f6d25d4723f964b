//! In-process eventing.
//!
//! - [`bus`]: typed publish/subscribe keyed by concrete event type
//! - [`invoice`]: invoice domain events and the chain-indexer events that trigger them

pub mod bus;
pub mod invoice;

pub use bus::{Cancelled, EventBus, Subscription};
pub use invoice::{
    InvoiceCreatedEvent, InvoiceDataChangedEvent, InvoiceEvent, InvoiceEventCode, InvoiceStopWatchedEvent, NewBlockEvent,
    NewOnChainTransactionEvent, TransactionData, TransactionOutput,
};
