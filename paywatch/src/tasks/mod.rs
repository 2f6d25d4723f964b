//! Task plumbing shared by the watcher and the webhook sender.
//!
//! - [`keyed_queue`]: at most one job in flight per key, FIFO within a key
//! - [`delayed`]: run an action after a delay, tracked for graceful shutdown

pub mod delayed;
pub mod keyed_queue;

pub use delayed::DelayedScheduler;
pub use keyed_queue::KeyedQueue;
