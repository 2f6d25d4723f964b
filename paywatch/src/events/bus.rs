//! Process-wide typed publish/subscribe.
//!
//! Listeners are registered per concrete event type ([`TypeId`]); publishing a value only
//! reaches listeners registered for exactly that type. There is no notion of an event
//! hierarchy.
//!
//! [`EventBus::publish`] runs every listener synchronously on the caller's task, against
//! a snapshot of the registry taken at the start of the call. Listeners that need to do
//! I/O should use [`EventBus::subscribe_async`], which bridges events through a dedicated
//! unbounded queue drained by one task per subscriber.

use std::any::{Any, TypeId, type_name};
use std::collections::HashMap;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use futures::FutureExt;
use parking_lot::Mutex;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

type Handler = Box<dyn Fn(&dyn Any) -> anyhow::Result<()> + Send + Sync>;

struct Listener {
    id: u64,
    event_type: &'static str,
    active: AtomicBool,
    handler: Handler,
}

#[derive(Default)]
struct Registry {
    listeners: Mutex<HashMap<TypeId, Vec<Arc<Listener>>>>,
    next_id: AtomicU64,
}

impl Registry {
    fn remove(&self, type_id: TypeId, id: u64) {
        let mut listeners = self.listeners.lock();
        if let Some(list) = listeners.get_mut(&type_id) {
            list.retain(|l| l.id != id);
            if list.is_empty() {
                listeners.remove(&type_id);
            }
        }
    }
}

/// Returned by [`EventBus::wait_next`] when the cancellation token fires first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("wait for event cancelled")]
pub struct Cancelled;

/// Handle to a registered listener. Dropping it unsubscribes.
#[must_use = "dropping a Subscription unsubscribes the listener"]
pub struct Subscription {
    type_id: TypeId,
    listener: Arc<Listener>,
    registry: Weak<Registry>,
}

impl Subscription {
    /// Remove the listener. Idempotent, and safe to call from inside the listener itself.
    pub fn unsubscribe(&self) {
        if self.listener.active.swap(false, Ordering::SeqCst) {
            if let Some(registry) = self.registry.upgrade() {
                registry.remove(self.type_id, self.listener.id);
            }
            debug!(event_type = self.listener.event_type, "Listener unsubscribed");
        }
    }

    pub fn is_active(&self) -> bool {
        self.listener.active.load(Ordering::SeqCst)
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.unsubscribe();
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("event_type", &self.listener.event_type)
            .field("active", &self.is_active())
            .finish()
    }
}

/// Cloneable handle to a shared listener registry.
#[derive(Clone, Default)]
pub struct EventBus {
    registry: Arc<Registry>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a synchronous listener for events of type `T`.
    ///
    /// The handler runs on the publisher's task and must not block.
    pub fn subscribe<T, F>(&self, handler: F) -> Subscription
    where
        T: Any + Send + Sync,
        F: Fn(&T) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        let handler: Handler = Box::new(move |event: &dyn Any| match event.downcast_ref::<T>() {
            Some(event) => handler(event),
            None => Ok(()),
        });
        let listener = Arc::new(Listener {
            id: self.registry.next_id.fetch_add(1, Ordering::Relaxed),
            event_type: type_name::<T>(),
            active: AtomicBool::new(true),
            handler,
        });

        self.registry
            .listeners
            .lock()
            .entry(TypeId::of::<T>())
            .or_default()
            .push(listener.clone());

        Subscription {
            type_id: TypeId::of::<T>(),
            listener,
            registry: Arc::downgrade(&self.registry),
        }
    }

    /// Register an async listener for events of type `T`.
    ///
    /// Events are cloned into an unbounded queue owned by this subscriber and handled one at
    /// a time, in publish order. Distinct async subscribers run concurrently. Must be called
    /// from within a Tokio runtime.
    pub fn subscribe_async<T, F, Fut>(&self, handler: F) -> Subscription
    where
        T: Any + Clone + Send + Sync,
        F: Fn(T) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        let (tx, mut rx) = mpsc::unbounded_channel::<T>();
        let event_type = type_name::<T>();

        tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                let outcome = AssertUnwindSafe(async { handler(event).await }).catch_unwind().await;
                match outcome {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => warn!(event_type, error = %e, "Async event handler failed"),
                    Err(_) => error!(event_type, "Async event handler panicked"),
                }
            }
            debug!(event_type, "Async listener drained");
        });

        self.subscribe(move |event: &T| {
            // Receiver only goes away once the drain task ends, which needs this sender dropped
            let _ = tx.send(event.clone());
            Ok(())
        })
    }

    /// Dispatch `event` to every listener registered for exactly type `T`.
    ///
    /// Listener errors and panics are logged and never reach the publisher.
    pub fn publish<T: Any + Send + Sync>(&self, event: T) {
        let snapshot: Vec<Arc<Listener>> = self
            .registry
            .listeners
            .lock()
            .get(&TypeId::of::<T>())
            .cloned()
            .unwrap_or_default();
        let event: &dyn Any = &event;

        for listener in snapshot {
            // Removed during this publish: skip even though it is in the snapshot
            if !listener.active.load(Ordering::SeqCst) {
                continue;
            }
            match std::panic::catch_unwind(AssertUnwindSafe(|| (listener.handler)(event))) {
                Ok(Ok(())) => {}
                Ok(Err(e)) => warn!(event_type = listener.event_type, error = %e, "Event handler failed"),
                Err(_) => error!(event_type = listener.event_type, "Event handler panicked"),
            }
        }
    }

    /// Resolve with the next published `T` matching `predicate`.
    ///
    /// The listener is registered when this is called, not when the returned future is first
    /// polled, so events published in between are not missed.
    pub fn wait_next<T, P>(
        &self,
        predicate: P,
        cancellation: CancellationToken,
    ) -> impl Future<Output = Result<T, Cancelled>> + Send + 'static
    where
        T: Any + Clone + Send + Sync,
        P: Fn(&T) -> bool + Send + Sync + 'static,
    {
        let (tx, rx) = oneshot::channel::<T>();
        let tx = Mutex::new(Some(tx));
        let subscription = self.subscribe(move |event: &T| {
            if predicate(event) {
                if let Some(tx) = tx.lock().take() {
                    let _ = tx.send(event.clone());
                }
            }
            Ok(())
        });

        async move {
            let _subscription = subscription;
            tokio::select! {
                biased;
                _ = cancellation.cancelled() => Err(Cancelled),
                event = rx => event.map_err(|_| Cancelled),
            }
        }
    }

    /// Number of live listeners for `T`.
    pub fn listener_count<T: Any>(&self) -> usize {
        self.registry
            .listeners
            .lock()
            .get(&TypeId::of::<T>())
            .map(Vec::len)
            .unwrap_or(0)
    }
}
