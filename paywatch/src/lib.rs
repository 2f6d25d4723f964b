//! # paywatch: invoice confirmation and merchant webhook engine
//!
//! `paywatch` watches cryptocurrency invoices until they are settled and tells merchants about
//! it. It sits between a blockchain indexer, which reports new blocks and transactions, and the
//! invoice and webhook stores of a payment processor.
//!
//! ## Overview
//!
//! Every invoice goes through a small status machine (`New`, `Paid`, `Confirmed`, `Complete`,
//! with `Expired` and `Invalid` on the side). Incoming transactions are matched to invoices by
//! receiving address and recorded as payments; the watcher then recomputes how much is due per
//! payment method, moves the invoice along, persists the result and publishes domain events.
//! The webhook sender turns those events into signed HTTP callbacks, delivered in order per
//! subscription and retried on a fixed schedule when the merchant endpoint fails.
//!
//! ## Architecture
//!
//! All components talk through an in-process [`EventBus`]:
//!
//! ```text
//!  indexer events ──▶ PaymentListener ──▶ InvoiceRepository
//!                          │
//!                          ▼
//!        EventBus ◀── InvoiceWatcher (one task, mailbox of watch requests)
//!            │
//!            ▼
//!      WebhookSender ──▶ KeyedQueue (per webhook) ──▶ WebhookTransport
//!            │
//!            └──▶ DelayedScheduler (automatic redelivery)
//! ```
//!
//! - [`events`]: the bus and the event types flowing through it
//! - [`invoices`]: accounting, the status machine, the watcher and the payment listener
//! - [`webhooks`]: payload mapping, signing, HTTP transport and the delivery engine
//! - [`tasks`]: the per-key ordering queue and the delayed job scheduler
//! - [`db`]: repository traits, models and in-memory implementations
//!
//! ## Quick Start
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use clap::Parser;
//! use paywatch::db::handlers::{InMemoryInvoiceRepository, InMemoryWebhookRepository};
//! use paywatch::webhooks::ReqwestTransport;
//! use paywatch::{Collaborators, Config, Engine};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let args = paywatch::config::Args::parse();
//!     let config = Config::load(&args)?;
//!     paywatch::telemetry::init_telemetry(config.enable_otel_export)?;
//!
//!     let collaborators = Collaborators::builder()
//!         .invoices(Arc::new(InMemoryInvoiceRepository::new()))
//!         .webhooks(Arc::new(InMemoryWebhookRepository::new()))
//!         .transport(Arc::new(ReqwestTransport::new(config.webhooks.timeout)?))
//!         .build();
//!
//!     let engine = Engine::start(config, collaborators);
//!     engine.rehydrate().await?;
//!
//!     tokio::signal::ctrl_c().await?;
//!     engine.shutdown().await;
//!     Ok(())
//! }
//! ```
//!
//! ## Configuration
//!
//! See the [`config`] module for configuration options.

pub mod config;
pub mod db;
pub mod errors;
pub mod events;
pub mod invoices;
pub mod tasks;
pub mod telemetry;
pub mod types;
pub mod webhooks;

#[cfg(test)]
mod test;

use std::sync::Arc;

use bon::Builder;
use tokio::task::JoinHandle;
use tokio_util::sync::{CancellationToken, DropGuard};
use tracing::{error, info, warn};

pub use config::Config;
pub use events::EventBus;

use db::handlers::{InvoiceRepository, WebhookRepository};
use events::Subscription;
use invoices::{InvoiceWatcher, PaymentListener, WatcherHandle};
use tasks::{DelayedScheduler, KeyedQueue};
use types::WebhookId;
use webhooks::{WebhookSender, WebhookTransport};

/// External collaborators the engine runs against.
///
/// # Example
///
/// ```ignore
/// let collaborators = Collaborators::builder()
///     .invoices(invoice_repo)
///     .webhooks(webhook_repo)
///     .transport(transport)
///     .build();
/// ```
#[derive(Clone, Builder)]
pub struct Collaborators {
    pub invoices: Arc<dyn InvoiceRepository>,
    pub webhooks: Arc<dyn WebhookRepository>,
    pub transport: Arc<dyn WebhookTransport>,
    /// Bus shared with the indexer and the invoice-creation path
    #[builder(default)]
    pub bus: EventBus,
}

/// What [`Engine::rehydrate`] picked back up from a previous run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Rehydrated {
    /// Pending invoices watched again
    pub invoices: usize,
    /// Failed delivery chains put back on the redelivery schedule
    pub redeliveries: usize,
}

/// Owns the watcher task, the delivery queue, the scheduler and every bus subscription.
///
/// # Lifecycle
///
/// 1. **Start**: [`Engine::start`] spawns the watcher and subscribes all components
/// 2. **Rehydrate**: [`Engine::rehydrate`] re-arms timers for invoices left pending by a
///    previous run and resumes its unfinished redelivery ladders
/// 3. **Shutdown**: [`Engine::shutdown`] cancels the shared token, drops timers that are not
///    yet due, aborts the delivery queue and waits (bounded) for in-flight work
///
/// If the engine is dropped without calling `shutdown`, the drop guard still cancels the
/// shared token.
pub struct Engine {
    config: Config,
    bus: EventBus,
    watcher: WatcherHandle,
    sender: WebhookSender,
    queue: KeyedQueue<WebhookId>,
    scheduler: DelayedScheduler,
    subscriptions: Vec<Subscription>,
    background_tasks: Vec<JoinHandle<()>>,
    shutdown_token: CancellationToken,
    // Pub so that we can disarm it if we want to
    pub drop_guard: Option<DropGuard>,
}

impl Engine {
    /// Start all components. Must be called from within a Tokio runtime.
    pub fn start(config: Config, collaborators: Collaborators) -> Self {
        let shutdown_token = CancellationToken::new();
        let drop_guard = shutdown_token.clone().drop_guard();
        let bus = collaborators.bus;
        let scheduler = DelayedScheduler::new();
        let queue = KeyedQueue::new(&shutdown_token);

        let (watcher, handle) = InvoiceWatcher::new(
            collaborators.invoices.clone(),
            bus.clone(),
            scheduler.clone(),
            config.watcher.clone(),
        );
        let watcher_shutdown = shutdown_token.clone();
        let background_tasks = vec![tokio::spawn(async move {
            if let Err(e) = watcher.run(watcher_shutdown).await {
                error!("Invoice watcher error: {}", e);
            }
        })];

        let sender = WebhookSender::new(
            collaborators.webhooks,
            collaborators.transport,
            queue.clone(),
            scheduler.clone(),
            config.webhooks.clone(),
        );
        let listener = PaymentListener::new(collaborators.invoices, bus.clone(), handle.clone());

        let mut subscriptions = handle.subscribe(&bus);
        subscriptions.extend(listener.subscribe(&bus));
        if config.webhooks.enabled {
            subscriptions.push(sender.subscribe(&bus));
        } else {
            info!("Webhook delivery disabled by configuration");
        }
        info!(subscriptions = subscriptions.len(), "Engine started");

        Self {
            config,
            bus,
            watcher: handle,
            sender,
            queue,
            scheduler,
            subscriptions,
            background_tasks,
            shutdown_token,
            drop_guard: Some(drop_guard),
        }
    }

    pub fn bus(&self) -> &EventBus {
        &self.bus
    }

    pub fn watcher(&self) -> &WatcherHandle {
        &self.watcher
    }

    /// Entry point for manual redelivery and test webhooks.
    pub fn sender(&self) -> &WebhookSender {
        &self.sender
    }

    /// Resume the work a previous run left behind: pending invoices and failed deliveries
    /// whose ladder was not finished.
    pub async fn rehydrate(&self) -> anyhow::Result<Rehydrated> {
        let invoices = self.watcher.rehydrate().await?;
        let redeliveries = self.sender.resume_redeliveries().await?;
        Ok(Rehydrated { invoices, redeliveries })
    }

    /// Stop everything. Returns false if in-flight work did not finish within
    /// `webhooks.shutdown_timeout`.
    pub async fn shutdown(self) -> bool {
        info!("Shutting down engine...");
        for subscription in &self.subscriptions {
            subscription.unsubscribe();
        }

        self.shutdown_token.cancel();
        self.scheduler.stop();

        let timeout = self.config.webhooks.shutdown_timeout;
        let queue_drained = self.queue.abort(timeout).await;

        let give_up = CancellationToken::new();
        let timer = {
            let give_up = give_up.clone();
            tokio::spawn(async move {
                tokio::time::sleep(timeout).await;
                give_up.cancel();
            })
        };
        let actions_finished = self.scheduler.wait_all_running(&give_up).await;
        timer.abort();

        for handle in self.background_tasks {
            if tokio::time::timeout(timeout, handle).await.is_err() {
                warn!("Background task did not stop in time");
            }
        }

        let clean = queue_drained && actions_finished;
        if clean {
            info!("Engine stopped");
        } else {
            warn!(queue_drained, actions_finished, "Engine stopped before in-flight work finished");
        }
        clean
    }
}
