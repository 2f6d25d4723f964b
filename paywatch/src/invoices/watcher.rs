//! The invoice watcher: a single task that re-evaluates invoices on request.
//!
//! Watch requests arrive through a [`WatcherHandle`] (bus listeners, expiry timers, the
//! payment listener, retries) and are processed one at a time. Each request runs up to
//! `watcher.max_evaluation_loops` passes of [`state::evaluate`], persisting and publishing
//! after every pass, and stops early once a pass produces no events.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::FutureExt;
use metrics::counter;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use crate::config::WatcherConfig;
use crate::db::handlers::invoices::InvoiceRepository;
use crate::db::models::invoices::Invoice;
use crate::events::{
    EventBus, InvoiceCreatedEvent, InvoiceDataChangedEvent, InvoiceEvent, InvoiceEventCode, InvoiceStopWatchedEvent,
    Subscription,
};
use crate::tasks::DelayedScheduler;
use crate::types::InvoiceId;

use super::state;

/// Extra wait after a deadline so that the evaluation clearly sees it as passed.
const TIMER_SLACK: Duration = Duration::from_secs(1);

#[derive(Debug)]
pub enum WatcherMessage {
    /// Re-evaluate one invoice
    Watch(InvoiceId),
    /// Re-evaluate every invoice in the watch set
    WatchPending,
    /// A new invoice: announce it, then evaluate it
    Created(Box<Invoice>),
}

/// Cloneable sender side of the watcher mailbox.
#[derive(Clone)]
pub struct WatcherHandle {
    tx: mpsc::UnboundedSender<WatcherMessage>,
    repo: Arc<dyn InvoiceRepository>,
    scheduler: DelayedScheduler,
}

impl WatcherHandle {
    /// Request an evaluation of `invoice_id`. Returns false once the watcher has stopped.
    pub fn watch(&self, invoice_id: impl Into<InvoiceId>) -> bool {
        self.tx.send(WatcherMessage::Watch(invoice_id.into())).is_ok()
    }

    pub fn watch_pending(&self) -> bool {
        self.tx.send(WatcherMessage::WatchPending).is_ok()
    }

    /// Request an evaluation after `delay`.
    pub fn watch_after(&self, invoice_id: impl Into<InvoiceId>, delay: Duration) -> bool {
        let handle = self.clone();
        let invoice_id = invoice_id.into();
        self.scheduler.schedule(delay, move || async move {
            handle.watch(invoice_id);
        })
    }

    /// Arm evaluations at the invoice's expiration and monitoring deadlines, skipping those
    /// already behind `now`.
    pub fn track(&self, invoice: &Invoice, now: DateTime<Utc>) {
        for deadline in [invoice.expiration_time, invoice.monitoring_expiration] {
            let Ok(delay) = (deadline - now).to_std() else {
                continue;
            };
            if !delay.is_zero() {
                self.watch_after(invoice.id.clone(), delay + TIMER_SLACK);
            }
        }
    }

    /// Re-arm timers and queue an evaluation for every invoice left in the watch set.
    #[instrument(skip(self), err)]
    pub async fn rehydrate(&self) -> anyhow::Result<usize> {
        let now = Utc::now();
        let pending = self.repo.get_pending_invoices().await?;
        let mut watched = 0;
        for invoice_id in pending {
            let Some(invoice) = self.repo.get_invoice(&invoice_id).await? else {
                warn!(%invoice_id, "Pending invoice not found");
                continue;
            };
            self.track(&invoice, now);
            if self.watch(invoice_id) {
                watched += 1;
            }
        }
        info!(watched, "Rehydrated invoice watch set");
        Ok(watched)
    }

    /// Route creation and payment events into the mailbox.
    pub fn subscribe(&self, bus: &EventBus) -> Vec<Subscription> {
        let created = {
            let handle = self.clone();
            bus.subscribe(move |event: &InvoiceCreatedEvent| {
                handle.track(&event.invoice, Utc::now());
                handle
                    .tx
                    .send(WatcherMessage::Created(Box::new(event.invoice.clone())))
                    .map_err(|_| anyhow::anyhow!("invoice watcher is not running"))
            })
        };
        let payments = {
            let handle = self.clone();
            bus.subscribe(move |event: &InvoiceEvent| {
                if event.code == InvoiceEventCode::ReceivedPayment {
                    handle.watch(event.invoice.id.clone());
                }
                Ok(())
            })
        };
        vec![created, payments]
    }
}

pub struct InvoiceWatcher {
    repo: Arc<dyn InvoiceRepository>,
    bus: EventBus,
    handle: WatcherHandle,
    rx: mpsc::UnboundedReceiver<WatcherMessage>,
    config: WatcherConfig,
}

impl InvoiceWatcher {
    pub fn new(
        repo: Arc<dyn InvoiceRepository>,
        bus: EventBus,
        scheduler: DelayedScheduler,
        config: WatcherConfig,
    ) -> (Self, WatcherHandle) {
        let (tx, rx) = mpsc::unbounded_channel();
        let handle = WatcherHandle {
            tx,
            repo: repo.clone(),
            scheduler,
        };
        let watcher = Self {
            repo,
            bus,
            handle: handle.clone(),
            rx,
            config,
        };
        (watcher, handle)
    }

    #[cfg(test)]
    pub(crate) fn rx_for_tests(&mut self) -> &mut mpsc::UnboundedReceiver<WatcherMessage> {
        &mut self.rx
    }

    /// Process watch requests until `shutdown` fires.
    pub async fn run(mut self, shutdown: CancellationToken) -> anyhow::Result<()> {
        info!("Invoice watcher started");
        loop {
            let message = tokio::select! {
                biased;
                _ = shutdown.cancelled() => break,
                message = self.rx.recv() => match message {
                    Some(message) => message,
                    None => break,
                },
            };

            match message {
                WatcherMessage::Watch(invoice_id) => self.watch(&invoice_id).await,
                WatcherMessage::WatchPending => match self.repo.get_pending_invoices().await {
                    Ok(pending) => {
                        debug!(count = pending.len(), "Watching all pending invoices");
                        for invoice_id in pending {
                            self.handle.watch(invoice_id);
                        }
                    }
                    Err(e) => error!(error = %e, "Failed to list pending invoices"),
                },
                WatcherMessage::Created(invoice) => {
                    let invoice_id = invoice.id.clone();
                    self.bus.publish(InvoiceEvent::new(*invoice, InvoiceEventCode::Created));
                    self.watch(&invoice_id).await;
                }
            }
        }
        info!("Invoice watcher stopped");
        Ok(())
    }

    /// Evaluate one invoice, re-queuing it after `retry_delay` if anything goes wrong.
    async fn watch(&self, invoice_id: &str) {
        let outcome = AssertUnwindSafe(self.update_invoice(invoice_id)).catch_unwind().await;
        let failed = match outcome {
            Ok(Ok(())) => false,
            Ok(Err(e)) => {
                error!(%invoice_id, error = %e, "Invoice evaluation failed");
                true
            }
            Err(_) => {
                error!(%invoice_id, "Invoice evaluation panicked");
                true
            }
        };
        if failed {
            self.handle.watch_after(invoice_id, self.config.retry_delay);
        }
    }

    #[instrument(skip(self))]
    async fn update_invoice(&self, invoice_id: &str) -> anyhow::Result<()> {
        for _ in 0..self.config.max_evaluation_loops {
            let Some(mut invoice) = self.repo.get_invoice(invoice_id).await? else {
                debug!("Invoice not found, dropping it from the watch set");
                self.repo.remove_pending_invoice(invoice_id).await?;
                return Ok(());
            };

            let now = Utc::now();
            let previous = invoice.state();
            let ctx = state::evaluate(&mut invoice, now);

            if ctx.unaffect_address {
                self.repo.unaffect_address(invoice_id).await?;
            }
            if ctx.dirty {
                self.repo.update_invoice_status(invoice_id, invoice.state()).await?;
                counter!("paywatch_invoice_transitions_total", "status" => invoice.status.as_str()).increment(1);
                info!(
                    from = %previous.status,
                    to = %invoice.status,
                    exception = ?invoice.exception_status,
                    "Invoice updated"
                );
                self.bus.publish(InvoiceDataChangedEvent {
                    invoice: invoice.clone(),
                });
            }
            for code in &ctx.events {
                debug!(event = %code, "Publishing invoice event");
                self.bus.publish(InvoiceEvent::new(invoice.clone(), *code));
            }

            if invoice.is_finished(now) {
                if self.repo.remove_pending_invoice(invoice_id).await? {
                    info!(status = %invoice.status, "Invoice no longer watched");
                    self.bus.publish(InvoiceStopWatchedEvent { invoice });
                }
                return Ok(());
            }
            if ctx.events.is_empty() {
                break;
            }
        }
        Ok(())
    }
}
