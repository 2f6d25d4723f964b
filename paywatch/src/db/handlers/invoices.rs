//! Invoice repository collaborator.

use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use dashmap::{DashMap, DashSet};
use tracing::instrument;

use crate::db::errors::{DbError, Result};
use crate::db::models::invoices::{Invoice, InvoiceState, Payment};
use crate::types::InvoiceId;

/// Outcome of recording a payment seen on chain.
#[derive(Debug, Clone, PartialEq)]
pub enum PaymentUpsert {
    /// First time we see this payment
    Added,
    /// Known payment whose confirmations or flags changed
    Updated { previous: Payment },
    /// Nothing changed
    Unchanged,
}

/// Storage operations the watcher and payment listener rely on.
///
/// Implementations must always return a fresh snapshot from `get_invoice`; the watcher
/// relies on re-reading persisted state every cycle instead of caching it.
#[async_trait]
pub trait InvoiceRepository: Send + Sync {
    async fn get_invoice(&self, id: &str) -> Result<Option<Invoice>>;

    async fn update_invoice_status(&self, id: &str, state: InvoiceState) -> Result<()>;

    /// Release the invoice's reserved receiving addresses.
    async fn unaffect_address(&self, id: &str) -> Result<()>;

    /// Invoices still in the watch set.
    async fn get_pending_invoices(&self) -> Result<Vec<InvoiceId>>;

    /// Remove an invoice from the watch set. Returns false if it was not there.
    async fn remove_pending_invoice(&self, id: &str) -> Result<bool>;

    async fn find_invoice_by_destination(&self, destination: &str) -> Result<Option<InvoiceId>>;

    async fn upsert_payment(&self, invoice_id: &str, payment: Payment) -> Result<PaymentUpsert>;

    /// Stop accounting every payment made by `tx_id`; returns the affected invoices.
    async fn unaccount_transaction(&self, tx_id: &str) -> Result<Vec<InvoiceId>>;
}

/// In-memory [`InvoiceRepository`] used by the standalone binary and the tests.
#[derive(Default)]
pub struct InMemoryInvoiceRepository {
    invoices: DashMap<InvoiceId, Invoice>,
    pending: DashSet<InvoiceId>,
    destinations: DashMap<String, InvoiceId>,
    released: DashSet<InvoiceId>,
    status_writes: AtomicUsize,
}

impl InMemoryInvoiceRepository {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a new invoice and put it in the watch set.
    pub fn insert(&self, invoice: Invoice) {
        for method in &invoice.payment_methods {
            self.destinations.insert(method.destination.clone(), invoice.id.clone());
        }
        self.pending.insert(invoice.id.clone());
        self.invoices.insert(invoice.id.clone(), invoice);
    }

    pub fn is_pending(&self, id: &str) -> bool {
        self.pending.contains(id)
    }

    pub fn is_address_released(&self, id: &str) -> bool {
        self.released.contains(id)
    }

    /// Number of `update_invoice_status` calls served so far.
    pub fn status_writes(&self) -> usize {
        self.status_writes.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl InvoiceRepository for InMemoryInvoiceRepository {
    async fn get_invoice(&self, id: &str) -> Result<Option<Invoice>> {
        Ok(self.invoices.get(id).map(|entry| entry.value().clone()))
    }

    #[instrument(skip(self), err)]
    async fn update_invoice_status(&self, id: &str, state: InvoiceState) -> Result<()> {
        let mut invoice = self.invoices.get_mut(id).ok_or(DbError::NotFound)?;
        invoice.status = state.status;
        invoice.exception_status = state.exception_status;
        self.status_writes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    #[instrument(skip(self), err)]
    async fn unaffect_address(&self, id: &str) -> Result<()> {
        if !self.invoices.contains_key(id) {
            return Err(DbError::NotFound);
        }
        self.released.insert(id.to_string());
        Ok(())
    }

    async fn get_pending_invoices(&self) -> Result<Vec<InvoiceId>> {
        let mut ids: Vec<InvoiceId> = self.pending.iter().map(|id| id.key().clone()).collect();
        ids.sort();
        Ok(ids)
    }

    #[instrument(skip(self), err)]
    async fn remove_pending_invoice(&self, id: &str) -> Result<bool> {
        Ok(self.pending.remove(id).is_some())
    }

    async fn find_invoice_by_destination(&self, destination: &str) -> Result<Option<InvoiceId>> {
        Ok(self.destinations.get(destination).map(|entry| entry.value().clone()))
    }

    #[instrument(skip(self, payment), fields(payment_id = %payment.id), err)]
    async fn upsert_payment(&self, invoice_id: &str, payment: Payment) -> Result<PaymentUpsert> {
        let mut invoice = self.invoices.get_mut(invoice_id).ok_or(DbError::NotFound)?;
        match invoice.payments.iter_mut().find(|p| p.id == payment.id) {
            Some(existing) if *existing == payment => Ok(PaymentUpsert::Unchanged),
            Some(existing) => {
                let previous = std::mem::replace(existing, payment);
                Ok(PaymentUpsert::Updated { previous })
            }
            None => {
                invoice.payments.push(payment);
                Ok(PaymentUpsert::Added)
            }
        }
    }

    #[instrument(skip(self), err)]
    async fn unaccount_transaction(&self, tx_id: &str) -> Result<Vec<InvoiceId>> {
        let prefix = format!("{tx_id}:");
        let mut affected = Vec::new();
        for mut entry in self.invoices.iter_mut() {
            let mut touched = false;
            for payment in entry.payments.iter_mut().filter(|p| p.accounted && p.id.starts_with(&prefix)) {
                payment.accounted = false;
                touched = true;
            }
            if touched {
                affected.push(entry.key().clone());
            }
        }
        affected.sort();
        Ok(affected)
    }
}
