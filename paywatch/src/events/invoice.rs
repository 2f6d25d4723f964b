//! Domain events published by the invoice watcher and consumed from the chain indexer.

use std::fmt;

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::db::models::invoices::{Invoice, Payment};

/// Named invoice events, each with a stable numeric code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum InvoiceEventCode {
    Created,
    ReceivedPayment,
    PaidInFull,
    Expired,
    Confirmed,
    Completed,
    MarkedInvalid,
    PaidAfterExpiration,
    FailedToConfirm,
    PaymentSettled,
    ExpiredPaidPartial,
    MarkedCompleted,
}

impl InvoiceEventCode {
    pub fn code(self) -> u32 {
        match self {
            Self::Created => 1001,
            Self::ReceivedPayment => 1002,
            Self::PaidInFull => 1003,
            Self::Expired => 1004,
            Self::Confirmed => 1005,
            Self::Completed => 1006,
            Self::MarkedInvalid => 1008,
            Self::PaidAfterExpiration => 1009,
            Self::FailedToConfirm => 1013,
            Self::PaymentSettled => 1014,
            Self::ExpiredPaidPartial => 2000,
            Self::MarkedCompleted => 2008,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Self::Created => "invoice_created",
            Self::ReceivedPayment => "invoice_receivedPayment",
            Self::PaidInFull => "invoice_paidInFull",
            Self::Expired => "invoice_expired",
            Self::Confirmed => "invoice_confirmed",
            Self::Completed => "invoice_completed",
            Self::MarkedInvalid => "invoice_markedInvalid",
            Self::PaidAfterExpiration => "invoice_paidAfterExpiration",
            Self::FailedToConfirm => "invoice_failedToConfirm",
            Self::PaymentSettled => "invoice_paymentSettled",
            Self::ExpiredPaidPartial => "invoice_expiredPaidPartial",
            Self::MarkedCompleted => "invoice_markedComplete",
        }
    }
}

impl fmt::Display for InvoiceEventCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.name(), self.code())
    }
}

/// Something happened to an invoice. Carries the invoice as it was right after.
#[derive(Debug, Clone)]
pub struct InvoiceEvent {
    pub code: InvoiceEventCode,
    pub invoice: Invoice,
    /// Set for `ReceivedPayment` and `PaymentSettled`
    pub payment: Option<Payment>,
}

impl InvoiceEvent {
    pub fn new(invoice: Invoice, code: InvoiceEventCode) -> Self {
        Self {
            code,
            invoice,
            payment: None,
        }
    }

    pub fn with_payment(invoice: Invoice, code: InvoiceEventCode, payment: Payment) -> Self {
        Self {
            code,
            invoice,
            payment: Some(payment),
        }
    }
}

/// Published before any status-specific [`InvoiceEvent`] whenever a watch cycle persisted.
#[derive(Debug, Clone)]
pub struct InvoiceDataChangedEvent {
    pub invoice: Invoice,
}

/// The invoice left the watch set; no more events will be produced for it.
#[derive(Debug, Clone)]
pub struct InvoiceStopWatchedEvent {
    pub invoice: Invoice,
}

/// Published by the invoice-creation path outside this crate.
#[derive(Debug, Clone)]
pub struct InvoiceCreatedEvent {
    pub invoice: Invoice,
}

/// A block was connected on some chain.
#[derive(Debug, Clone)]
pub struct NewBlockEvent {
    pub crypto_code: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransactionData {
    pub tx_id: String,
    pub confirmations: u32,
    /// Signals replace-by-fee
    pub replaceable: bool,
    /// Ids of transactions this one double-spends
    #[serde(default)]
    pub replacing: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransactionOutput {
    pub address: String,
    pub value: Decimal,
    pub index: u32,
}

/// A wallet transaction was seen or re-seen by the chain indexer.
#[derive(Debug, Clone)]
pub struct NewOnChainTransactionEvent {
    pub crypto_code: String,
    pub derivation_strategy: String,
    pub transaction: TransactionData,
    pub outputs: Vec<TransactionOutput>,
}
