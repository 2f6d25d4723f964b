//! Invoice records as handed to us by the invoice repository.
//!
//! Only [`InvoiceState`] (status + exception status) is ever written back by this crate;
//! everything else is owned by the surrounding payment processor.

use std::fmt;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::types::{InvoiceId, StoreId};

/// Confirmations after which an on-chain payment is considered final.
pub const MAX_TRACKED_CONFIRMATIONS: u32 = 6;

/// Invoice lifecycle status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum InvoiceStatus {
    New,
    Expired,
    Paid,
    Confirmed,
    Complete,
    Invalid,
}

impl InvoiceStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::New => "new",
            Self::Expired => "expired",
            Self::Paid => "paid",
            Self::Confirmed => "confirmed",
            Self::Complete => "complete",
            Self::Invalid => "invalid",
        }
    }

    /// Whether the watcher may move an invoice from `self` to `next`.
    ///
    /// Staying in the same status is always allowed.
    pub fn can_transition_to(self, next: InvoiceStatus) -> bool {
        use InvoiceStatus::*;
        self == next
            || matches!(
                (self, next),
                (New, Expired) | (New, Paid) | (Expired, Paid) | (Paid, Confirmed) | (Paid, New) | (Confirmed, Complete) | (Paid, Invalid)
            )
    }
}

impl fmt::Display for InvoiceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Anomalies in the paid-vs-due relationship, orthogonal to [`InvoiceStatus`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum InvoiceExceptionStatus {
    #[default]
    None,
    PaidPartial,
    PaidOver,
    PaidLate,
    /// Status was forced by the merchant
    Marked,
}

/// How many confirmations a payment needs before the invoice counts as confirmed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum SpeedPolicy {
    /// Zero-conf, unless the transaction signals RBF
    HighSpeed,
    #[default]
    MediumSpeed,
    LowMediumSpeed,
    LowSpeed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PaymentType {
    OnChain,
    Lightning,
}

/// Crypto code plus the rail the payment travels on, e.g. `BTC-CHAIN`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PaymentMethodId {
    pub crypto_code: String,
    pub payment_type: PaymentType,
}

impl PaymentMethodId {
    pub fn on_chain(crypto_code: impl Into<String>) -> Self {
        Self {
            crypto_code: crypto_code.into(),
            payment_type: PaymentType::OnChain,
        }
    }

    pub fn lightning(crypto_code: impl Into<String>) -> Self {
        Self {
            crypto_code: crypto_code.into(),
            payment_type: PaymentType::Lightning,
        }
    }
}

impl fmt::Display for PaymentMethodId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.payment_type {
            PaymentType::OnChain => write!(f, "{}-CHAIN", self.crypto_code),
            PaymentType::Lightning => write!(f, "{}-LN", self.crypto_code),
        }
    }
}

/// A payment recorded against an invoice.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Payment {
    /// `txid:vout` for on-chain payments, payment hash for lightning
    pub id: String,
    pub payment_method_id: PaymentMethodId,
    /// Amount in units of the payment method's currency
    pub value: Decimal,
    /// False once the payment has been replaced (RBF) or double spent
    pub accounted: bool,
    pub confirmations: u32,
    /// The transaction signals replace-by-fee
    pub replaceable: bool,
    pub destination: String,
    pub received_at: DateTime<Utc>,
}

impl Payment {
    /// Whether the payment counts towards confirming an invoice with the given policy.
    pub fn is_confirmed(&self, policy: SpeedPolicy) -> bool {
        if self.payment_method_id.payment_type == PaymentType::Lightning {
            return true;
        }
        match policy {
            SpeedPolicy::HighSpeed => self.confirmations >= 1 || !self.replaceable,
            SpeedPolicy::MediumSpeed => self.confirmations >= 1,
            SpeedPolicy::LowMediumSpeed => self.confirmations >= 2,
            SpeedPolicy::LowSpeed => self.confirmations >= MAX_TRACKED_CONFIRMATIONS,
        }
    }

    /// Whether the payment is buried deep enough that the invoice can be completed.
    pub fn is_completed(&self) -> bool {
        self.payment_method_id.payment_type == PaymentType::Lightning || self.confirmations >= MAX_TRACKED_CONFIRMATIONS
    }
}

/// One way the invoice can be paid, with the rate locked at invoice creation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PaymentMethod {
    pub id: PaymentMethodId,
    /// Price currency per unit of this payment method's currency
    pub rate: Decimal,
    pub divisibility: u32,
    /// Flat fee added on top of the amount due
    pub network_fee: Decimal,
    /// Receiving address or BOLT11 invoice reserved for this invoice
    pub destination: String,
}

/// The mutable part of an invoice, as persisted by `update_invoice_status`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct InvoiceState {
    pub status: InvoiceStatus,
    pub exception_status: InvoiceExceptionStatus,
}

/// Invoice snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, bon::Builder)]
#[serde(rename_all = "camelCase")]
pub struct Invoice {
    #[builder(into)]
    pub id: InvoiceId,
    #[builder(into)]
    pub store_id: StoreId,
    pub price: Decimal,
    #[builder(into, default = "USD".to_string())]
    pub currency: String,
    #[builder(default = InvoiceStatus::New)]
    pub status: InvoiceStatus,
    #[builder(default)]
    pub exception_status: InvoiceExceptionStatus,
    #[builder(default = Utc::now())]
    pub created_at: DateTime<Utc>,
    pub expiration_time: DateTime<Utc>,
    pub monitoring_expiration: DateTime<Utc>,
    #[builder(default)]
    pub speed_policy: SpeedPolicy,
    /// Percentage of the amount due that may be missing while still counting as paid
    #[builder(default)]
    pub payment_tolerance: Decimal,
    #[builder(default)]
    pub payments: Vec<Payment>,
    #[builder(default)]
    pub payment_methods: Vec<PaymentMethod>,
}

impl Invoice {
    pub fn state(&self) -> InvoiceState {
        InvoiceState {
            status: self.status,
            exception_status: self.exception_status,
        }
    }

    /// Payments that still count towards the amount paid.
    pub fn accounted_payments(&self) -> impl Iterator<Item = &Payment> {
        self.payments.iter().filter(|p| p.accounted)
    }

    pub fn payment_method(&self, id: &PaymentMethodId) -> Option<&PaymentMethod> {
        self.payment_methods.iter().find(|m| &m.id == id)
    }

    /// Terminal for watching purposes: nothing more can happen to this invoice.
    pub fn is_finished(&self, now: DateTime<Utc>) -> bool {
        match self.status {
            InvoiceStatus::Complete => true,
            InvoiceStatus::Invalid | InvoiceStatus::Expired => self.monitoring_expiration < now,
            _ => false,
        }
    }
}
