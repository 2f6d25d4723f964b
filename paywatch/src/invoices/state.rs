//! One evaluation pass of the invoice status state machine.
//!
//! [`evaluate`] is pure: it mutates the in-memory snapshot and reports what the caller must
//! persist and publish. The watcher loop is the only caller allowed to write the result
//! back.

use chrono::{DateTime, Utc};
use tracing::error;

use crate::db::models::invoices::{Invoice, InvoiceExceptionStatus, InvoiceStatus};
use crate::events::InvoiceEventCode;

use super::accounting::{self, PaymentMethodAccounting};

/// What an evaluation pass changed.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct UpdateContext {
    /// Events to publish, in order, after persisting
    pub events: Vec<InvoiceEventCode>,
    /// Status or exception status changed
    pub dirty: bool,
    /// Reserved receiving addresses should be released
    pub unaffect_address: bool,
}

impl UpdateContext {
    fn event(&mut self, code: InvoiceEventCode) {
        self.events.push(code);
    }

    fn set_exception(&mut self, invoice: &mut Invoice, exception: InvoiceExceptionStatus) {
        if invoice.exception_status != exception {
            invoice.exception_status = exception;
            self.dirty = true;
        }
    }

    fn transition(&mut self, invoice: &mut Invoice, next: InvoiceStatus) {
        if invoice.status == next {
            return;
        }
        if !invoice.status.can_transition_to(next) {
            error!(invoice_id = %invoice.id, from = %invoice.status, to = %next, "Refusing illegal status transition");
            return;
        }
        invoice.status = next;
        self.dirty = true;
    }
}

/// Run one pass of the state machine over `invoice` at time `now`.
pub fn evaluate(invoice: &mut Invoice, now: DateTime<Utc>) -> UpdateContext {
    let mut ctx = UpdateContext::default();
    let selected = accounting::nearest_to_zero(invoice).map(|(method, accounting)| (method.clone(), accounting));

    if invoice.status == InvoiceStatus::New && now > invoice.expiration_time {
        ctx.unaffect_address = true;
        ctx.transition(invoice, InvoiceStatus::Expired);
        ctx.event(InvoiceEventCode::Expired);
        if invoice.exception_status == InvoiceExceptionStatus::PaidPartial {
            ctx.event(InvoiceEventCode::ExpiredPaidPartial);
        }
    }

    let Some((method, accounting)) = selected else {
        return ctx;
    };

    if matches!(invoice.status, InvoiceStatus::New | InvoiceStatus::Expired) {
        apply_payments(invoice, &accounting, &mut ctx);
    }

    if matches!(
        invoice.status,
        InvoiceStatus::Paid | InvoiceStatus::Confirmed | InvoiceStatus::Complete
    ) {
        track_paid_over(invoice, &accounting, &mut ctx);
    }

    if invoice.status == InvoiceStatus::Paid {
        demote_if_underpaid(invoice, &accounting, &mut ctx);
    }

    if invoice.status == InvoiceStatus::Paid {
        let policy = invoice.speed_policy;
        if let Some(confirmed) = accounting::compute(invoice, &method, |p| p.is_confirmed(policy)) {
            if now > invoice.monitoring_expiration && confirmed.paid < accounting.minimum_total_due {
                ctx.unaffect_address = true;
                ctx.transition(invoice, InvoiceStatus::Invalid);
                ctx.event(InvoiceEventCode::FailedToConfirm);
            } else if confirmed.paid >= accounting.minimum_total_due {
                ctx.unaffect_address = true;
                ctx.transition(invoice, InvoiceStatus::Confirmed);
                ctx.event(InvoiceEventCode::Confirmed);
            }
        }
    }

    if invoice.status == InvoiceStatus::Confirmed {
        if let Some(completed) = accounting::compute(invoice, &method, |p| p.is_completed()) {
            if completed.paid >= accounting.minimum_total_due {
                ctx.transition(invoice, InvoiceStatus::Complete);
                ctx.event(InvoiceEventCode::Completed);
            }
        }
    }

    ctx
}

fn apply_payments(invoice: &mut Invoice, accounting: &PaymentMethodAccounting, ctx: &mut UpdateContext) {
    if accounting.paid >= accounting.minimum_total_due {
        if invoice.status == InvoiceStatus::New {
            ctx.unaffect_address = true;
            ctx.transition(invoice, InvoiceStatus::Paid);
            let exception = if accounting.paid > accounting.total_due {
                InvoiceExceptionStatus::PaidOver
            } else {
                InvoiceExceptionStatus::None
            };
            ctx.set_exception(invoice, exception);
            ctx.event(InvoiceEventCode::PaidInFull);
        } else if invoice.exception_status != InvoiceExceptionStatus::PaidLate {
            ctx.set_exception(invoice, InvoiceExceptionStatus::PaidLate);
            ctx.event(InvoiceEventCode::PaidAfterExpiration);
        }
    } else if invoice.accounted_payments().next().is_some() {
        ctx.set_exception(invoice, InvoiceExceptionStatus::PaidPartial);
    }
}

/// Payments keep arriving and disappearing after the invoice was paid, so PaidOver follows
/// the accounting for as long as the invoice is settled.
fn track_paid_over(invoice: &mut Invoice, accounting: &PaymentMethodAccounting, ctx: &mut UpdateContext) {
    if invoice.exception_status == InvoiceExceptionStatus::PaidOver
        && accounting.paid <= accounting.total_due
        && accounting.paid >= accounting.minimum_total_due
    {
        ctx.set_exception(invoice, InvoiceExceptionStatus::None);
    }

    if accounting.paid > accounting.total_due {
        ctx.set_exception(invoice, InvoiceExceptionStatus::PaidOver);
    }
}

/// Payments can disappear after the invoice was paid (double spend, RBF replacement).
fn demote_if_underpaid(invoice: &mut Invoice, accounting: &PaymentMethodAccounting, ctx: &mut UpdateContext) {
    if accounting.paid < accounting.minimum_total_due {
        ctx.transition(invoice, InvoiceStatus::New);
        let exception = if accounting.paid.is_zero() {
            InvoiceExceptionStatus::None
        } else {
            InvoiceExceptionStatus::PaidPartial
        };
        ctx.set_exception(invoice, exception);
    }
}
