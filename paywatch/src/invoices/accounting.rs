//! Per-payment-method accounting, recomputed from payments on every evaluation.

use rust_decimal::{Decimal, RoundingStrategy};

use crate::db::models::invoices::{Invoice, Payment, PaymentMethod};

/// Derived totals for one payment method, in that method's unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PaymentMethodAccounting {
    pub total_due: Decimal,
    pub paid: Decimal,
    /// `total_due - paid`, may be negative
    pub due_uncapped: Decimal,
    pub due: Decimal,
    /// Smallest amount that still counts as fully paid, given the payment tolerance
    pub minimum_total_due: Decimal,
}

fn ceil_to(value: Decimal, divisibility: u32) -> Decimal {
    value.round_dp_with_strategy(divisibility, RoundingStrategy::ToPositiveInfinity)
}

/// Compute accounting for `method`, counting only accounted payments accepted by `include`.
///
/// Payments made with another method are converted through the locked rates. Returns `None`
/// if a rate is zero.
pub fn compute(invoice: &Invoice, method: &PaymentMethod, include: impl Fn(&Payment) -> bool) -> Option<PaymentMethodAccounting> {
    let divisibility = method.divisibility;
    let total_due = ceil_to(invoice.price.checked_div(method.rate)?, divisibility) + method.network_fee;

    let mut paid = Decimal::ZERO;
    for payment in invoice.accounted_payments().filter(|p| include(p)) {
        // Payments for a method the invoice no longer offers are ignored
        let Some(paid_with) = invoice.payment_method(&payment.payment_method_id) else {
            continue;
        };
        paid += (payment.value * paid_with.rate).checked_div(method.rate)?;
    }
    let paid = paid.round_dp(divisibility);

    let tolerance = Decimal::ONE - invoice.payment_tolerance / Decimal::ONE_HUNDRED;
    let due_uncapped = total_due - paid;

    Some(PaymentMethodAccounting {
        total_due,
        paid,
        due_uncapped,
        due: due_uncapped.max(Decimal::ZERO),
        minimum_total_due: ceil_to(total_due * tolerance, divisibility),
    })
}

/// The method closest to being exactly settled (smallest `|due_uncapped|`).
///
/// Ties go to the method listed first.
pub fn nearest_to_zero(invoice: &Invoice) -> Option<(&PaymentMethod, PaymentMethodAccounting)> {
    invoice
        .payment_methods
        .iter()
        .filter_map(|method| compute(invoice, method, |_| true).map(|accounting| (method, accounting)))
        .min_by_key(|(_, accounting)| accounting.due_uncapped.abs())
}
