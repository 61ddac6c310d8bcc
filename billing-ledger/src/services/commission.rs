//! Partner commission calculation.

use crate::models::CommissionType;
use crate::services::tax::round_minor;
use rust_decimal::Decimal;

/// Compute the commission owed on a payment amount.
///
/// `rate` is the tenant override when present, otherwise the partner's
/// configured value. Percentage commissions round half-up to the minor unit,
/// so recomputation for the same inputs is deterministic.
pub fn compute(payment_amount: Decimal, commission_type: CommissionType, rate: Decimal) -> Decimal {
    match commission_type {
        CommissionType::Percentage => round_minor(payment_amount * rate / Decimal::from(100)),
        CommissionType::Fixed => round_minor(rate),
    }
}
