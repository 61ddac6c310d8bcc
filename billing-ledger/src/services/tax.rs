//! Tax calculation.
//!
//! Single jurisdictional model: intra-state supplies split the flat rate
//! evenly into CGST and SGST; inter-state supplies carry the full rate as
//! IGST. The split changes attribution, never the total.

use rust_decimal::{Decimal, RoundingStrategy};
use serde::Serialize;

/// Round to the currency's minor unit, half-up.
pub(crate) fn round_minor(amount: Decimal) -> Decimal {
    amount.round_dp_with_strategy(2, RoundingStrategy::MidpointAwayFromZero)
}

/// Tax split for one taxable amount.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct TaxBreakdown {
    pub cgst: Decimal,
    pub sgst: Decimal,
    pub igst: Decimal,
    pub total_tax: Decimal,
}

/// Compute the tax split for `taxable_amount` at the flat `rate` (percent).
///
/// `total_tax` is rounded once; for intra-state supplies SGST takes the
/// residual after CGST so the halves always sum to the total exactly.
pub fn compute_tax(
    taxable_amount: Decimal,
    tenant_state_code: &str,
    platform_state_code: &str,
    rate: Decimal,
) -> TaxBreakdown {
    let total_tax = round_minor(taxable_amount * rate / Decimal::from(100));

    if tenant_state_code == platform_state_code {
        let cgst = round_minor(taxable_amount * rate / Decimal::from(200));
        TaxBreakdown {
            cgst,
            sgst: total_tax - cgst,
            igst: Decimal::ZERO,
            total_tax,
        }
    } else {
        TaxBreakdown {
            cgst: Decimal::ZERO,
            sgst: Decimal::ZERO,
            igst: total_tax,
            total_tax,
        }
    }
}
