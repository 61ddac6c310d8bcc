//! Coupon validation and pricing.
//!
//! Pure calculations with no side effects: the caller owns the atomic
//! `times_used` increment and redemption insert (same transaction as the
//! subscription write).

use crate::models::{Coupon, DiscountType};
use crate::services::tax::round_minor;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use service_core::error::AppError;
use uuid::Uuid;

/// Validate a coupon against a plan and subscription value at `now`.
///
/// `tenant_redemption_count` is the number of prior redemptions by this
/// tenant, read by the caller in the same transaction.
pub fn validate(
    coupon: &Coupon,
    plan_id: Uuid,
    subscription_value: Decimal,
    tenant_redemption_count: i64,
    now: DateTime<Utc>,
) -> Result<(), AppError> {
    if !coupon.is_active {
        return Err(AppError::BadRequest(anyhow::anyhow!(
            "Coupon '{}' is not active",
            coupon.code
        )));
    }

    if now < coupon.valid_from || now > coupon.valid_until {
        return Err(AppError::BadRequest(anyhow::anyhow!(
            "Coupon '{}' is outside its validity window",
            coupon.code
        )));
    }

    if coupon.times_used >= coupon.max_uses {
        return Err(AppError::Conflict(anyhow::anyhow!(
            "Coupon '{}' is exhausted",
            coupon.code
        )));
    }

    if tenant_redemption_count >= coupon.max_uses_per_tenant as i64 {
        return Err(AppError::Conflict(anyhow::anyhow!(
            "Coupon '{}' already redeemed the maximum number of times by this tenant",
            coupon.code
        )));
    }

    if !coupon.applicable_plan_ids.is_empty() && !coupon.applicable_plan_ids.contains(&plan_id) {
        return Err(AppError::BadRequest(anyhow::anyhow!(
            "Coupon '{}' is not applicable to this plan",
            coupon.code
        )));
    }

    if subscription_value < coupon.min_subscription_value {
        return Err(AppError::BadRequest(anyhow::anyhow!(
            "Subscription value below the coupon's minimum of {}",
            coupon.min_subscription_value
        )));
    }

    Ok(())
}

/// Compute the discount for a validated coupon.
///
/// The result is always within `[0, subscription_value]`.
pub fn apply(coupon: &Coupon, subscription_value: Decimal) -> Decimal {
    let discount = match DiscountType::from_string(&coupon.discount_type) {
        DiscountType::Percentage => {
            let raw = subscription_value * coupon.discount_value / Decimal::from(100);
            match coupon.max_discount_amount {
                Some(cap) => raw.min(cap),
                None => raw,
            }
        }
        DiscountType::Fixed => coupon.discount_value,
    };

    round_minor(discount.min(subscription_value).max(Decimal::ZERO))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn dec(s: &str) -> Decimal {
        s.parse().unwrap()
    }

    fn welcome20(now: DateTime<Utc>) -> Coupon {
        Coupon {
            coupon_id: Uuid::new_v4(),
            code: "WELCOME20".to_string(),
            discount_type: "percentage".to_string(),
            discount_value: dec("20"),
            max_discount_amount: None,
            valid_from: now - Duration::days(1),
            valid_until: now + Duration::days(30),
            max_uses: 100,
            max_uses_per_tenant: 1,
            times_used: 0,
            applicable_plan_ids: vec![],
            min_subscription_value: Decimal::ZERO,
            is_active: true,
            created_utc: now,
        }
    }

    #[test]
    fn percentage_discount_matches_fixture() {
        let now = Utc::now();
        let coupon = welcome20(now);
        assert_eq!(apply(&coupon, dec("2499.00")), dec("499.80"));
    }

    #[test]
    fn percentage_discount_respects_cap() {
        let now = Utc::now();
        let mut coupon = welcome20(now);
        coupon.max_discount_amount = Some(dec("100.00"));
        assert_eq!(apply(&coupon, dec("2499.00")), dec("100.00"));
    }

    #[test]
    fn fixed_discount_never_exceeds_subscription_value() {
        let now = Utc::now();
        let mut coupon = welcome20(now);
        coupon.discount_type = "fixed".to_string();
        coupon.discount_value = dec("500.00");
        assert_eq!(apply(&coupon, dec("300.00")), dec("300.00"));
        assert_eq!(apply(&coupon, dec("800.00")), dec("500.00"));
    }

    #[test]
    fn validate_rejects_outside_window() {
        let now = Utc::now();
        let mut coupon = welcome20(now);
        coupon.valid_until = now - Duration::hours(1);
        let err = validate(&coupon, Uuid::new_v4(), dec("100"), 0, now).unwrap_err();
        assert_eq!(err.kind(), "validation");
    }

    #[test]
    fn validate_rejects_exhausted_coupon() {
        let now = Utc::now();
        let mut coupon = welcome20(now);
        coupon.times_used = coupon.max_uses;
        let err = validate(&coupon, Uuid::new_v4(), dec("100"), 0, now).unwrap_err();
        assert_eq!(err.kind(), "state_conflict");
    }

    #[test]
    fn validate_enforces_per_tenant_cap() {
        let now = Utc::now();
        let coupon = welcome20(now);
        let err = validate(&coupon, Uuid::new_v4(), dec("100"), 1, now).unwrap_err();
        assert_eq!(err.kind(), "state_conflict");
    }

    #[test]
    fn validate_enforces_plan_applicability() {
        let now = Utc::now();
        let allowed = Uuid::new_v4();
        let mut coupon = welcome20(now);
        coupon.applicable_plan_ids = vec![allowed];

        assert!(validate(&coupon, allowed, dec("100"), 0, now).is_ok());
        assert!(validate(&coupon, Uuid::new_v4(), dec("100"), 0, now).is_err());
    }

    #[test]
    fn validate_enforces_min_subscription_value() {
        let now = Utc::now();
        let mut coupon = welcome20(now);
        coupon.min_subscription_value = dec("1000");
        assert!(validate(&coupon, Uuid::new_v4(), dec("999.99"), 0, now).is_err());
        assert!(validate(&coupon, Uuid::new_v4(), dec("1000.00"), 0, now).is_ok());
    }
}
