//! Coupon and redemption models.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

/// Discount type for coupons.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DiscountType {
    Percentage,
    Fixed,
}

impl DiscountType {
    pub fn as_str(&self) -> &'static str {
        match self {
            DiscountType::Percentage => "percentage",
            DiscountType::Fixed => "fixed",
        }
    }

    pub fn from_string(s: &str) -> Self {
        match s {
            "fixed" => DiscountType::Fixed,
            _ => DiscountType::Percentage,
        }
    }
}

/// A discount definition.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Coupon {
    pub coupon_id: Uuid,
    pub code: String,
    pub discount_type: String,
    pub discount_value: Decimal,
    pub max_discount_amount: Option<Decimal>,
    pub valid_from: DateTime<Utc>,
    pub valid_until: DateTime<Utc>,
    pub max_uses: i32,
    pub max_uses_per_tenant: i32,
    pub times_used: i32,
    /// Empty means applicable to all plans.
    pub applicable_plan_ids: Vec<Uuid>,
    pub min_subscription_value: Decimal,
    pub is_active: bool,
    pub created_utc: DateTime<Utc>,
}

/// One applied use of a coupon.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct CouponRedemption {
    pub redemption_id: Uuid,
    pub coupon_id: Uuid,
    pub tenant_id: Uuid,
    pub subscription_id: Uuid,
    pub discount_amount: Decimal,
    pub used_utc: DateTime<Utc>,
}

/// Input for creating a coupon.
#[derive(Debug, Clone, Deserialize)]
pub struct CreateCoupon {
    pub code: String,
    pub discount_type: DiscountType,
    pub discount_value: Decimal,
    pub max_discount_amount: Option<Decimal>,
    pub valid_from: DateTime<Utc>,
    pub valid_until: DateTime<Utc>,
    pub max_uses: i32,
    #[serde(default = "default_max_uses_per_tenant")]
    pub max_uses_per_tenant: i32,
    #[serde(default)]
    pub applicable_plan_ids: Vec<Uuid>,
    #[serde(default)]
    pub min_subscription_value: Decimal,
}

fn default_max_uses_per_tenant() -> i32 {
    1
}

/// Result of validating a coupon against a plan and subscription value.
#[derive(Debug, Clone, Serialize)]
pub struct CouponValidation {
    pub valid: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub discount_amount: Option<Decimal>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}
