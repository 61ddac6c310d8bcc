//! Billing plan model.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

/// Billing cycle for plans.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BillingCycle {
    Monthly,
    Quarterly,
    Yearly,
    OneTime,
}

impl BillingCycle {
    pub fn as_str(&self) -> &'static str {
        match self {
            BillingCycle::Monthly => "monthly",
            BillingCycle::Quarterly => "quarterly",
            BillingCycle::Yearly => "yearly",
            BillingCycle::OneTime => "one_time",
        }
    }

    pub fn from_string(s: &str) -> Self {
        match s {
            "quarterly" => BillingCycle::Quarterly,
            "yearly" => BillingCycle::Yearly,
            "one_time" => BillingCycle::OneTime,
            _ => BillingCycle::Monthly,
        }
    }

    /// Number of months the cycle spans; `None` for one-time plans.
    pub fn months(&self) -> Option<u32> {
        match self {
            BillingCycle::Monthly => Some(1),
            BillingCycle::Quarterly => Some(3),
            BillingCycle::Yearly => Some(12),
            BillingCycle::OneTime => None,
        }
    }
}

/// A purchasable plan tier.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Plan {
    pub plan_id: Uuid,
    pub name: String,
    pub description: Option<String>,
    pub billing_cycle: String,
    pub price: Decimal,
    pub currency: String,
    pub limits: Option<serde_json::Value>,
    pub trial_days: i32,
    pub is_active: bool,
    pub created_utc: DateTime<Utc>,
    pub updated_utc: DateTime<Utc>,
}

/// Input for creating a plan.
#[derive(Debug, Clone, Deserialize)]
pub struct CreatePlan {
    pub name: String,
    pub description: Option<String>,
    pub billing_cycle: BillingCycle,
    pub price: Decimal,
    pub currency: String,
    pub limits: Option<serde_json::Value>,
    #[serde(default)]
    pub trial_days: i32,
}

/// Input for updating a plan. Billing cycle is immutable once the plan is
/// referenced by a live subscription, so it is not updatable here.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct UpdatePlan {
    pub name: Option<String>,
    pub description: Option<String>,
    pub price: Option<Decimal>,
    pub limits: Option<serde_json::Value>,
    pub trial_days: Option<i32>,
}

/// Filter parameters for listing plans.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ListPlansFilter {
    #[serde(default)]
    pub include_inactive: bool,
    #[serde(default = "default_page_size")]
    pub page_size: i32,
    pub page_token: Option<Uuid>,
}

pub(crate) fn default_page_size() -> i32 {
    50
}
