//! Metered usage models.

use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

/// A metered quantity in a period.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct UsageRecord {
    pub record_id: Uuid,
    pub tenant_id: Uuid,
    pub subscription_id: Uuid,
    pub metric_name: String,
    pub quantity: Decimal,
    pub unit_price: Decimal,
    pub period_start: NaiveDate,
    pub period_end: NaiveDate,
    pub idempotency_key: Option<String>,
    pub is_billed: bool,
    pub billed_in_invoice_id: Option<Uuid>,
    pub created_utc: DateTime<Utc>,
}

/// Input for recording usage. The idempotency key guards against duplicate
/// recording from at-least-once upstream event delivery.
#[derive(Debug, Clone, Deserialize)]
pub struct RecordUsage {
    pub subscription_id: Uuid,
    pub metric_name: String,
    pub quantity: Decimal,
    pub unit_price: Decimal,
    pub period_start: NaiveDate,
    pub period_end: NaiveDate,
    pub idempotency_key: Option<String>,
}

/// Batch of usage records to insert.
#[derive(Debug, Clone, Deserialize)]
pub struct RecordUsageBatch {
    pub records: Vec<RecordUsage>,
}

/// Per-metric aggregate over unbilled records; the exact input to usage
/// invoice generation.
#[derive(Debug, Clone, Serialize, FromRow)]
pub struct UsageSummary {
    pub metric_name: String,
    pub unit_price: Decimal,
    pub total_quantity: Decimal,
    pub total_amount: Decimal,
}

/// Filter parameters for listing usage records.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ListUsageFilter {
    pub subscription_id: Option<Uuid>,
    pub metric_name: Option<String>,
    pub is_billed: Option<bool>,
    #[serde(default = "super::plan::default_page_size")]
    pub page_size: i32,
    pub page_token: Option<Uuid>,
}
