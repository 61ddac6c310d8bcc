//! Payment model.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

/// Payment status as confirmed by the gateway.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PaymentStatus {
    Completed,
    Refunded,
}

impl PaymentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            PaymentStatus::Completed => "completed",
            PaymentStatus::Refunded => "refunded",
        }
    }

    pub fn from_string(s: &str) -> Self {
        match s {
            "refunded" => PaymentStatus::Refunded,
            _ => PaymentStatus::Completed,
        }
    }
}

/// A confirmed transfer of funds. The unique gateway transaction id makes
/// recording at-most-once.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Payment {
    pub payment_id: Uuid,
    pub tenant_id: Uuid,
    pub invoice_id: Option<Uuid>,
    pub subscription_id: Option<Uuid>,
    pub gateway_name: String,
    pub gateway_transaction_id: String,
    pub amount: Decimal,
    pub currency: String,
    pub status: String,
    /// Set when no matching invoice/subscription was found; the confirmation
    /// is stored for manual reconciliation instead of being rejected.
    pub unmatched: bool,
    pub recorded_utc: DateTime<Utc>,
}

/// Gateway confirmation payload for recording a payment.
#[derive(Debug, Clone, Deserialize)]
pub struct RecordPaymentRequest {
    pub gateway_name: String,
    pub gateway_transaction_id: String,
    pub amount: Decimal,
    #[serde(default = "default_currency")]
    pub currency: String,
    pub invoice_id: Option<Uuid>,
    pub subscription_id: Option<Uuid>,
}

fn default_currency() -> String {
    "INR".to_string()
}

/// Filter parameters for listing payments.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ListPaymentsFilter {
    pub invoice_id: Option<Uuid>,
    pub subscription_id: Option<Uuid>,
    pub unmatched: Option<bool>,
    #[serde(default = "super::plan::default_page_size")]
    pub page_size: i32,
    pub page_token: Option<Uuid>,
}
