//! Invoice and line item models.

use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use service_core::error::AppError;
use sqlx::FromRow;
use uuid::Uuid;

/// Invoice status. Transitions move forward only, except for explicit
/// cancellation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InvoiceStatus {
    Issued,
    PartiallyPaid,
    Paid,
    Cancelled,
}

impl InvoiceStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            InvoiceStatus::Issued => "issued",
            InvoiceStatus::PartiallyPaid => "partially_paid",
            InvoiceStatus::Paid => "paid",
            InvoiceStatus::Cancelled => "cancelled",
        }
    }

    pub fn from_string(s: &str) -> Self {
        match s {
            "partially_paid" => InvoiceStatus::PartiallyPaid,
            "paid" => InvoiceStatus::Paid,
            "cancelled" => InvoiceStatus::Cancelled,
            _ => InvoiceStatus::Issued,
        }
    }

    fn rank(&self) -> u8 {
        match self {
            InvoiceStatus::Issued => 0,
            InvoiceStatus::PartiallyPaid => 1,
            InvoiceStatus::Paid => 2,
            InvoiceStatus::Cancelled => 3,
        }
    }

    /// Check that a status change moves forward, or is an explicit
    /// cancellation of an unpaid invoice.
    pub fn check_transition(&self, next: InvoiceStatus) -> Result<(), AppError> {
        let legal = match next {
            InvoiceStatus::Cancelled => !matches!(self, InvoiceStatus::Paid),
            _ => next.rank() > self.rank() && !matches!(self, InvoiceStatus::Cancelled),
        };
        if legal {
            Ok(())
        } else {
            Err(AppError::Conflict(anyhow::anyhow!(
                "Illegal invoice status change: {} -> {}",
                self.as_str(),
                next.as_str()
            )))
        }
    }
}

/// A billable statement.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Invoice {
    pub invoice_id: Uuid,
    pub tenant_id: Uuid,
    pub subscription_id: Option<Uuid>,
    pub invoice_number: String,
    /// Deduplication key for at-most-once generation per billing period.
    pub invoice_period_key: Option<String>,
    pub status: String,
    pub subtotal: Decimal,
    pub discount_amount: Decimal,
    pub cgst_amount: Decimal,
    pub sgst_amount: Decimal,
    pub igst_amount: Decimal,
    pub tax_amount: Decimal,
    pub total_amount: Decimal,
    pub paid_amount: Decimal,
    pub balance_due: Decimal,
    pub currency: String,
    pub issue_date: NaiveDate,
    pub due_date: Option<NaiveDate>,
    pub created_utc: DateTime<Utc>,
    pub updated_utc: DateTime<Utc>,
}

/// One charge line on an invoice.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct LineItem {
    pub line_item_id: Uuid,
    pub invoice_id: Uuid,
    pub tenant_id: Uuid,
    pub description: String,
    pub metric_name: Option<String>,
    pub quantity: Decimal,
    pub unit_price: Decimal,
    pub amount: Decimal,
    pub tax_rate: Decimal,
    pub tax_amount: Decimal,
    pub sort_order: i32,
    pub created_utc: DateTime<Utc>,
}

/// Invoice together with its line items, as returned by the API.
#[derive(Debug, Clone, Serialize)]
pub struct InvoiceWithLines {
    #[serde(flatten)]
    pub invoice: Invoice,
    pub line_items: Vec<LineItem>,
}

/// Request body for generating an invoice.
#[derive(Debug, Clone, Deserialize)]
pub struct GenerateInvoiceRequest {
    pub subscription_id: Uuid,
}

/// Request body for generating a usage invoice.
#[derive(Debug, Clone, Deserialize)]
pub struct GenerateUsageInvoiceRequest {
    pub subscription_id: Uuid,
    pub period_start: NaiveDate,
    pub period_end: NaiveDate,
    /// Two-digit GST state code of the tenant's place of supply.
    pub tenant_state_code: String,
}

/// Request body for marking an invoice paid.
#[derive(Debug, Clone, Deserialize)]
pub struct MarkPaidRequest {
    pub paid_amount: Decimal,
    pub payment_date: NaiveDate,
}

/// Filter parameters for listing invoices.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ListInvoicesFilter {
    pub status: Option<InvoiceStatus>,
    pub subscription_id: Option<Uuid>,
    pub start_date: Option<NaiveDate>,
    pub end_date: Option<NaiveDate>,
    #[serde(default = "super::plan::default_page_size")]
    pub page_size: i32,
    pub page_token: Option<Uuid>,
}
