//! Partner and commission models.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use service_core::error::AppError;
use sqlx::FromRow;
use uuid::Uuid;

/// Commission type for partners.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CommissionType {
    Percentage,
    Fixed,
}

impl CommissionType {
    pub fn as_str(&self) -> &'static str {
        match self {
            CommissionType::Percentage => "percentage",
            CommissionType::Fixed => "fixed",
        }
    }

    pub fn from_string(s: &str) -> Self {
        match s {
            "fixed" => CommissionType::Fixed,
            _ => CommissionType::Percentage,
        }
    }
}

/// Commission status. `pending -> approved -> paid`, or
/// `pending -> cancelled`; `paid` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CommissionStatus {
    Pending,
    Approved,
    Paid,
    Cancelled,
}

impl CommissionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            CommissionStatus::Pending => "pending",
            CommissionStatus::Approved => "approved",
            CommissionStatus::Paid => "paid",
            CommissionStatus::Cancelled => "cancelled",
        }
    }

    pub fn from_string(s: &str) -> Self {
        match s {
            "approved" => CommissionStatus::Approved,
            "paid" => CommissionStatus::Paid,
            "cancelled" => CommissionStatus::Cancelled,
            _ => CommissionStatus::Pending,
        }
    }

    /// Check that a status change is permitted by the commission machine.
    pub fn check_transition(&self, next: CommissionStatus) -> Result<(), AppError> {
        let legal = matches!(
            (self, next),
            (CommissionStatus::Pending, CommissionStatus::Approved)
                | (CommissionStatus::Pending, CommissionStatus::Cancelled)
                | (CommissionStatus::Approved, CommissionStatus::Paid)
        );
        if legal {
            Ok(())
        } else {
            Err(AppError::Conflict(anyhow::anyhow!(
                "Illegal commission status change: {} -> {}",
                self.as_str(),
                next.as_str()
            )))
        }
    }
}

/// A reseller/affiliate earning commission on tenant payments.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Partner {
    pub partner_id: Uuid,
    pub name: String,
    pub commission_type: String,
    pub commission_value: Decimal,
    pub is_active: bool,
    pub created_utc: DateTime<Utc>,
}

/// Earnings owed to a partner for one payment. Exactly one row per payment.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Commission {
    pub commission_id: Uuid,
    pub partner_id: Uuid,
    pub tenant_id: Uuid,
    pub payment_id: Uuid,
    pub base_amount: Decimal,
    pub commission_rate: Decimal,
    pub commission_amount: Decimal,
    pub status: String,
    pub created_utc: DateTime<Utc>,
    pub updated_utc: DateTime<Utc>,
}

/// Input for creating a partner.
#[derive(Debug, Clone, Deserialize)]
pub struct CreatePartner {
    pub name: String,
    pub commission_type: CommissionType,
    pub commission_value: Decimal,
}

/// Request body for computing a commission from a payment.
#[derive(Debug, Clone, Deserialize)]
pub struct ComputeCommissionRequest {
    pub payment_id: Uuid,
    pub partner_id: Uuid,
    /// Overrides the partner's default rate for this tenant when set.
    pub tenant_override_rate: Option<Decimal>,
}

/// Request body for a commission status change.
#[derive(Debug, Clone, Deserialize)]
pub struct UpdateCommissionRequest {
    pub status: CommissionStatus,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn forward_transitions_are_legal() {
        assert!(CommissionStatus::Pending
            .check_transition(CommissionStatus::Approved)
            .is_ok());
        assert!(CommissionStatus::Approved
            .check_transition(CommissionStatus::Paid)
            .is_ok());
        assert!(CommissionStatus::Pending
            .check_transition(CommissionStatus::Cancelled)
            .is_ok());
    }

    #[test]
    fn paid_is_terminal() {
        for next in [
            CommissionStatus::Pending,
            CommissionStatus::Approved,
            CommissionStatus::Cancelled,
        ] {
            assert!(CommissionStatus::Paid.check_transition(next).is_err());
        }
    }

    #[test]
    fn approved_cannot_be_cancelled() {
        assert!(CommissionStatus::Approved
            .check_transition(CommissionStatus::Cancelled)
            .is_err());
    }
}
