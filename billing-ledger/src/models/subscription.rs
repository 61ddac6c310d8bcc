//! Subscription model and state machine.

use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use service_core::error::AppError;
use sqlx::FromRow;
use uuid::Uuid;

/// Subscription status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubscriptionStatus {
    Pending,
    Trial,
    Active,
    PastDue,
    Suspended,
    Cancelled,
    Expired,
}

impl SubscriptionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SubscriptionStatus::Pending => "pending",
            SubscriptionStatus::Trial => "trial",
            SubscriptionStatus::Active => "active",
            SubscriptionStatus::PastDue => "past_due",
            SubscriptionStatus::Suspended => "suspended",
            SubscriptionStatus::Cancelled => "cancelled",
            SubscriptionStatus::Expired => "expired",
        }
    }

    pub fn from_string(s: &str) -> Self {
        match s {
            "pending" => SubscriptionStatus::Pending,
            "trial" => SubscriptionStatus::Trial,
            "past_due" => SubscriptionStatus::PastDue,
            "suspended" => SubscriptionStatus::Suspended,
            "cancelled" => SubscriptionStatus::Cancelled,
            "expired" => SubscriptionStatus::Expired,
            _ => SubscriptionStatus::Active,
        }
    }

    /// Terminal states never transition further.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            SubscriptionStatus::Cancelled | SubscriptionStatus::Expired
        )
    }
}

/// Events that drive subscription state transitions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubscriptionEvent {
    StartTrial,
    PaymentRecorded,
    PaymentFailed,
    GraceElapsed,
    Suspend,
    Resume,
    Cancel,
    Expire,
}

impl SubscriptionEvent {
    pub fn as_str(&self) -> &'static str {
        match self {
            SubscriptionEvent::StartTrial => "start_trial",
            SubscriptionEvent::PaymentRecorded => "payment_recorded",
            SubscriptionEvent::PaymentFailed => "payment_failed",
            SubscriptionEvent::GraceElapsed => "grace_elapsed",
            SubscriptionEvent::Suspend => "suspend",
            SubscriptionEvent::Resume => "resume",
            SubscriptionEvent::Cancel => "cancel",
            SubscriptionEvent::Expire => "expire",
        }
    }
}

/// Pure transition function mapping (current state, event) to the next state.
///
/// Side-effect free; callers persist the result. Invalid pairs are rejected
/// with a 409-mapped error.
pub fn transition(
    current: SubscriptionStatus,
    event: SubscriptionEvent,
) -> Result<SubscriptionStatus, AppError> {
    use SubscriptionEvent as E;
    use SubscriptionStatus as S;

    let next = match (current, event) {
        (S::Pending, E::StartTrial) => S::Trial,
        (S::Pending, E::PaymentRecorded) => S::Active,
        (S::Trial, E::PaymentRecorded) => S::Active,
        (S::Trial, E::Expire) => S::Expired,
        (S::Active, E::PaymentFailed) => S::PastDue,
        (S::Active, E::Suspend) => S::Suspended,
        (S::Active, E::Expire) => S::Expired,
        (S::PastDue, E::PaymentRecorded) => S::Active,
        (S::PastDue, E::GraceElapsed) => S::Cancelled,
        (S::Suspended, E::Resume) => S::Active,
        (current, E::Cancel) if !current.is_terminal() => S::Cancelled,
        (current, event) => {
            return Err(AppError::Conflict(anyhow::anyhow!(
                "Illegal transition: {} -> {}",
                current.as_str(),
                event.as_str()
            )))
        }
    };

    Ok(next)
}

/// A tenant's contract for a plan.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Subscription {
    pub subscription_id: Uuid,
    pub tenant_id: Uuid,
    pub plan_id: Uuid,
    pub status: String,
    pub start_date: NaiveDate,
    pub end_date: Option<NaiveDate>,
    pub next_billing_date: Option<NaiveDate>,
    pub base_price: Decimal,
    pub discount_amount: Decimal,
    pub tax_amount: Decimal,
    pub total_amount: Decimal,
    pub currency: String,
    pub auto_renew: bool,
    pub coupon_code: Option<String>,
    pub tenant_state_code: String,
    pub cancellation_reason: Option<String>,
    pub cancelled_utc: Option<DateTime<Utc>>,
    pub created_utc: DateTime<Utc>,
    pub updated_utc: DateTime<Utc>,
}

/// Request body for creating a subscription.
#[derive(Debug, Clone, Deserialize)]
pub struct CreateSubscriptionRequest {
    pub plan_id: Uuid,
    pub coupon_code: Option<String>,
    /// Two-digit GST state code of the tenant's place of supply.
    pub tenant_state_code: String,
    #[serde(default = "default_auto_renew")]
    pub auto_renew: bool,
}

fn default_auto_renew() -> bool {
    true
}

/// Request body for cancelling a subscription.
#[derive(Debug, Clone, Deserialize)]
pub struct CancelSubscriptionRequest {
    pub reason: String,
}

/// Filter parameters for listing subscriptions.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ListSubscriptionsFilter {
    pub status: Option<SubscriptionStatus>,
    pub plan_id: Option<Uuid>,
    #[serde(default = "super::plan::default_page_size")]
    pub page_size: i32,
    pub page_token: Option<Uuid>,
}
