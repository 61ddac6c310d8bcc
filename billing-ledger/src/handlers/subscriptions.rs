//! Subscription handlers.
//!
//! All operations are scoped to the tenant from the request context.

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    Json,
};
use serde::Deserialize;
use serde_json::json;
use service_core::error::AppError;
use uuid::Uuid;

use crate::middleware::TenantContext;
use crate::models::{
    CancelSubscriptionRequest, CreateSubscriptionRequest, ListSubscriptionsFilter, Subscription,
    SubscriptionEvent,
};
use crate::services::metrics;
use crate::startup::AppState;

/// Create a subscription for the calling tenant, applying the coupon (if
/// any) and computing tax in the same transaction.
pub async fn create_subscription(
    State(state): State<AppState>,
    tenant: TenantContext,
    Json(payload): Json<CreateSubscriptionRequest>,
) -> Result<(StatusCode, Json<Subscription>), AppError> {
    tracing::info!(
        tenant_id = %tenant.tenant_id,
        plan_id = %payload.plan_id,
        coupon = payload.coupon_code.as_deref().unwrap_or("-"),
        "Creating subscription"
    );

    let subscription = state
        .db
        .create_subscription(tenant.tenant_id, &payload, &state.config.tax)
        .await?;

    metrics::record_subscription_operation(&tenant.tenant_id.to_string(), "create");
    if let Some(code) = &payload.coupon_code {
        metrics::record_coupon_redemption(code);
    }

    state
        .events
        .emit(
            "subscription.created",
            json!({
                "subscription_id": subscription.subscription_id,
                "tenant_id": tenant.tenant_id,
                "total_amount": subscription.total_amount,
            }),
        )
        .await;
    state
        .audit
        .record(
            &tenant.actor,
            "subscription.created",
            "subscription",
            &subscription.subscription_id.to_string(),
            None,
            Some(json!({ "status": subscription.status, "plan_id": subscription.plan_id })),
        )
        .await;

    Ok((StatusCode::CREATED, Json(subscription)))
}

/// Get a subscription by ID.
pub async fn get_subscription(
    State(state): State<AppState>,
    tenant: TenantContext,
    Path(subscription_id): Path<Uuid>,
) -> Result<Json<Subscription>, AppError> {
    let subscription = state
        .db
        .get_subscription(tenant.tenant_id, subscription_id)
        .await?
        .ok_or_else(|| AppError::NotFound(anyhow::anyhow!("Subscription not found")))?;

    Ok(Json(subscription))
}

/// List subscriptions for the calling tenant.
pub async fn list_subscriptions(
    State(state): State<AppState>,
    tenant: TenantContext,
    Query(filter): Query<ListSubscriptionsFilter>,
) -> Result<Json<Vec<Subscription>>, AppError> {
    let subscriptions = state
        .db
        .list_subscriptions(tenant.tenant_id, &filter)
        .await?;

    Ok(Json(subscriptions))
}

/// Cancel a subscription, recording the reason. Legal from any non-terminal
/// state.
pub async fn cancel_subscription(
    State(state): State<AppState>,
    tenant: TenantContext,
    Path(subscription_id): Path<Uuid>,
    Json(payload): Json<CancelSubscriptionRequest>,
) -> Result<Json<Subscription>, AppError> {
    let before = state
        .db
        .get_subscription(tenant.tenant_id, subscription_id)
        .await?
        .map(|s| json!({ "status": s.status }));

    let subscription = state
        .db
        .cancel_subscription(tenant.tenant_id, subscription_id, &payload.reason)
        .await?;

    metrics::record_subscription_operation(&tenant.tenant_id.to_string(), "cancel");

    state
        .events
        .emit(
            "subscription.cancelled",
            json!({
                "subscription_id": subscription.subscription_id,
                "tenant_id": tenant.tenant_id,
                "reason": payload.reason,
            }),
        )
        .await;
    state
        .audit
        .record(
            &tenant.actor,
            "subscription.cancelled",
            "subscription",
            &subscription.subscription_id.to_string(),
            before,
            Some(json!({ "status": subscription.status })),
        )
        .await;

    Ok(Json(subscription))
}

#[derive(Debug, Deserialize)]
pub struct ApplyEventRequest {
    pub event: SubscriptionEvent,
}

/// Apply a state-machine event to a subscription (scheduler/support
/// surface). Illegal transitions are rejected with a 409.
pub async fn apply_event(
    State(state): State<AppState>,
    tenant: TenantContext,
    Path(subscription_id): Path<Uuid>,
    Json(payload): Json<ApplyEventRequest>,
) -> Result<Json<Subscription>, AppError> {
    let current = state
        .db
        .get_subscription(tenant.tenant_id, subscription_id)
        .await?;

    // grace_elapsed only fires once the configured window past the missed
    // billing date has actually passed.
    if payload.event == SubscriptionEvent::GraceElapsed {
        if let Some(subscription) = &current {
            if let Some(next_billing) = subscription.next_billing_date {
                let deadline =
                    next_billing + chrono::Duration::days(state.config.billing.grace_period_days);
                if chrono::Utc::now().date_naive() < deadline {
                    return Err(AppError::Conflict(anyhow::anyhow!(
                        "Grace period has not elapsed (until {})",
                        deadline
                    )));
                }
            }
        }
    }

    let before = current.map(|s| json!({ "status": s.status }));

    let subscription = state
        .db
        .apply_subscription_event(tenant.tenant_id, subscription_id, payload.event)
        .await?;

    metrics::record_subscription_operation(&tenant.tenant_id.to_string(), payload.event.as_str());

    state
        .audit
        .record(
            &tenant.actor,
            "subscription.transitioned",
            "subscription",
            &subscription.subscription_id.to_string(),
            before,
            Some(json!({ "status": subscription.status })),
        )
        .await;

    Ok(Json(subscription))
}
