//! Coupon handlers.

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    Json,
};
use chrono::Utc;
use serde::Deserialize;
use service_core::error::AppError;
use uuid::Uuid;

use crate::middleware::TenantContext;
use crate::models::{Coupon, CouponValidation, CreateCoupon};
use crate::services::coupon as coupon_engine;
use crate::startup::AppState;

/// Create a coupon (admin surface).
pub async fn create_coupon(
    State(state): State<AppState>,
    Json(payload): Json<CreateCoupon>,
) -> Result<(StatusCode, Json<Coupon>), AppError> {
    let coupon = state.db.create_coupon(&payload).await?;
    Ok((StatusCode::CREATED, Json(coupon)))
}

/// Get a coupon by code.
pub async fn get_coupon(
    State(state): State<AppState>,
    Path(code): Path<String>,
) -> Result<Json<Coupon>, AppError> {
    let coupon = state
        .db
        .get_coupon_by_code(&code)
        .await?
        .ok_or_else(|| AppError::NotFound(anyhow::anyhow!("Coupon not found")))?;

    Ok(Json(coupon))
}

#[derive(Debug, Deserialize)]
pub struct ValidateCouponQuery {
    pub plan_id: Uuid,
}

/// Validate a coupon against a plan for the calling tenant. Validation
/// failures are reported in the body, not as error statuses.
pub async fn validate_coupon(
    State(state): State<AppState>,
    tenant: TenantContext,
    Path(code): Path<String>,
    Query(query): Query<ValidateCouponQuery>,
) -> Result<Json<CouponValidation>, AppError> {
    let coupon = match state.db.get_coupon_by_code(&code).await? {
        Some(coupon) => coupon,
        None => {
            return Ok(Json(CouponValidation {
                valid: false,
                discount_amount: None,
                error: Some("Coupon not found".to_string()),
            }))
        }
    };

    let plan = state
        .db
        .get_plan(query.plan_id)
        .await?
        .ok_or_else(|| AppError::NotFound(anyhow::anyhow!("Plan not found")))?;

    let redemptions = state
        .db
        .count_tenant_redemptions(coupon.coupon_id, tenant.tenant_id)
        .await?;

    let validation = match coupon_engine::validate(
        &coupon,
        plan.plan_id,
        plan.price,
        redemptions,
        Utc::now(),
    ) {
        Ok(()) => CouponValidation {
            valid: true,
            discount_amount: Some(coupon_engine::apply(&coupon, plan.price)),
            error: None,
        },
        Err(e) => CouponValidation {
            valid: false,
            discount_amount: None,
            error: Some(e.to_string()),
        },
    };

    Ok(Json(validation))
}
