//! Partner and commission handlers.

use axum::{
    extract::{Path, State},
    http::StatusCode,
    Json,
};
use serde_json::json;
use service_core::error::AppError;
use uuid::Uuid;

use crate::models::{
    Commission, ComputeCommissionRequest, CreatePartner, Partner, UpdateCommissionRequest,
};
use crate::services::metrics;
use crate::startup::AppState;

/// Create a partner (admin surface).
pub async fn create_partner(
    State(state): State<AppState>,
    Json(payload): Json<CreatePartner>,
) -> Result<(StatusCode, Json<Partner>), AppError> {
    let partner = state.db.create_partner(&payload).await?;
    Ok((StatusCode::CREATED, Json(partner)))
}

/// Get a partner by ID.
pub async fn get_partner(
    State(state): State<AppState>,
    Path(partner_id): Path<Uuid>,
) -> Result<Json<Partner>, AppError> {
    let partner = state
        .db
        .get_partner(partner_id)
        .await?
        .ok_or_else(|| AppError::NotFound(anyhow::anyhow!("Partner not found")))?;

    Ok(Json(partner))
}

/// Compute the commission for a payment. Exactly one commission exists per
/// payment; recomputation returns it unchanged.
pub async fn compute_commission(
    State(state): State<AppState>,
    Json(payload): Json<ComputeCommissionRequest>,
) -> Result<(StatusCode, Json<Commission>), AppError> {
    let commission = state
        .db
        .create_commission(
            payload.payment_id,
            payload.partner_id,
            payload.tenant_override_rate,
        )
        .await?;

    metrics::record_commission(&commission.partner_id.to_string());

    state
        .audit
        .record(
            "system",
            "commission.computed",
            "commission",
            &commission.commission_id.to_string(),
            None,
            Some(json!({
                "payment_id": commission.payment_id,
                "commission_amount": commission.commission_amount,
            })),
        )
        .await;

    Ok((StatusCode::CREATED, Json(commission)))
}

/// List commissions for a partner.
pub async fn list_commissions(
    State(state): State<AppState>,
    Path(partner_id): Path<Uuid>,
) -> Result<Json<Vec<Commission>>, AppError> {
    let commissions = state.db.list_commissions(partner_id).await?;
    Ok(Json(commissions))
}

/// Change a commission's status along its state machine.
pub async fn update_commission(
    State(state): State<AppState>,
    Path(commission_id): Path<Uuid>,
    Json(payload): Json<UpdateCommissionRequest>,
) -> Result<Json<Commission>, AppError> {
    let before = state
        .db
        .get_commission(commission_id)
        .await?
        .map(|c| json!({ "status": c.status }));

    let commission = state
        .db
        .update_commission_status(commission_id, payload.status)
        .await?;

    state
        .audit
        .record(
            "admin",
            "commission.transitioned",
            "commission",
            &commission.commission_id.to_string(),
            before,
            Some(json!({ "status": commission.status })),
        )
        .await;

    Ok(Json(commission))
}
