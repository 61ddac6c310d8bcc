//! Plan catalog handlers (admin surface).

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    Json,
};
use serde_json::json;
use service_core::error::AppError;
use uuid::Uuid;

use crate::models::{CreatePlan, ListPlansFilter, Plan, UpdatePlan};
use crate::startup::AppState;

/// Create a new plan.
pub async fn create_plan(
    State(state): State<AppState>,
    Json(payload): Json<CreatePlan>,
) -> Result<(StatusCode, Json<Plan>), AppError> {
    let plan = state.db.create_plan(&payload).await?;

    state
        .audit
        .record(
            "admin",
            "plan.created",
            "plan",
            &plan.plan_id.to_string(),
            None,
            Some(json!({ "name": plan.name, "price": plan.price })),
        )
        .await;

    Ok((StatusCode::CREATED, Json(plan)))
}

/// Get a plan by ID.
pub async fn get_plan(
    State(state): State<AppState>,
    Path(plan_id): Path<Uuid>,
) -> Result<Json<Plan>, AppError> {
    let plan = state
        .db
        .get_plan(plan_id)
        .await?
        .ok_or_else(|| AppError::NotFound(anyhow::anyhow!("Plan not found")))?;

    Ok(Json(plan))
}

/// List plans.
pub async fn list_plans(
    State(state): State<AppState>,
    Query(filter): Query<ListPlansFilter>,
) -> Result<Json<Vec<Plan>>, AppError> {
    let plans = state.db.list_plans(&filter).await?;
    Ok(Json(plans))
}

/// Update a plan's mutable fields.
pub async fn update_plan(
    State(state): State<AppState>,
    Path(plan_id): Path<Uuid>,
    Json(payload): Json<UpdatePlan>,
) -> Result<Json<Plan>, AppError> {
    let plan = state
        .db
        .update_plan(plan_id, &payload)
        .await?
        .ok_or_else(|| AppError::NotFound(anyhow::anyhow!("Plan not found")))?;

    Ok(Json(plan))
}

/// Deactivate a plan. Plans are never deleted once referenced.
pub async fn deactivate_plan(
    State(state): State<AppState>,
    Path(plan_id): Path<Uuid>,
) -> Result<Json<Plan>, AppError> {
    let plan = state
        .db
        .deactivate_plan(plan_id)
        .await?
        .ok_or_else(|| AppError::NotFound(anyhow::anyhow!("Plan not found or already inactive")))?;

    state
        .audit
        .record(
            "admin",
            "plan.deactivated",
            "plan",
            &plan.plan_id.to_string(),
            None,
            None,
        )
        .await;

    Ok(Json(plan))
}
