//! Usage metering handlers.

use axum::{
    extract::{Query, State},
    http::StatusCode,
    Json,
};
use chrono::NaiveDate;
use serde::Deserialize;
use serde_json::json;
use service_core::error::AppError;
use uuid::Uuid;

use crate::middleware::TenantContext;
use crate::models::{
    GenerateUsageInvoiceRequest, InvoiceWithLines, ListUsageFilter, RecordUsage, RecordUsageBatch,
    UsageRecord, UsageSummary,
};
use crate::services::metrics;
use crate::startup::AppState;

/// Record a metered usage quantity. Repeat deliveries with the same
/// idempotency key return the original record.
pub async fn record_usage(
    State(state): State<AppState>,
    tenant: TenantContext,
    Json(payload): Json<RecordUsage>,
) -> Result<(StatusCode, Json<UsageRecord>), AppError> {
    let record = state.db.record_usage(tenant.tenant_id, &payload).await?;

    metrics::record_usage_operation(&tenant.tenant_id.to_string(), &record.metric_name);

    Ok((StatusCode::CREATED, Json(record)))
}

/// Record a batch of usage quantities.
pub async fn record_usage_batch(
    State(state): State<AppState>,
    tenant: TenantContext,
    Json(payload): Json<RecordUsageBatch>,
) -> Result<(StatusCode, Json<Vec<UsageRecord>>), AppError> {
    let mut records = Vec::with_capacity(payload.records.len());
    for input in &payload.records {
        let record = state.db.record_usage(tenant.tenant_id, input).await?;
        metrics::record_usage_operation(&tenant.tenant_id.to_string(), &record.metric_name);
        records.push(record);
    }

    Ok((StatusCode::CREATED, Json(records)))
}

/// List usage records for the calling tenant.
pub async fn list_usage(
    State(state): State<AppState>,
    tenant: TenantContext,
    Query(filter): Query<ListUsageFilter>,
) -> Result<Json<Vec<UsageRecord>>, AppError> {
    let records = state.db.list_usage_records(tenant.tenant_id, &filter).await?;
    Ok(Json(records))
}

#[derive(Debug, Deserialize)]
pub struct AggregateUsageQuery {
    pub subscription_id: Uuid,
    pub period_start: NaiveDate,
    pub period_end: NaiveDate,
}

/// Aggregate unbilled usage per metric over a period.
pub async fn aggregate_usage(
    State(state): State<AppState>,
    tenant: TenantContext,
    Query(query): Query<AggregateUsageQuery>,
) -> Result<Json<Vec<UsageSummary>>, AppError> {
    let summaries = state
        .db
        .aggregate_usage(
            tenant.tenant_id,
            query.subscription_id,
            query.period_start,
            query.period_end,
        )
        .await?;

    Ok(Json(summaries))
}

/// Generate an invoice from aggregated unbilled usage. Line items and
/// billing marks land in one transaction.
pub async fn generate_usage_invoice(
    State(state): State<AppState>,
    tenant: TenantContext,
    Json(payload): Json<GenerateUsageInvoiceRequest>,
) -> Result<(StatusCode, Json<InvoiceWithLines>), AppError> {
    let invoice = state
        .db
        .generate_usage_invoice(
            tenant.tenant_id,
            payload.subscription_id,
            payload.period_start,
            payload.period_end,
            &payload.tenant_state_code,
            &state.config.tax,
        )
        .await?;

    metrics::record_invoice_generated(&tenant.tenant_id.to_string(), "usage");

    state
        .events
        .emit(
            "invoice.generated",
            json!({
                "invoice_id": invoice.invoice.invoice_id,
                "invoice_number": invoice.invoice.invoice_number,
                "tenant_id": tenant.tenant_id,
                "total_amount": invoice.invoice.total_amount,
            }),
        )
        .await;

    Ok((StatusCode::CREATED, Json(invoice)))
}
