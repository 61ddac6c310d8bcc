//! Invoice handlers.

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    Json,
};
use serde_json::json;
use service_core::error::AppError;
use uuid::Uuid;

use crate::middleware::TenantContext;
use crate::models::{
    GenerateInvoiceRequest, Invoice, InvoiceWithLines, ListInvoicesFilter, MarkPaidRequest,
};
use crate::services::metrics;
use crate::startup::AppState;

/// Generate the invoice for a subscription's current billing period.
/// Idempotent: a repeat call for the same period returns the existing
/// invoice.
pub async fn generate_invoice(
    State(state): State<AppState>,
    tenant: TenantContext,
    Json(payload): Json<GenerateInvoiceRequest>,
) -> Result<(StatusCode, Json<InvoiceWithLines>), AppError> {
    let invoice = state
        .db
        .generate_subscription_invoice(tenant.tenant_id, payload.subscription_id, &state.config.tax)
        .await?;

    metrics::record_invoice_generated(&tenant.tenant_id.to_string(), "subscription");

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
    state
        .audit
        .record(
            &tenant.actor,
            "invoice.generated",
            "invoice",
            &invoice.invoice.invoice_id.to_string(),
            None,
            Some(json!({ "invoice_number": invoice.invoice.invoice_number })),
        )
        .await;

    Ok((StatusCode::CREATED, Json(invoice)))
}

/// Get an invoice with its line items.
pub async fn get_invoice(
    State(state): State<AppState>,
    tenant: TenantContext,
    Path(invoice_id): Path<Uuid>,
) -> Result<Json<InvoiceWithLines>, AppError> {
    let invoice = state
        .db
        .get_invoice(tenant.tenant_id, invoice_id)
        .await?
        .ok_or_else(|| AppError::NotFound(anyhow::anyhow!("Invoice not found")))?;

    let line_items = state.db.get_line_items(tenant.tenant_id, invoice_id).await?;

    Ok(Json(InvoiceWithLines {
        invoice,
        line_items,
    }))
}

/// List invoices for the calling tenant.
pub async fn list_invoices(
    State(state): State<AppState>,
    tenant: TenantContext,
    Query(filter): Query<ListInvoicesFilter>,
) -> Result<Json<Vec<Invoice>>, AppError> {
    let invoices = state.db.list_invoices(tenant.tenant_id, &filter).await?;
    Ok(Json(invoices))
}

/// Apply a payment amount to an invoice. Overpayment is rejected, not
/// clamped.
pub async fn mark_paid(
    State(state): State<AppState>,
    tenant: TenantContext,
    Path(invoice_id): Path<Uuid>,
    Json(payload): Json<MarkPaidRequest>,
) -> Result<Json<Invoice>, AppError> {
    let before = state
        .db
        .get_invoice(tenant.tenant_id, invoice_id)
        .await?
        .map(|i| json!({ "status": i.status, "paid_amount": i.paid_amount }));

    let invoice = state
        .db
        .mark_invoice_paid(
            tenant.tenant_id,
            invoice_id,
            payload.paid_amount,
            payload.payment_date,
        )
        .await?;

    state
        .audit
        .record(
            &tenant.actor,
            "invoice.marked_paid",
            "invoice",
            &invoice.invoice_id.to_string(),
            before,
            Some(json!({ "status": invoice.status, "paid_amount": invoice.paid_amount })),
        )
        .await;

    Ok(Json(invoice))
}
