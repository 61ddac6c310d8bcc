//! Payment recording handlers.
//!
//! The recording endpoint consumes gateway-confirmed events (webhooks).
//! The raw body is read before JSON parsing so the HMAC signature can be
//! verified over exactly what the gateway signed.

use axum::{
    extract::{Query, State},
    http::{HeaderMap, StatusCode},
    Json,
};
use rust_decimal::prelude::ToPrimitive;
use serde_json::json;
use service_core::error::AppError;

use crate::middleware::TenantContext;
use crate::models::{ListPaymentsFilter, Payment, RecordPaymentRequest};
use crate::services::metrics;
use crate::startup::AppState;

pub const WEBHOOK_SIGNATURE_HEADER: &str = "x-webhook-signature";

/// Record a gateway payment confirmation. Re-delivery of the same
/// `gateway_transaction_id` returns the original payment.
pub async fn record_payment(
    State(state): State<AppState>,
    tenant: TenantContext,
    headers: HeaderMap,
    body: String,
) -> Result<(StatusCode, Json<Payment>), AppError> {
    let signature = headers
        .get(WEBHOOK_SIGNATURE_HEADER)
        .and_then(|v| v.to_str().ok());
    state.webhook_verifier.verify(&body, signature)?;

    let payload: RecordPaymentRequest = serde_json::from_str(&body)
        .map_err(|e| AppError::BadRequest(anyhow::anyhow!("Invalid payment payload: {}", e)))?;

    tracing::info!(
        tenant_id = %tenant.tenant_id,
        gateway = %payload.gateway_name,
        gateway_transaction_id = %payload.gateway_transaction_id,
        amount = %payload.amount,
        "Recording payment confirmation"
    );

    let recorded = state.db.record_payment(tenant.tenant_id, &payload).await?;
    let payment = recorded.payment;

    if recorded.newly_recorded {
        metrics::record_payment(
            &tenant.tenant_id.to_string(),
            !payment.unmatched,
            &payment.currency,
            payment.amount.to_f64().unwrap_or(0.0),
        );

        state
            .events
            .emit(
                "payment.recorded",
                json!({
                    "payment_id": payment.payment_id,
                    "tenant_id": tenant.tenant_id,
                    "amount": payment.amount,
                    "unmatched": payment.unmatched,
                }),
            )
            .await;
        state
            .audit
            .record(
                &tenant.actor,
                "payment.recorded",
                "payment",
                &payment.payment_id.to_string(),
                None,
                Some(json!({
                    "gateway_transaction_id": payment.gateway_transaction_id,
                    "amount": payment.amount,
                })),
            )
            .await;
    }

    let status = if recorded.newly_recorded {
        StatusCode::CREATED
    } else {
        StatusCode::OK
    };

    Ok((status, Json(payment)))
}

/// List payments for the calling tenant, including unmatched confirmations
/// held for manual reconciliation.
pub async fn list_payments(
    State(state): State<AppState>,
    tenant: TenantContext,
    Query(filter): Query<ListPaymentsFilter>,
) -> Result<Json<Vec<Payment>>, AppError> {
    let payments = state.db.list_payments(tenant.tenant_id, &filter).await?;
    Ok(Json(payments))
}
