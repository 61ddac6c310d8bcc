//! Metrics module for billing-ledger.
//! Provides Prometheus metrics for ledger operations and per-tenant metering.

use once_cell::sync::Lazy;
use prometheus::{
    histogram_opts, opts, register_histogram_vec, register_int_counter_vec, Encoder, HistogramVec,
    IntCounterVec, TextEncoder,
};
use std::sync::OnceLock;

/// Database query duration histogram
pub static DB_QUERY_DURATION: Lazy<HistogramVec> = Lazy::new(|| {
    register_histogram_vec!(
        histogram_opts!("ledger_db_query_duration_seconds", "Database query duration"),
        &["operation"]
    )
    .expect("Failed to register DB_QUERY_DURATION")
});

/// Subscription operations counter (per-tenant metering)
pub static SUBSCRIPTION_OPERATIONS_TOTAL: OnceLock<IntCounterVec> = OnceLock::new();

/// Invoices generated counter (per-tenant metering)
pub static INVOICES_GENERATED_TOTAL: OnceLock<IntCounterVec> = OnceLock::new();

/// Usage records counter (per-tenant metering)
pub static USAGE_RECORDS_TOTAL: OnceLock<IntCounterVec> = OnceLock::new();

/// Payments recorded counter (per-tenant metering)
pub static PAYMENTS_RECORDED_TOTAL: OnceLock<IntCounterVec> = OnceLock::new();

/// Payment amount counter by currency (monetary tracking)
pub static PAYMENT_AMOUNT_TOTAL: OnceLock<prometheus::CounterVec> = OnceLock::new();

/// Coupon redemptions counter
pub static COUPON_REDEMPTIONS_TOTAL: OnceLock<IntCounterVec> = OnceLock::new();

/// Commissions computed counter
pub static COMMISSIONS_TOTAL: OnceLock<IntCounterVec> = OnceLock::new();

/// Error counter for alerting
pub static ERRORS_TOTAL: OnceLock<IntCounterVec> = OnceLock::new();

/// Initialize all metrics. Call once at startup.
pub fn init_metrics() {
    SUBSCRIPTION_OPERATIONS_TOTAL.get_or_init(|| {
        register_int_counter_vec!(
            opts!(
                "ledger_subscription_operations_total",
                "Total subscription operations by tenant and operation type"
            ),
            &["tenant_id", "operation"]
        )
        .expect("Failed to register SUBSCRIPTION_OPERATIONS_TOTAL")
    });

    INVOICES_GENERATED_TOTAL.get_or_init(|| {
        register_int_counter_vec!(
            opts!(
                "ledger_invoices_generated_total",
                "Total invoices generated by tenant and kind"
            ),
            &["tenant_id", "kind"]
        )
        .expect("Failed to register INVOICES_GENERATED_TOTAL")
    });

    USAGE_RECORDS_TOTAL.get_or_init(|| {
        register_int_counter_vec!(
            opts!(
                "ledger_usage_records_total",
                "Total usage records by tenant and metric"
            ),
            &["tenant_id", "metric_name"]
        )
        .expect("Failed to register USAGE_RECORDS_TOTAL")
    });

    PAYMENTS_RECORDED_TOTAL.get_or_init(|| {
        register_int_counter_vec!(
            opts!(
                "ledger_payments_recorded_total",
                "Total payments recorded by tenant and match status"
            ),
            &["tenant_id", "matched"]
        )
        .expect("Failed to register PAYMENTS_RECORDED_TOTAL")
    });

    PAYMENT_AMOUNT_TOTAL.get_or_init(|| {
        prometheus::register_counter_vec!(
            prometheus::opts!(
                "ledger_payment_amount_total",
                "Total payment amount by tenant and currency"
            ),
            &["tenant_id", "currency"]
        )
        .expect("Failed to register PAYMENT_AMOUNT_TOTAL")
    });

    COUPON_REDEMPTIONS_TOTAL.get_or_init(|| {
        register_int_counter_vec!(
            opts!(
                "ledger_coupon_redemptions_total",
                "Total coupon redemptions by code"
            ),
            &["code"]
        )
        .expect("Failed to register COUPON_REDEMPTIONS_TOTAL")
    });

    COMMISSIONS_TOTAL.get_or_init(|| {
        register_int_counter_vec!(
            opts!(
                "ledger_commissions_total",
                "Total commissions computed by partner"
            ),
            &["partner_id"]
        )
        .expect("Failed to register COMMISSIONS_TOTAL")
    });

    ERRORS_TOTAL.get_or_init(|| {
        register_int_counter_vec!(
            opts!("ledger_errors_total", "Total errors by type for alerting"),
            &["error_type", "operation"]
        )
        .expect("Failed to register ERRORS_TOTAL")
    });

    // Force initialization of lazy statics
    let _ = &*DB_QUERY_DURATION;
}

/// Get metrics in Prometheus text format.
pub fn get_metrics() -> String {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();
    encoder
        .encode(&metric_families, &mut buffer)
        .expect("Failed to encode metrics");
    String::from_utf8(buffer).expect("Failed to convert metrics to string")
}

/// Record a subscription operation.
pub fn record_subscription_operation(tenant_id: &str, operation: &str) {
    if let Some(counter) = SUBSCRIPTION_OPERATIONS_TOTAL.get() {
        counter.with_label_values(&[tenant_id, operation]).inc();
    }
}

/// Record an invoice generation.
pub fn record_invoice_generated(tenant_id: &str, kind: &str) {
    if let Some(counter) = INVOICES_GENERATED_TOTAL.get() {
        counter.with_label_values(&[tenant_id, kind]).inc();
    }
}

/// Record a usage record insertion.
pub fn record_usage_operation(tenant_id: &str, metric_name: &str) {
    if let Some(counter) = USAGE_RECORDS_TOTAL.get() {
        counter.with_label_values(&[tenant_id, metric_name]).inc();
    }
}

/// Record a payment.
pub fn record_payment(tenant_id: &str, matched: bool, currency: &str, amount: f64) {
    if let Some(counter) = PAYMENTS_RECORDED_TOTAL.get() {
        counter
            .with_label_values(&[tenant_id, if matched { "true" } else { "false" }])
            .inc();
    }
    if let Some(counter) = PAYMENT_AMOUNT_TOTAL.get() {
        counter
            .with_label_values(&[tenant_id, currency])
            .inc_by(amount.abs());
    }
}

/// Record a coupon redemption.
pub fn record_coupon_redemption(code: &str) {
    if let Some(counter) = COUPON_REDEMPTIONS_TOTAL.get() {
        counter.with_label_values(&[code]).inc();
    }
}

/// Record a commission computation.
pub fn record_commission(partner_id: &str) {
    if let Some(counter) = COMMISSIONS_TOTAL.get() {
        counter.with_label_values(&[partner_id]).inc();
    }
}

/// Record an error for alerting.
pub fn record_error(error_type: &str, operation: &str) {
    if let Some(counter) = ERRORS_TOTAL.get() {
        counter.with_label_values(&[error_type, operation]).inc();
    }
}
