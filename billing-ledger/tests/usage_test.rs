//! Usage metering and usage invoice tests.

mod common;

use common::TestApp;
use serde_json::json;

async fn create_active_subscription(app: &TestApp) -> String {
    let plan = app.create_plan("0.00", "monthly", 0).await;
    let response = app
        .create_subscription(app.tenant_id, plan["plan_id"].as_str().unwrap(), None)
        .await;
    assert_eq!(response.status(), 201);
    let subscription: serde_json::Value = response.json().await.unwrap();
    subscription["subscription_id"].as_str().unwrap().to_string()
}

fn usage_body(subscription_id: &str, metric: &str, quantity: &str, unit_price: &str) -> serde_json::Value {
    json!({
        "subscription_id": subscription_id,
        "metric_name": metric,
        "quantity": quantity,
        "unit_price": unit_price,
        "period_start": "2026-07-01",
        "period_end": "2026-07-31",
    })
}

#[tokio::test]
async fn record_usage_works() {
    let Some(app) = TestApp::try_spawn().await else {
        return;
    };

    let subscription_id = create_active_subscription(&app).await;
    let response = app
        .post(
            "/usage",
            &usage_body(&subscription_id, "api_calls", "500", "0.01"),
        )
        .await;
    assert_eq!(response.status(), 201);

    let record: serde_json::Value = response.json().await.unwrap();
    assert_eq!(record["metric_name"], "api_calls");
    assert_eq!(record["is_billed"], false);

    app.cleanup().await;
}

#[tokio::test]
async fn record_usage_with_idempotency_key_deduplicates() {
    let Some(app) = TestApp::try_spawn().await else {
        return;
    };

    let subscription_id = create_active_subscription(&app).await;
    let mut body = usage_body(&subscription_id, "api_calls", "500", "0.01");
    body["idempotency_key"] = json!("evt-001");

    let first = app.post("/usage", &body).await;
    assert_eq!(first.status(), 201);
    let first: serde_json::Value = first.json().await.unwrap();

    let second = app.post("/usage", &body).await;
    assert_eq!(second.status(), 201);
    let second: serde_json::Value = second.json().await.unwrap();

    assert_eq!(first["record_id"], second["record_id"]);

    let list = app
        .get(&format!("/usage?subscription_id={}", subscription_id))
        .await;
    let records: serde_json::Value = list.json().await.unwrap();
    assert_eq!(records.as_array().unwrap().len(), 1);

    app.cleanup().await;
}

#[tokio::test]
async fn aggregate_sums_unbilled_usage_per_metric() {
    let Some(app) = TestApp::try_spawn().await else {
        return;
    };

    let subscription_id = create_active_subscription(&app).await;

    let batch = json!({
        "records": [
            usage_body(&subscription_id, "api_calls", "600", "0.01"),
            usage_body(&subscription_id, "api_calls", "400", "0.01"),
            usage_body(&subscription_id, "storage_gb", "50", "10"),
        ]
    });
    let response = app.post("/usage/batch", &batch).await;
    assert_eq!(response.status(), 201);

    let response = app
        .get(&format!(
            "/usage/aggregate?subscription_id={}&period_start=2026-07-01&period_end=2026-07-31",
            subscription_id
        ))
        .await;
    assert_eq!(response.status(), 200);

    let summaries: serde_json::Value = response.json().await.unwrap();
    let summaries = summaries.as_array().unwrap();
    assert_eq!(summaries.len(), 2);

    let api_calls = &summaries[0];
    assert_eq!(api_calls["metric_name"], "api_calls");
    assert_eq!(api_calls["total_quantity"], "1000.0000");
    assert_eq!(api_calls["total_amount"], "10.00000000");

    let storage = &summaries[1];
    assert_eq!(storage["metric_name"], "storage_gb");
    assert_eq!(storage["total_amount"], "500.00000000");

    app.cleanup().await;
}

#[tokio::test]
async fn usage_invoice_bills_records_exactly_once() {
    let Some(app) = TestApp::try_spawn().await else {
        return;
    };

    let subscription_id = create_active_subscription(&app).await;

    let batch = json!({
        "records": [
            usage_body(&subscription_id, "api_calls", "1000", "0.01"),
            usage_body(&subscription_id, "storage_gb", "50", "10"),
        ]
    });
    app.post("/usage/batch", &batch).await;

    let body = json!({
        "subscription_id": subscription_id,
        "period_start": "2026-07-01",
        "period_end": "2026-07-31",
        "tenant_state_code": "29",
    });

    let response = app.post("/usage/generate-invoice", &body).await;
    assert_eq!(response.status(), 201);

    let invoice: serde_json::Value = response.json().await.unwrap();
    // subtotal = 1000 * 0.01 + 50 * 10 = 510.00
    assert_eq!(invoice["subtotal"], "510.00");
    assert_eq!(invoice["line_items"].as_array().unwrap().len(), 2);

    // All usage in the period is now billed.
    let list = app
        .get(&format!(
            "/usage?subscription_id={}&is_billed=false",
            subscription_id
        ))
        .await;
    let unbilled: serde_json::Value = list.json().await.unwrap();
    assert!(unbilled.as_array().unwrap().is_empty());

    // Repeating the call returns the same invoice instead of double-billing.
    let repeat = app.post("/usage/generate-invoice", &body).await;
    assert_eq!(repeat.status(), 201);
    let repeat: serde_json::Value = repeat.json().await.unwrap();
    assert_eq!(repeat["invoice_id"], invoice["invoice_id"]);

    app.cleanup().await;
}

#[tokio::test]
async fn negative_quantity_is_rejected() {
    let Some(app) = TestApp::try_spawn().await else {
        return;
    };

    let subscription_id = create_active_subscription(&app).await;
    let response = app
        .post(
            "/usage",
            &usage_body(&subscription_id, "api_calls", "-5", "0.01"),
        )
        .await;
    assert_eq!(response.status(), 400);

    app.cleanup().await;
}
