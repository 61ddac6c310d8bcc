//! Invoice generation and payment application tests.

mod common;

use common::TestApp;
use serde_json::json;

async fn create_active_subscription(app: &TestApp, price: &str) -> serde_json::Value {
    let plan = app.create_plan(price, "monthly", 0).await;
    let response = app
        .create_subscription(app.tenant_id, plan["plan_id"].as_str().unwrap(), None)
        .await;
    assert_eq!(response.status(), 201);
    response.json().await.unwrap()
}

#[tokio::test]
async fn generate_invoice_builds_totals_from_subscription() {
    let Some(app) = TestApp::try_spawn().await else {
        return;
    };

    let subscription = create_active_subscription(&app, "2499.00").await;
    let response = app
        .post(
            "/invoices/generate",
            &json!({ "subscription_id": subscription["subscription_id"] }),
        )
        .await;
    assert_eq!(response.status(), 201);

    let invoice: serde_json::Value = response.json().await.unwrap();
    assert_eq!(invoice["status"], "issued");
    assert_eq!(invoice["subtotal"], "2499.00");
    assert_eq!(invoice["total_amount"], "2948.82");
    assert_eq!(invoice["balance_due"], "2948.82");
    assert!(invoice["invoice_number"]
        .as_str()
        .unwrap()
        .starts_with("INV-"));
    assert_eq!(invoice["line_items"].as_array().unwrap().len(), 1);

    // Intra-state split: CGST and SGST carry the tax, IGST is zero.
    assert_eq!(invoice["cgst_amount"], "224.91");
    assert_eq!(invoice["sgst_amount"], "224.91");
    assert_eq!(invoice["igst_amount"], "0.00");

    app.cleanup().await;
}

#[tokio::test]
async fn generate_invoice_is_idempotent_per_period() {
    let Some(app) = TestApp::try_spawn().await else {
        return;
    };

    let subscription = create_active_subscription(&app, "100.00").await;
    let body = json!({ "subscription_id": subscription["subscription_id"] });

    let first = app.post("/invoices/generate", &body).await;
    assert_eq!(first.status(), 201);
    let first: serde_json::Value = first.json().await.unwrap();

    let second = app.post("/invoices/generate", &body).await;
    assert_eq!(second.status(), 201);
    let second: serde_json::Value = second.json().await.unwrap();

    assert_eq!(first["invoice_id"], second["invoice_id"]);
    assert_eq!(first["invoice_number"], second["invoice_number"]);

    let list = app.get("/invoices").await;
    let invoices: serde_json::Value = list.json().await.unwrap();
    assert_eq!(invoices.as_array().unwrap().len(), 1);

    app.cleanup().await;
}

#[tokio::test]
async fn partial_then_full_payment_moves_status_forward() {
    let Some(app) = TestApp::try_spawn().await else {
        return;
    };

    let subscription = create_active_subscription(&app, "100.00").await;
    let response = app
        .post(
            "/invoices/generate",
            &json!({ "subscription_id": subscription["subscription_id"] }),
        )
        .await;
    let invoice: serde_json::Value = response.json().await.unwrap();
    let invoice_id = invoice["invoice_id"].as_str().unwrap();

    // total = 100 + 18 tax
    let partial = app
        .put(
            &format!("/invoices/{}/mark-paid", invoice_id),
            &json!({ "paid_amount": "50.00", "payment_date": "2026-08-01" }),
        )
        .await;
    assert_eq!(partial.status(), 200);
    let partial: serde_json::Value = partial.json().await.unwrap();
    assert_eq!(partial["status"], "partially_paid");
    assert_eq!(partial["balance_due"], "68.00");

    let second_partial = app
        .put(
            &format!("/invoices/{}/mark-paid", invoice_id),
            &json!({ "paid_amount": "30.00", "payment_date": "2026-08-02" }),
        )
        .await;
    assert_eq!(second_partial.status(), 200);
    let second_partial: serde_json::Value = second_partial.json().await.unwrap();
    assert_eq!(second_partial["status"], "partially_paid");
    assert_eq!(second_partial["balance_due"], "38.00");

    let full = app
        .put(
            &format!("/invoices/{}/mark-paid", invoice_id),
            &json!({ "paid_amount": "38.00", "payment_date": "2026-08-03" }),
        )
        .await;
    assert_eq!(full.status(), 200);
    let full: serde_json::Value = full.json().await.unwrap();
    assert_eq!(full["status"], "paid");
    assert_eq!(full["balance_due"], "0.00");
    assert_eq!(full["paid_amount"], "118.00");

    app.cleanup().await;
}

#[tokio::test]
async fn overpayment_is_rejected_not_clamped() {
    let Some(app) = TestApp::try_spawn().await else {
        return;
    };

    let subscription = create_active_subscription(&app, "100.00").await;
    let response = app
        .post(
            "/invoices/generate",
            &json!({ "subscription_id": subscription["subscription_id"] }),
        )
        .await;
    let invoice: serde_json::Value = response.json().await.unwrap();
    let invoice_id = invoice["invoice_id"].as_str().unwrap();

    let overpay = app
        .put(
            &format!("/invoices/{}/mark-paid", invoice_id),
            &json!({ "paid_amount": "1000.00", "payment_date": "2026-08-01" }),
        )
        .await;
    assert_eq!(overpay.status(), 500);

    // The invoice is untouched.
    let refreshed = app.get(&format!("/invoices/{}", invoice_id)).await;
    let refreshed: serde_json::Value = refreshed.json().await.unwrap();
    assert_eq!(refreshed["status"], "issued");
    assert_eq!(refreshed["paid_amount"], "0.00");

    app.cleanup().await;
}
