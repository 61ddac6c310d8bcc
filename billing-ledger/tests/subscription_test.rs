//! Subscription lifecycle integration tests.

mod common;

use common::TestApp;
use serde_json::json;
use uuid::Uuid;

fn dec(v: &serde_json::Value) -> rust_decimal::Decimal {
    v.as_str()
        .map(|s| s.parse().unwrap())
        .unwrap_or_else(|| v.to_string().parse().unwrap())
}

#[tokio::test]
async fn create_subscription_computes_pricing() {
    let Some(app) = TestApp::try_spawn().await else {
        return;
    };

    let plan = app.create_plan("2499.00", "monthly", 0).await;
    let response = app
        .create_subscription(app.tenant_id, plan["plan_id"].as_str().unwrap(), None)
        .await;
    assert_eq!(response.status(), 201);

    let subscription: serde_json::Value = response.json().await.unwrap();
    assert_eq!(subscription["status"], "active");

    // total = base - discount + tax
    let base = dec(&subscription["base_price"]);
    let discount = dec(&subscription["discount_amount"]);
    let tax = dec(&subscription["tax_amount"]);
    let total = dec(&subscription["total_amount"]);
    assert_eq!(total, base - discount + tax);

    // 18% intra-state tax on 2499.00
    assert_eq!(tax.to_string(), "449.82");
    assert_eq!(total.to_string(), "2948.82");

    app.cleanup().await;
}

#[tokio::test]
async fn coupon_discount_matches_worked_example() {
    let Some(app) = TestApp::try_spawn().await else {
        return;
    };

    let plan = app.create_plan("2499.00", "monthly", 0).await;
    let create = app
        .post(
            "/coupons",
            &json!({
                "code": format!("WELCOME20-{}", Uuid::new_v4()),
                "discount_type": "percentage",
                "discount_value": "20",
                "valid_from": "2020-01-01T00:00:00Z",
                "valid_until": "2099-01-01T00:00:00Z",
                "max_uses": 100,
            }),
        )
        .await;
    assert_eq!(create.status(), 201);
    let coupon: serde_json::Value = create.json().await.unwrap();

    let response = app
        .create_subscription(
            app.tenant_id,
            plan["plan_id"].as_str().unwrap(),
            Some(coupon["code"].as_str().unwrap()),
        )
        .await;
    assert_eq!(response.status(), 201);

    let subscription: serde_json::Value = response.json().await.unwrap();
    assert_eq!(dec(&subscription["discount_amount"]).to_string(), "499.80");
    assert_eq!(dec(&subscription["tax_amount"]).to_string(), "359.86");
    assert_eq!(dec(&subscription["total_amount"]).to_string(), "2359.06");

    app.cleanup().await;
}

#[tokio::test]
async fn second_live_subscription_is_rejected() {
    let Some(app) = TestApp::try_spawn().await else {
        return;
    };

    let plan = app.create_plan("100.00", "monthly", 0).await;
    let plan_id = plan["plan_id"].as_str().unwrap();

    let first = app.create_subscription(app.tenant_id, plan_id, None).await;
    assert_eq!(first.status(), 201);

    let second = app.create_subscription(app.tenant_id, plan_id, None).await;
    assert_eq!(second.status(), 409);

    app.cleanup().await;
}

#[tokio::test]
async fn cancelled_subscription_allows_a_new_one() {
    let Some(app) = TestApp::try_spawn().await else {
        return;
    };

    let plan = app.create_plan("100.00", "monthly", 0).await;
    let plan_id = plan["plan_id"].as_str().unwrap();

    let first = app.create_subscription(app.tenant_id, plan_id, None).await;
    let subscription: serde_json::Value = first.json().await.unwrap();
    let subscription_id = subscription["subscription_id"].as_str().unwrap();

    let cancel = app
        .post(
            &format!("/subscriptions/{}/cancel", subscription_id),
            &json!({ "reason": "switching plans" }),
        )
        .await;
    assert_eq!(cancel.status(), 200);

    let cancelled: serde_json::Value = cancel.json().await.unwrap();
    assert_eq!(cancelled["status"], "cancelled");
    assert_eq!(cancelled["cancellation_reason"], "switching plans");

    let replacement = app.create_subscription(app.tenant_id, plan_id, None).await;
    assert_eq!(replacement.status(), 201);

    app.cleanup().await;
}

#[tokio::test]
async fn trial_plan_starts_in_trial() {
    let Some(app) = TestApp::try_spawn().await else {
        return;
    };

    let plan = app.create_plan("500.00", "monthly", 14).await;
    let response = app
        .create_subscription(app.tenant_id, plan["plan_id"].as_str().unwrap(), None)
        .await;
    assert_eq!(response.status(), 201);

    let subscription: serde_json::Value = response.json().await.unwrap();
    assert_eq!(subscription["status"], "trial");

    app.cleanup().await;
}

#[tokio::test]
async fn illegal_transition_is_a_conflict() {
    let Some(app) = TestApp::try_spawn().await else {
        return;
    };

    let plan = app.create_plan("100.00", "monthly", 0).await;
    let response = app
        .create_subscription(app.tenant_id, plan["plan_id"].as_str().unwrap(), None)
        .await;
    let subscription: serde_json::Value = response.json().await.unwrap();
    let subscription_id = subscription["subscription_id"].as_str().unwrap();

    // An active subscription cannot resume.
    let response = app
        .post(
            &format!("/subscriptions/{}/events", subscription_id),
            &json!({ "event": "resume" }),
        )
        .await;
    assert_eq!(response.status(), 409);

    // Cancelled is terminal.
    app.post(
        &format!("/subscriptions/{}/cancel", subscription_id),
        &json!({ "reason": "done" }),
    )
    .await;
    let response = app
        .post(
            &format!("/subscriptions/{}/events", subscription_id),
            &json!({ "event": "payment_recorded" }),
        )
        .await;
    assert_eq!(response.status(), 409);

    app.cleanup().await;
}

#[tokio::test]
async fn inactive_plan_is_rejected() {
    let Some(app) = TestApp::try_spawn().await else {
        return;
    };

    let plan = app.create_plan("100.00", "monthly", 0).await;
    let plan_id = plan["plan_id"].as_str().unwrap();

    let deactivate = app.post(&format!("/plans/{}/deactivate", plan_id), &json!({})).await;
    assert_eq!(deactivate.status(), 200);

    let response = app.create_subscription(app.tenant_id, plan_id, None).await;
    assert_eq!(response.status(), 400);

    app.cleanup().await;
}
