//! Coupon validation and redemption integration tests.

mod common;

use common::TestApp;
use serde_json::json;
use uuid::Uuid;

async fn create_coupon(app: &TestApp, max_uses: i32, max_uses_per_tenant: i32) -> serde_json::Value {
    let response = app
        .post(
            "/coupons",
            &json!({
                "code": format!("SAVE10-{}", Uuid::new_v4()),
                "discount_type": "fixed",
                "discount_value": "10.00",
                "valid_from": "2020-01-01T00:00:00Z",
                "valid_until": "2099-01-01T00:00:00Z",
                "max_uses": max_uses,
                "max_uses_per_tenant": max_uses_per_tenant,
            }),
        )
        .await;
    assert_eq!(response.status(), 201);
    response.json().await.unwrap()
}

#[tokio::test]
async fn validate_endpoint_reports_discount() {
    let Some(app) = TestApp::try_spawn().await else {
        return;
    };

    let plan = app.create_plan("100.00", "monthly", 0).await;
    let coupon = create_coupon(&app, 10, 1).await;

    let response = app
        .get(&format!(
            "/coupons/validate/{}?plan_id={}",
            coupon["code"].as_str().unwrap(),
            plan["plan_id"].as_str().unwrap()
        ))
        .await;
    assert_eq!(response.status(), 200);

    let validation: serde_json::Value = response.json().await.unwrap();
    assert_eq!(validation["valid"], true);
    assert_eq!(validation["discount_amount"], "10.00");

    app.cleanup().await;
}

#[tokio::test]
async fn validate_reports_failure_in_body() {
    let Some(app) = TestApp::try_spawn().await else {
        return;
    };

    let plan = app.create_plan("100.00", "monthly", 0).await;

    let response = app
        .get(&format!(
            "/coupons/validate/NO-SUCH-CODE?plan_id={}",
            plan["plan_id"].as_str().unwrap()
        ))
        .await;
    assert_eq!(response.status(), 200);

    let validation: serde_json::Value = response.json().await.unwrap();
    assert_eq!(validation["valid"], false);
    assert!(validation["error"].is_string());

    app.cleanup().await;
}

#[tokio::test]
async fn exhausted_coupon_is_rejected() {
    let Some(app) = TestApp::try_spawn().await else {
        return;
    };

    let plan = app.create_plan("100.00", "monthly", 0).await;
    let plan_id = plan["plan_id"].as_str().unwrap();
    let coupon = create_coupon(&app, 1, 1).await;
    let code = coupon["code"].as_str().unwrap();

    // First tenant consumes the only use.
    let first = app
        .create_subscription(Uuid::new_v4(), plan_id, Some(code))
        .await;
    assert_eq!(first.status(), 201);

    // Second tenant finds it exhausted.
    let second = app
        .create_subscription(Uuid::new_v4(), plan_id, Some(code))
        .await;
    assert_eq!(second.status(), 409);

    app.cleanup().await;
}

#[tokio::test]
async fn per_tenant_cap_is_enforced() {
    let Some(app) = TestApp::try_spawn().await else {
        return;
    };

    let plan = app.create_plan("100.00", "monthly", 0).await;
    let plan_id = plan["plan_id"].as_str().unwrap();
    let coupon = create_coupon(&app, 10, 1).await;
    let code = coupon["code"].as_str().unwrap();
    let tenant = Uuid::new_v4();

    let first = app.create_subscription(tenant, plan_id, Some(code)).await;
    assert_eq!(first.status(), 201);
    let subscription: serde_json::Value = first.json().await.unwrap();

    // Cancel so the live-subscription rule does not interfere.
    let cancel = app
        .post_as(
            tenant,
            &format!(
                "/subscriptions/{}/cancel",
                subscription["subscription_id"].as_str().unwrap()
            ),
            &json!({ "reason": "test" }),
        )
        .await;
    assert_eq!(cancel.status(), 200);

    let second = app.create_subscription(tenant, plan_id, Some(code)).await;
    assert_eq!(second.status(), 409);

    app.cleanup().await;
}

#[tokio::test]
async fn redemption_is_recorded_with_the_subscription() {
    let Some(app) = TestApp::try_spawn().await else {
        return;
    };

    let plan = app.create_plan("100.00", "monthly", 0).await;
    let coupon = create_coupon(&app, 10, 1).await;
    let code = coupon["code"].as_str().unwrap();

    let response = app
        .create_subscription(app.tenant_id, plan["plan_id"].as_str().unwrap(), Some(code))
        .await;
    assert_eq!(response.status(), 201);

    let refreshed = app.get(&format!("/coupons/{}", code)).await;
    let refreshed: serde_json::Value = refreshed.json().await.unwrap();
    assert_eq!(refreshed["times_used"], 1);

    app.cleanup().await;
}
