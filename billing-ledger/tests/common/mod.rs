//! Test helper module for billing-ledger integration tests.
//!
//! Provides common setup utilities for PostgreSQL-based tests. Tests are
//! skipped when TEST_DATABASE_URL is not set, so the suite runs without a
//! provisioned database.

#![allow(dead_code)]

use billing_ledger::config::{
    BillingRules, DatabaseConfig, GatewayConfig, LedgerConfig, TaxConfig,
};
use billing_ledger::services::init_metrics;
use billing_ledger::startup::Application;
use rust_decimal::Decimal;
use secrecy::Secret;
use serde_json::{json, Value};
use service_core::config::Config as CoreConfig;
use std::sync::atomic::{AtomicU32, Ordering};
use uuid::Uuid;

// Counter for unique schema names
static SCHEMA_COUNTER: AtomicU32 = AtomicU32::new(0);

/// Get the database URL for testing from the environment, if configured.
pub fn get_test_database_url() -> Option<String> {
    std::env::var("TEST_DATABASE_URL").ok()
}

/// Generate a unique schema name for test isolation.
fn unique_schema_name() -> String {
    let counter = SCHEMA_COUNTER.fetch_add(1, Ordering::SeqCst);
    format!("test_ledger_{}_{}", std::process::id(), counter)
}

/// Test application wrapper for integration tests.
pub struct TestApp {
    pub address: String,
    pub port: u16,
    pub client: reqwest::Client,
    pub tenant_id: Uuid,
    schema_name: String,
    base_url: String,
}

impl TestApp {
    /// Spawn a new test application on a random port, or None when no test
    /// database is configured.
    pub async fn try_spawn() -> Option<Self> {
        let base_url = match get_test_database_url() {
            Some(url) => url,
            None => {
                eprintln!("TEST_DATABASE_URL not set; skipping integration test");
                return None;
            }
        };

        init_metrics();

        let schema_name = unique_schema_name();

        // Create schema for test isolation
        let pool = sqlx::postgres::PgPoolOptions::new()
            .max_connections(2)
            .connect(&base_url)
            .await
            .expect("Failed to connect to test database");

        sqlx::query(&format!("DROP SCHEMA IF EXISTS {} CASCADE", schema_name))
            .execute(&pool)
            .await
            .ok();
        sqlx::query(&format!("CREATE SCHEMA {}", schema_name))
            .execute(&pool)
            .await
            .expect("Failed to create test schema");

        pool.close().await;

        let separator = if base_url.contains('?') { "&" } else { "?" };
        let db_url_with_schema = format!(
            "{}{}options=-c search_path%3D{}",
            base_url, separator, schema_name
        );

        let config = LedgerConfig {
            common: CoreConfig { port: 0 },
            service_name: "billing-ledger-test".to_string(),
            service_version: "0.1.0".to_string(),
            log_level: "warn".to_string(),
            otlp_endpoint: None,
            database: DatabaseConfig {
                url: db_url_with_schema,
                max_connections: 5,
                min_connections: 1,
            },
            tax: TaxConfig {
                rate: Decimal::from(18),
                platform_state_code: "29".to_string(),
            },
            gateway: GatewayConfig {
                webhook_secret: Secret::new("test-secret".to_string()),
                signature_required: false,
            },
            billing: BillingRules { grace_period_days: 7 },
        };

        let app = Application::build(config)
            .await
            .expect("Failed to build test application");

        let port = app.port();
        let address = format!("http://127.0.0.1:{}", port);

        tokio::spawn(async move {
            app.run_until_stopped().await.ok();
        });

        // Wait for the server to be ready by polling the health endpoint
        let client = reqwest::Client::new();
        let health_url = format!("{}/health", address);
        for _ in 0..50 {
            if client.get(&health_url).send().await.is_ok() {
                break;
            }
            tokio::time::sleep(tokio::time::Duration::from_millis(50)).await;
        }

        Some(TestApp {
            address,
            port,
            client,
            tenant_id: Uuid::new_v4(),
            schema_name,
            base_url,
        })
    }

    /// POST a JSON body with the tenant header.
    pub async fn post(&self, path: &str, body: &Value) -> reqwest::Response {
        self.client
            .post(format!("{}{}", self.address, path))
            .header("X-Tenant-ID", self.tenant_id.to_string())
            .json(body)
            .send()
            .await
            .expect("Request failed")
    }

    /// POST a JSON body under a different tenant.
    pub async fn post_as(&self, tenant_id: Uuid, path: &str, body: &Value) -> reqwest::Response {
        self.client
            .post(format!("{}{}", self.address, path))
            .header("X-Tenant-ID", tenant_id.to_string())
            .json(body)
            .send()
            .await
            .expect("Request failed")
    }

    /// PUT a JSON body with the tenant header.
    pub async fn put(&self, path: &str, body: &Value) -> reqwest::Response {
        self.client
            .put(format!("{}{}", self.address, path))
            .header("X-Tenant-ID", self.tenant_id.to_string())
            .json(body)
            .send()
            .await
            .expect("Request failed")
    }

    /// GET with the tenant header.
    pub async fn get(&self, path: &str) -> reqwest::Response {
        self.client
            .get(format!("{}{}", self.address, path))
            .header("X-Tenant-ID", self.tenant_id.to_string())
            .send()
            .await
            .expect("Request failed")
    }

    /// Create a plan and return its JSON representation.
    pub async fn create_plan(&self, price: &str, billing_cycle: &str, trial_days: i32) -> Value {
        let response = self
            .post(
                "/plans",
                &json!({
                    "name": format!("Plan {}", Uuid::new_v4()),
                    "billing_cycle": billing_cycle,
                    "price": price,
                    "currency": "INR",
                    "trial_days": trial_days,
                }),
            )
            .await;
        assert_eq!(response.status(), 201, "plan creation failed");
        response.json().await.expect("Invalid plan JSON")
    }

    /// Create a subscription for a tenant and return its JSON representation.
    pub async fn create_subscription(
        &self,
        tenant_id: Uuid,
        plan_id: &str,
        coupon_code: Option<&str>,
    ) -> reqwest::Response {
        self.post_as(
            tenant_id,
            "/subscriptions",
            &json!({
                "plan_id": plan_id,
                "coupon_code": coupon_code,
                "tenant_state_code": "29",
            }),
        )
        .await
    }

    /// Cleanup test resources (schema).
    pub async fn cleanup(&self) {
        let pool = sqlx::postgres::PgPoolOptions::new()
            .max_connections(1)
            .connect(&self.base_url)
            .await
            .ok();

        if let Some(pool) = pool {
            let _ = sqlx::query(&format!(
                "DROP SCHEMA IF EXISTS {} CASCADE",
                self.schema_name
            ))
            .execute(&pool)
            .await;
            pool.close().await;
        }
    }
}
