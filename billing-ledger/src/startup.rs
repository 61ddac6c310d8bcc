//! Application startup and lifecycle management.

use crate::config::LedgerConfig;
use crate::handlers::{commissions, coupons, invoices, payments, plans, subscriptions, usage};
use crate::services::{
    get_metrics, init_metrics, AuditSink, Database, EventSink, TracingSink, WebhookVerifier,
};
use axum::{
    extract::State,
    http::StatusCode,
    middleware,
    response::IntoResponse,
    routing::{get, post, put},
    Json, Router,
};
use serde_json::json;
use service_core::error::AppError;
use service_core::middleware::metrics::metrics_middleware;
use service_core::middleware::tracing::request_id_middleware;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tower_http::trace::TraceLayer;

/// Shared application state.
#[derive(Clone)]
pub struct AppState {
    pub config: LedgerConfig,
    pub db: Arc<Database>,
    pub events: Arc<dyn EventSink>,
    pub audit: Arc<dyn AuditSink>,
    pub webhook_verifier: WebhookVerifier,
}

/// Health check endpoint for Docker/K8s liveness probes.
async fn health_check(State(state): State<AppState>) -> impl IntoResponse {
    match state.db.health_check().await {
        Ok(_) => (
            StatusCode::OK,
            Json(json!({
                "status": "ok",
                "service": "billing-ledger",
                "version": env!("CARGO_PKG_VERSION")
            })),
        ),
        Err(e) => {
            tracing::warn!(error = %e, "Health check failed - database unavailable");
            (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(json!({
                    "status": "unhealthy",
                    "service": "billing-ledger",
                    "error": e.to_string()
                })),
            )
        }
    }
}

/// Readiness check endpoint for K8s readiness probes.
async fn readiness_check(State(state): State<AppState>) -> impl IntoResponse {
    match state.db.health_check().await {
        Ok(_) => StatusCode::OK,
        Err(e) => {
            tracing::warn!(error = %e, "Readiness check failed");
            StatusCode::SERVICE_UNAVAILABLE
        }
    }
}

/// Metrics endpoint for Prometheus scraping.
async fn metrics_handler() -> impl IntoResponse {
    let metrics = get_metrics();
    (
        StatusCode::OK,
        [("content-type", "text/plain; charset=utf-8")],
        metrics,
    )
}

/// Build the API router for the ledger core.
fn api_router(state: AppState) -> Router {
    Router::new()
        // Plan catalog
        .route("/plans", post(plans::create_plan).get(plans::list_plans))
        .route("/plans/:id", get(plans::get_plan).put(plans::update_plan))
        .route("/plans/:id/deactivate", post(plans::deactivate_plan))
        // Coupons
        .route("/coupons", post(coupons::create_coupon))
        .route("/coupons/validate/:code", get(coupons::validate_coupon))
        .route("/coupons/:code", get(coupons::get_coupon))
        // Subscriptions
        .route(
            "/subscriptions",
            post(subscriptions::create_subscription).get(subscriptions::list_subscriptions),
        )
        .route("/subscriptions/:id", get(subscriptions::get_subscription))
        .route(
            "/subscriptions/:id/cancel",
            post(subscriptions::cancel_subscription),
        )
        .route("/subscriptions/:id/events", post(subscriptions::apply_event))
        // Invoices
        .route("/invoices/generate", post(invoices::generate_invoice))
        .route("/invoices", get(invoices::list_invoices))
        .route("/invoices/:id", get(invoices::get_invoice))
        .route("/invoices/:id/mark-paid", put(invoices::mark_paid))
        // Payments
        .route(
            "/payments",
            post(payments::record_payment).get(payments::list_payments),
        )
        // Usage metering
        .route("/usage", post(usage::record_usage).get(usage::list_usage))
        .route("/usage/batch", post(usage::record_usage_batch))
        .route("/usage/aggregate", get(usage::aggregate_usage))
        .route("/usage/generate-invoice", post(usage::generate_usage_invoice))
        // Partners & commissions
        .route("/partners", post(commissions::create_partner))
        .route("/partners/commissions", post(commissions::compute_commission))
        .route(
            "/partners/commissions/:id",
            put(commissions::update_commission),
        )
        .route("/partners/:id", get(commissions::get_partner))
        .route(
            "/partners/:id/commissions",
            get(commissions::list_commissions),
        )
        // Operational endpoints
        .route("/health", get(health_check))
        .route("/ready", get(readiness_check))
        .route("/metrics", get(metrics_handler))
        .layer(TraceLayer::new_for_http())
        .layer(middleware::from_fn(metrics_middleware))
        .layer(middleware::from_fn(request_id_middleware))
        .with_state(state)
}

/// Application container for managing server lifecycle.
pub struct Application {
    port: u16,
    listener: TcpListener,
    state: AppState,
}

impl Application {
    /// Build the application with the given configuration.
    pub async fn build(config: LedgerConfig) -> Result<Self, AppError> {
        Self::build_internal(config, true).await
    }

    /// Build the application without running migrations.
    /// Use this in tests when migrations are already applied by the test harness.
    pub async fn build_without_migrations(config: LedgerConfig) -> Result<Self, AppError> {
        Self::build_internal(config, false).await
    }

    async fn build_internal(config: LedgerConfig, run_migrations: bool) -> Result<Self, AppError> {
        init_metrics();

        let db = Database::new(
            &config.database.url,
            config.database.max_connections,
            config.database.min_connections,
        )
        .await
        .map_err(|e| {
            tracing::error!(error = %e, "Failed to connect to PostgreSQL");
            e
        })?;

        if run_migrations {
            db.run_migrations().await.map_err(|e| {
                tracing::error!(error = %e, "Failed to run migrations");
                e
            })?;
        }

        let webhook_verifier = WebhookVerifier::new(
            config.gateway.webhook_secret.clone(),
            config.gateway.signature_required,
        );

        let sink = Arc::new(TracingSink);
        let state = AppState {
            config: config.clone(),
            db: Arc::new(db),
            events: sink.clone(),
            audit: sink,
            webhook_verifier,
        };

        let addr = SocketAddr::from(([0, 0, 0, 0], config.common.port));
        let listener = TcpListener::bind(addr).await.map_err(|e| {
            tracing::error!(error = %e, addr = %addr, "Failed to bind HTTP listener");
            AppError::from(e)
        })?;
        let port = listener.local_addr()?.port();

        tracing::info!(port = port, "Ledger service listener bound");

        Ok(Self {
            port,
            listener,
            state,
        })
    }

    /// Get the port the server is listening on.
    pub fn port(&self) -> u16 {
        self.port
    }

    /// Get a reference to the database.
    pub fn db(&self) -> &Database {
        &self.state.db
    }

    /// Run the application until stopped.
    pub async fn run_until_stopped(self) -> std::io::Result<()> {
        let router = api_router(self.state);

        tracing::info!(
            service = "billing-ledger",
            version = env!("CARGO_PKG_VERSION"),
            port = self.port,
            "Service ready to accept connections"
        );

        axum::serve(self.listener, router).await
    }
}
