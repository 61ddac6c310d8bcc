//! Database service for billing-ledger.
//!
//! Each public mutating operation maps to exactly one transaction;
//! at-most-once guarantees come from the store's uniqueness constraints
//! rather than in-process locks.

use crate::config::TaxConfig;
use crate::models::{
    transition, BillingCycle, Commission, CommissionStatus, CommissionType, Coupon,
    CouponRedemption, CreateCoupon, CreatePartner, CreatePlan, Invoice, InvoiceStatus,
    InvoiceWithLines, LineItem, ListInvoicesFilter, ListPaymentsFilter, ListPlansFilter,
    ListSubscriptionsFilter, ListUsageFilter, Partner, Payment, Plan, RecordPaymentRequest,
    RecordUsage, Subscription, SubscriptionEvent, SubscriptionStatus, UpdatePlan, UsageRecord,
    UsageSummary,
};
use crate::services::metrics::DB_QUERY_DURATION;
use crate::services::tax::compute_tax;
use crate::services::{commission, coupon};
use chrono::{Months, NaiveDate, Utc};
use rust_decimal::Decimal;
use service_core::error::AppError;
use sqlx::postgres::{PgPool, PgPoolOptions, Postgres};
use sqlx::Transaction;
use std::collections::BTreeMap;
use std::time::Duration;
use tracing::{info, instrument, warn};
use uuid::Uuid;

const SUBSCRIPTION_COLUMNS: &str = "subscription_id, tenant_id, plan_id, status, start_date, end_date, next_billing_date, base_price, discount_amount, tax_amount, total_amount, currency, auto_renew, coupon_code, tenant_state_code, cancellation_reason, cancelled_utc, created_utc, updated_utc";

const INVOICE_COLUMNS: &str = "invoice_id, tenant_id, subscription_id, invoice_number, invoice_period_key, status, subtotal, discount_amount, cgst_amount, sgst_amount, igst_amount, tax_amount, total_amount, paid_amount, balance_due, currency, issue_date, due_date, created_utc, updated_utc";

const PAYMENT_COLUMNS: &str = "payment_id, tenant_id, invoice_id, subscription_id, gateway_name, gateway_transaction_id, amount, currency, status, unmatched, recorded_utc";

const COUPON_COLUMNS: &str = "coupon_id, code, discount_type, discount_value, max_discount_amount, valid_from, valid_until, max_uses, max_uses_per_tenant, times_used, applicable_plan_ids, min_subscription_value, is_active, created_utc";

const USAGE_COLUMNS: &str = "record_id, tenant_id, subscription_id, metric_name, quantity, unit_price, period_start, period_end, idempotency_key, is_billed, billed_in_invoice_id, created_utc";

const COMMISSION_COLUMNS: &str = "commission_id, partner_id, tenant_id, payment_id, base_amount, commission_rate, commission_amount, status, created_utc, updated_utc";

/// Outcome of recording a gateway payment confirmation.
#[derive(Debug, Clone)]
pub struct RecordedPayment {
    pub payment: Payment,
    /// False when this was a re-delivery of an already recorded confirmation.
    pub newly_recorded: bool,
}

/// Database connection pool wrapper.
#[derive(Clone)]
pub struct Database {
    pool: PgPool,
}

impl Database {
    /// Create a new database connection pool.
    #[instrument(skip(database_url), fields(service = "billing-ledger"))]
    pub async fn new(
        database_url: &str,
        max_connections: u32,
        min_connections: u32,
    ) -> Result<Self, AppError> {
        info!(
            max_connections = max_connections,
            min_connections = min_connections,
            "Connecting to PostgreSQL"
        );

        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .min_connections(min_connections)
            .acquire_timeout(Duration::from_secs(30))
            .idle_timeout(Duration::from_secs(600))
            .connect(database_url)
            .await
            .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Failed to connect: {}", e)))?;

        info!("PostgreSQL connection pool established");

        Ok(Self { pool })
    }

    /// Get a reference to the connection pool.
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Check database health.
    #[instrument(skip(self))]
    pub async fn health_check(&self) -> Result<(), AppError> {
        sqlx::query("SELECT 1")
            .execute(&self.pool)
            .await
            .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Health check failed: {}", e)))?;
        Ok(())
    }

    /// Run database migrations.
    #[instrument(skip(self))]
    pub async fn run_migrations(&self) -> Result<(), AppError> {
        info!("Running database migrations");
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Migration failed: {}", e)))?;
        info!("Database migrations completed");
        Ok(())
    }

    // =========================================================================
    // Plan Operations
    // =========================================================================

    /// Create a new plan.
    #[instrument(skip(self, input))]
    pub async fn create_plan(&self, input: &CreatePlan) -> Result<Plan, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["create_plan"])
            .start_timer();

        if input.price < Decimal::ZERO {
            return Err(AppError::BadRequest(anyhow::anyhow!(
                "Plan price must not be negative"
            )));
        }
        if input.trial_days < 0 {
            return Err(AppError::BadRequest(anyhow::anyhow!(
                "Trial days must not be negative"
            )));
        }

        let plan_id = Uuid::new_v4();
        let plan = sqlx::query_as::<_, Plan>(
            r#"
            INSERT INTO plans (plan_id, name, description, billing_cycle, price, currency, limits, trial_days)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            RETURNING plan_id, name, description, billing_cycle, price, currency, limits, trial_days, is_active, created_utc, updated_utc
            "#,
        )
        .bind(plan_id)
        .bind(&input.name)
        .bind(&input.description)
        .bind(input.billing_cycle.as_str())
        .bind(input.price)
        .bind(&input.currency)
        .bind(&input.limits)
        .bind(input.trial_days)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Failed to create plan: {}", e)))?;

        timer.observe_duration();
        info!(plan_id = %plan.plan_id, name = %plan.name, "Plan created");

        Ok(plan)
    }

    /// Get a plan by ID.
    #[instrument(skip(self), fields(plan_id = %plan_id))]
    pub async fn get_plan(&self, plan_id: Uuid) -> Result<Option<Plan>, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["get_plan"])
            .start_timer();

        let plan = sqlx::query_as::<_, Plan>(
            r#"
            SELECT plan_id, name, description, billing_cycle, price, currency, limits, trial_days, is_active, created_utc, updated_utc
            FROM plans
            WHERE plan_id = $1
            "#,
        )
        .bind(plan_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Failed to get plan: {}", e)))?;

        timer.observe_duration();

        Ok(plan)
    }

    /// List plans.
    #[instrument(skip(self, filter))]
    pub async fn list_plans(&self, filter: &ListPlansFilter) -> Result<Vec<Plan>, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["list_plans"])
            .start_timer();

        let limit = filter.page_size.clamp(1, 100) as i64;

        let plans = sqlx::query_as::<_, Plan>(
            r#"
            SELECT plan_id, name, description, billing_cycle, price, currency, limits, trial_days, is_active, created_utc, updated_utc
            FROM plans
            WHERE ($1::bool = TRUE OR is_active = TRUE)
              AND ($2::uuid IS NULL OR plan_id > $2)
            ORDER BY plan_id
            LIMIT $3
            "#,
        )
        .bind(filter.include_inactive)
        .bind(filter.page_token)
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Failed to list plans: {}", e)))?;

        timer.observe_duration();

        Ok(plans)
    }

    /// Update a plan's mutable fields.
    #[instrument(skip(self, input), fields(plan_id = %plan_id))]
    pub async fn update_plan(
        &self,
        plan_id: Uuid,
        input: &UpdatePlan,
    ) -> Result<Option<Plan>, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["update_plan"])
            .start_timer();

        if let Some(price) = input.price {
            if price < Decimal::ZERO {
                return Err(AppError::BadRequest(anyhow::anyhow!(
                    "Plan price must not be negative"
                )));
            }
        }

        let plan = sqlx::query_as::<_, Plan>(
            r#"
            UPDATE plans
            SET name = COALESCE($2, name),
                description = COALESCE($3, description),
                price = COALESCE($4, price),
                limits = COALESCE($5, limits),
                trial_days = COALESCE($6, trial_days),
                updated_utc = NOW()
            WHERE plan_id = $1
            RETURNING plan_id, name, description, billing_cycle, price, currency, limits, trial_days, is_active, created_utc, updated_utc
            "#,
        )
        .bind(plan_id)
        .bind(&input.name)
        .bind(&input.description)
        .bind(input.price)
        .bind(&input.limits)
        .bind(input.trial_days)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Failed to update plan: {}", e)))?;

        timer.observe_duration();

        Ok(plan)
    }

    /// Deactivate a plan. Plans referenced by subscriptions are never
    /// deleted, only deactivated.
    #[instrument(skip(self), fields(plan_id = %plan_id))]
    pub async fn deactivate_plan(&self, plan_id: Uuid) -> Result<Option<Plan>, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["deactivate_plan"])
            .start_timer();

        let plan = sqlx::query_as::<_, Plan>(
            r#"
            UPDATE plans
            SET is_active = FALSE, updated_utc = NOW()
            WHERE plan_id = $1 AND is_active = TRUE
            RETURNING plan_id, name, description, billing_cycle, price, currency, limits, trial_days, is_active, created_utc, updated_utc
            "#,
        )
        .bind(plan_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Failed to deactivate plan: {}", e)))?;

        timer.observe_duration();

        if let Some(ref p) = plan {
            info!(plan_id = %p.plan_id, "Plan deactivated");
        }

        Ok(plan)
    }

    // =========================================================================
    // Coupon Operations
    // =========================================================================

    /// Create a new coupon.
    #[instrument(skip(self, input))]
    pub async fn create_coupon(&self, input: &CreateCoupon) -> Result<Coupon, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["create_coupon"])
            .start_timer();

        if input.discount_value <= Decimal::ZERO {
            return Err(AppError::BadRequest(anyhow::anyhow!(
                "Discount value must be positive"
            )));
        }
        if input.valid_until <= input.valid_from {
            return Err(AppError::BadRequest(anyhow::anyhow!(
                "Coupon validity window is empty"
            )));
        }
        if input.max_uses <= 0 || input.max_uses_per_tenant <= 0 {
            return Err(AppError::BadRequest(anyhow::anyhow!(
                "Coupon use limits must be positive"
            )));
        }

        let coupon_id = Uuid::new_v4();
        let coupon = sqlx::query_as::<_, Coupon>(&format!(
            r#"
            INSERT INTO coupons (coupon_id, code, discount_type, discount_value, max_discount_amount, valid_from, valid_until, max_uses, max_uses_per_tenant, applicable_plan_ids, min_subscription_value)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
            RETURNING {COUPON_COLUMNS}
            "#
        ))
        .bind(coupon_id)
        .bind(&input.code)
        .bind(input.discount_type.as_str())
        .bind(input.discount_value)
        .bind(input.max_discount_amount)
        .bind(input.valid_from)
        .bind(input.valid_until)
        .bind(input.max_uses)
        .bind(input.max_uses_per_tenant)
        .bind(&input.applicable_plan_ids)
        .bind(input.min_subscription_value)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| match e {
            sqlx::Error::Database(ref db_err) if db_err.is_unique_violation() => {
                AppError::Conflict(anyhow::anyhow!("Coupon '{}' already exists", input.code))
            }
            _ => AppError::DatabaseError(anyhow::anyhow!("Failed to create coupon: {}", e)),
        })?;

        timer.observe_duration();
        info!(coupon_id = %coupon.coupon_id, code = %coupon.code, "Coupon created");

        Ok(coupon)
    }

    /// Get a coupon by code.
    #[instrument(skip(self), fields(code = %code))]
    pub async fn get_coupon_by_code(&self, code: &str) -> Result<Option<Coupon>, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["get_coupon_by_code"])
            .start_timer();

        let coupon = sqlx::query_as::<_, Coupon>(&format!(
            "SELECT {COUPON_COLUMNS} FROM coupons WHERE code = $1"
        ))
        .bind(code)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Failed to get coupon: {}", e)))?;

        timer.observe_duration();

        Ok(coupon)
    }

    /// Count redemptions of a coupon by a tenant.
    #[instrument(skip(self), fields(tenant_id = %tenant_id))]
    pub async fn count_tenant_redemptions(
        &self,
        coupon_id: Uuid,
        tenant_id: Uuid,
    ) -> Result<i64, AppError> {
        let count: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM coupon_redemptions WHERE coupon_id = $1 AND tenant_id = $2",
        )
        .bind(coupon_id)
        .bind(tenant_id)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| {
            AppError::DatabaseError(anyhow::anyhow!("Failed to count redemptions: {}", e))
        })?;

        Ok(count)
    }

    /// List redemptions of a coupon.
    #[instrument(skip(self), fields(coupon_id = %coupon_id))]
    pub async fn list_redemptions(
        &self,
        coupon_id: Uuid,
    ) -> Result<Vec<CouponRedemption>, AppError> {
        let redemptions = sqlx::query_as::<_, CouponRedemption>(
            r#"
            SELECT redemption_id, coupon_id, tenant_id, subscription_id, discount_amount, used_utc
            FROM coupon_redemptions
            WHERE coupon_id = $1
            ORDER BY used_utc
            "#,
        )
        .bind(coupon_id)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| {
            AppError::DatabaseError(anyhow::anyhow!("Failed to list redemptions: {}", e))
        })?;

        Ok(redemptions)
    }

    // =========================================================================
    // Subscription Operations
    // =========================================================================

    /// Create a subscription, redeeming the coupon (if any) in the same
    /// transaction. Coupon double-spend under concurrency is prevented by an
    /// atomic conditional increment on `times_used`; the one-live-
    /// subscription-per-tenant rule by a partial unique index.
    #[instrument(skip(self, input, tax), fields(tenant_id = %tenant_id, plan_id = %input.plan_id))]
    pub async fn create_subscription(
        &self,
        tenant_id: Uuid,
        input: &crate::models::CreateSubscriptionRequest,
        tax: &TaxConfig,
    ) -> Result<Subscription, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["create_subscription"])
            .start_timer();

        if input.tenant_state_code.len() != 2
            || !input.tenant_state_code.chars().all(|c| c.is_ascii_digit())
        {
            return Err(AppError::BadRequest(anyhow::anyhow!(
                "tenant_state_code must be a two-digit GST state code"
            )));
        }

        let plan = self
            .get_plan(input.plan_id)
            .await?
            .ok_or_else(|| AppError::NotFound(anyhow::anyhow!("Plan not found")))?;

        if !plan.is_active {
            return Err(AppError::BadRequest(anyhow::anyhow!("Plan is not active")));
        }

        let mut tx = self.pool.begin().await.map_err(|e| {
            AppError::DatabaseError(anyhow::anyhow!("Failed to begin transaction: {}", e))
        })?;

        let base_price = plan.price;
        let now = Utc::now();

        // Validate and redeem the coupon inside the transaction so the
        // increment, redemption row, and subscription commit or abort
        // together.
        let (discount_amount, redeemed_coupon) = match &input.coupon_code {
            Some(code) => {
                let coupon = sqlx::query_as::<_, Coupon>(&format!(
                    "SELECT {COUPON_COLUMNS} FROM coupons WHERE code = $1 FOR UPDATE"
                ))
                .bind(code)
                .fetch_optional(&mut *tx)
                .await
                .map_err(|e| {
                    AppError::DatabaseError(anyhow::anyhow!("Failed to read coupon: {}", e))
                })?
                .ok_or_else(|| AppError::NotFound(anyhow::anyhow!("Coupon not found")))?;

                let tenant_redemptions: i64 = sqlx::query_scalar(
                    "SELECT COUNT(*) FROM coupon_redemptions WHERE coupon_id = $1 AND tenant_id = $2",
                )
                .bind(coupon.coupon_id)
                .bind(tenant_id)
                .fetch_one(&mut *tx)
                .await
                .map_err(|e| {
                    AppError::DatabaseError(anyhow::anyhow!("Failed to count redemptions: {}", e))
                })?;

                coupon::validate(&coupon, input.plan_id, base_price, tenant_redemptions, now)?;
                let discount = coupon::apply(&coupon, base_price);

                let updated = sqlx::query(
                    "UPDATE coupons SET times_used = times_used + 1 WHERE coupon_id = $1 AND times_used < max_uses",
                )
                .bind(coupon.coupon_id)
                .execute(&mut *tx)
                .await
                .map_err(|e| {
                    AppError::DatabaseError(anyhow::anyhow!("Failed to redeem coupon: {}", e))
                })?;

                if updated.rows_affected() == 0 {
                    return Err(AppError::Conflict(anyhow::anyhow!(
                        "Coupon '{}' is exhausted",
                        coupon.code
                    )));
                }

                (discount, Some(coupon))
            }
            None => (Decimal::ZERO, None),
        };

        let taxable = base_price - discount_amount;
        let tax_split = compute_tax(
            taxable,
            &input.tenant_state_code,
            &tax.platform_state_code,
            tax.rate,
        );
        let total_amount = base_price - discount_amount + tax_split.total_tax;

        let cycle = BillingCycle::from_string(&plan.billing_cycle);
        let start_date = now.date_naive();
        let status = if plan.trial_days > 0 {
            SubscriptionStatus::Trial
        } else {
            SubscriptionStatus::Active
        };
        let next_billing_date = match status {
            SubscriptionStatus::Trial => {
                Some(start_date + chrono::Duration::days(plan.trial_days as i64))
            }
            _ => advance_billing_date(start_date, cycle),
        };

        let subscription_id = Uuid::new_v4();
        let subscription = sqlx::query_as::<_, Subscription>(&format!(
            r#"
            INSERT INTO subscriptions (subscription_id, tenant_id, plan_id, status, start_date, next_billing_date, base_price, discount_amount, tax_amount, total_amount, currency, auto_renew, coupon_code, tenant_state_code)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14)
            RETURNING {SUBSCRIPTION_COLUMNS}
            "#
        ))
        .bind(subscription_id)
        .bind(tenant_id)
        .bind(input.plan_id)
        .bind(status.as_str())
        .bind(start_date)
        .bind(next_billing_date)
        .bind(base_price)
        .bind(discount_amount)
        .bind(tax_split.total_tax)
        .bind(total_amount)
        .bind(&plan.currency)
        .bind(input.auto_renew)
        .bind(&input.coupon_code)
        .bind(&input.tenant_state_code)
        .fetch_one(&mut *tx)
        .await
        .map_err(|e| match e {
            sqlx::Error::Database(ref db_err) if db_err.is_unique_violation() => {
                AppError::Conflict(anyhow::anyhow!(
                    "Tenant already has a subscription in a non-terminal status"
                ))
            }
            _ => AppError::DatabaseError(anyhow::anyhow!("Failed to create subscription: {}", e)),
        })?;

        if let Some(coupon) = &redeemed_coupon {
            sqlx::query(
                r#"
                INSERT INTO coupon_redemptions (redemption_id, coupon_id, tenant_id, subscription_id, discount_amount)
                VALUES ($1, $2, $3, $4, $5)
                "#,
            )
            .bind(Uuid::new_v4())
            .bind(coupon.coupon_id)
            .bind(tenant_id)
            .bind(subscription_id)
            .bind(discount_amount)
            .execute(&mut *tx)
            .await
            .map_err(|e| {
                AppError::DatabaseError(anyhow::anyhow!("Failed to record redemption: {}", e))
            })?;
        }

        tx.commit().await.map_err(|e| {
            AppError::DatabaseError(anyhow::anyhow!("Failed to commit transaction: {}", e))
        })?;

        timer.observe_duration();
        info!(
            subscription_id = %subscription.subscription_id,
            status = %subscription.status,
            total_amount = %subscription.total_amount,
            "Subscription created"
        );

        Ok(subscription)
    }

    /// Get a subscription by ID.
    #[instrument(skip(self), fields(tenant_id = %tenant_id, subscription_id = %subscription_id))]
    pub async fn get_subscription(
        &self,
        tenant_id: Uuid,
        subscription_id: Uuid,
    ) -> Result<Option<Subscription>, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["get_subscription"])
            .start_timer();

        let subscription = sqlx::query_as::<_, Subscription>(&format!(
            "SELECT {SUBSCRIPTION_COLUMNS} FROM subscriptions WHERE tenant_id = $1 AND subscription_id = $2"
        ))
        .bind(tenant_id)
        .bind(subscription_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Failed to get subscription: {}", e)))?;

        timer.observe_duration();

        Ok(subscription)
    }

    /// List subscriptions for a tenant.
    #[instrument(skip(self, filter), fields(tenant_id = %tenant_id))]
    pub async fn list_subscriptions(
        &self,
        tenant_id: Uuid,
        filter: &ListSubscriptionsFilter,
    ) -> Result<Vec<Subscription>, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["list_subscriptions"])
            .start_timer();

        let limit = filter.page_size.clamp(1, 100) as i64;
        let status_str = filter.status.map(|s| s.as_str().to_string());

        let subscriptions = sqlx::query_as::<_, Subscription>(&format!(
            r#"
            SELECT {SUBSCRIPTION_COLUMNS}
            FROM subscriptions
            WHERE tenant_id = $1
              AND ($2::varchar IS NULL OR status = $2)
              AND ($3::uuid IS NULL OR plan_id = $3)
              AND ($4::uuid IS NULL OR subscription_id > $4)
            ORDER BY subscription_id
            LIMIT $5
            "#
        ))
        .bind(tenant_id)
        .bind(&status_str)
        .bind(filter.plan_id)
        .bind(filter.page_token)
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| {
            AppError::DatabaseError(anyhow::anyhow!("Failed to list subscriptions: {}", e))
        })?;

        timer.observe_duration();

        Ok(subscriptions)
    }

    /// Apply a state-machine event to a subscription and persist the result.
    #[instrument(skip(self), fields(tenant_id = %tenant_id, subscription_id = %subscription_id))]
    pub async fn apply_subscription_event(
        &self,
        tenant_id: Uuid,
        subscription_id: Uuid,
        event: SubscriptionEvent,
    ) -> Result<Subscription, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["apply_subscription_event"])
            .start_timer();

        let mut tx = self.pool.begin().await.map_err(|e| {
            AppError::DatabaseError(anyhow::anyhow!("Failed to begin transaction: {}", e))
        })?;

        let subscription =
            lock_subscription(&mut tx, tenant_id, subscription_id)
                .await?
                .ok_or_else(|| AppError::NotFound(anyhow::anyhow!("Subscription not found")))?;

        let current = SubscriptionStatus::from_string(&subscription.status);
        let next = transition(current, event)?;

        let updated = sqlx::query_as::<_, Subscription>(&format!(
            r#"
            UPDATE subscriptions
            SET status = $3, updated_utc = NOW()
            WHERE tenant_id = $1 AND subscription_id = $2
            RETURNING {SUBSCRIPTION_COLUMNS}
            "#
        ))
        .bind(tenant_id)
        .bind(subscription_id)
        .bind(next.as_str())
        .fetch_one(&mut *tx)
        .await
        .map_err(|e| {
            AppError::DatabaseError(anyhow::anyhow!("Failed to update subscription: {}", e))
        })?;

        tx.commit().await.map_err(|e| {
            AppError::DatabaseError(anyhow::anyhow!("Failed to commit transaction: {}", e))
        })?;

        timer.observe_duration();
        info!(
            subscription_id = %subscription_id,
            from = current.as_str(),
            to = next.as_str(),
            "Subscription transitioned"
        );

        Ok(updated)
    }

    /// Cancel a subscription. Legal from any non-terminal state.
    #[instrument(skip(self), fields(tenant_id = %tenant_id, subscription_id = %subscription_id))]
    pub async fn cancel_subscription(
        &self,
        tenant_id: Uuid,
        subscription_id: Uuid,
        reason: &str,
    ) -> Result<Subscription, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["cancel_subscription"])
            .start_timer();

        let mut tx = self.pool.begin().await.map_err(|e| {
            AppError::DatabaseError(anyhow::anyhow!("Failed to begin transaction: {}", e))
        })?;

        let subscription =
            lock_subscription(&mut tx, tenant_id, subscription_id)
                .await?
                .ok_or_else(|| AppError::NotFound(anyhow::anyhow!("Subscription not found")))?;

        let current = SubscriptionStatus::from_string(&subscription.status);
        transition(current, SubscriptionEvent::Cancel)?;

        let cancelled = sqlx::query_as::<_, Subscription>(&format!(
            r#"
            UPDATE subscriptions
            SET status = 'cancelled',
                cancellation_reason = $3,
                cancelled_utc = NOW(),
                end_date = CURRENT_DATE,
                updated_utc = NOW()
            WHERE tenant_id = $1 AND subscription_id = $2
            RETURNING {SUBSCRIPTION_COLUMNS}
            "#
        ))
        .bind(tenant_id)
        .bind(subscription_id)
        .bind(reason)
        .fetch_one(&mut *tx)
        .await
        .map_err(|e| {
            AppError::DatabaseError(anyhow::anyhow!("Failed to cancel subscription: {}", e))
        })?;

        tx.commit().await.map_err(|e| {
            AppError::DatabaseError(anyhow::anyhow!("Failed to commit transaction: {}", e))
        })?;

        timer.observe_duration();
        info!(subscription_id = %subscription_id, reason = %reason, "Subscription cancelled");

        Ok(cancelled)
    }

    // =========================================================================
    // Usage Operations
    // =========================================================================

    /// Record usage with idempotency. A record with the same key returns the
    /// existing row instead of inserting a duplicate.
    #[instrument(skip(self, input), fields(tenant_id = %tenant_id, subscription_id = %input.subscription_id))]
    pub async fn record_usage(
        &self,
        tenant_id: Uuid,
        input: &RecordUsage,
    ) -> Result<UsageRecord, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["record_usage"])
            .start_timer();

        if input.quantity < Decimal::ZERO {
            return Err(AppError::BadRequest(anyhow::anyhow!(
                "Usage quantity must not be negative"
            )));
        }
        if input.period_end < input.period_start {
            return Err(AppError::BadRequest(anyhow::anyhow!(
                "Usage period end precedes period start"
            )));
        }

        if let Some(key) = &input.idempotency_key {
            let existing = sqlx::query_as::<_, UsageRecord>(&format!(
                "SELECT {USAGE_COLUMNS} FROM usage_records WHERE tenant_id = $1 AND idempotency_key = $2"
            ))
            .bind(tenant_id)
            .bind(key)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| {
                AppError::DatabaseError(anyhow::anyhow!("Failed to check idempotency: {}", e))
            })?;

            if let Some(record) = existing {
                timer.observe_duration();
                return Ok(record);
            }
        }

        let record_id = Uuid::new_v4();
        let inserted = sqlx::query_as::<_, UsageRecord>(&format!(
            r#"
            INSERT INTO usage_records (record_id, tenant_id, subscription_id, metric_name, quantity, unit_price, period_start, period_end, idempotency_key)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            RETURNING {USAGE_COLUMNS}
            "#
        ))
        .bind(record_id)
        .bind(tenant_id)
        .bind(input.subscription_id)
        .bind(&input.metric_name)
        .bind(input.quantity)
        .bind(input.unit_price)
        .bind(input.period_start)
        .bind(input.period_end)
        .bind(&input.idempotency_key)
        .fetch_one(&self.pool)
        .await;

        let record = match inserted {
            Ok(record) => record,
            Err(sqlx::Error::Database(ref db_err)) if db_err.is_unique_violation() => {
                // Lost the race to a concurrent delivery of the same event;
                // return what it inserted.
                let key = input.idempotency_key.as_deref().unwrap_or_default();
                sqlx::query_as::<_, UsageRecord>(&format!(
                    "SELECT {USAGE_COLUMNS} FROM usage_records WHERE tenant_id = $1 AND idempotency_key = $2"
                ))
                .bind(tenant_id)
                .bind(key)
                .fetch_one(&self.pool)
                .await
                .map_err(|e| {
                    AppError::DatabaseError(anyhow::anyhow!("Failed to re-read usage record: {}", e))
                })?
            }
            Err(e) => {
                return Err(AppError::DatabaseError(anyhow::anyhow!(
                    "Failed to record usage: {}",
                    e
                )))
            }
        };

        timer.observe_duration();

        Ok(record)
    }

    /// Aggregate unbilled usage per metric over a period. This is the exact
    /// input to usage invoice generation.
    #[instrument(skip(self), fields(tenant_id = %tenant_id, subscription_id = %subscription_id))]
    pub async fn aggregate_usage(
        &self,
        tenant_id: Uuid,
        subscription_id: Uuid,
        period_start: NaiveDate,
        period_end: NaiveDate,
    ) -> Result<Vec<UsageSummary>, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["aggregate_usage"])
            .start_timer();

        let summaries = sqlx::query_as::<_, UsageSummary>(
            r#"
            SELECT metric_name, unit_price, SUM(quantity) AS total_quantity, SUM(quantity * unit_price) AS total_amount
            FROM usage_records
            WHERE tenant_id = $1 AND subscription_id = $2
              AND period_start >= $3 AND period_end <= $4
              AND is_billed = FALSE
            GROUP BY metric_name, unit_price
            ORDER BY metric_name, unit_price
            "#,
        )
        .bind(tenant_id)
        .bind(subscription_id)
        .bind(period_start)
        .bind(period_end)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Failed to aggregate usage: {}", e)))?;

        timer.observe_duration();

        Ok(summaries)
    }

    /// List usage records for a tenant.
    #[instrument(skip(self, filter), fields(tenant_id = %tenant_id))]
    pub async fn list_usage_records(
        &self,
        tenant_id: Uuid,
        filter: &ListUsageFilter,
    ) -> Result<Vec<UsageRecord>, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["list_usage_records"])
            .start_timer();

        let limit = filter.page_size.clamp(1, 100) as i64;

        let records = sqlx::query_as::<_, UsageRecord>(&format!(
            r#"
            SELECT {USAGE_COLUMNS}
            FROM usage_records
            WHERE tenant_id = $1
              AND ($2::uuid IS NULL OR subscription_id = $2)
              AND ($3::varchar IS NULL OR metric_name = $3)
              AND ($4::bool IS NULL OR is_billed = $4)
              AND ($5::uuid IS NULL OR record_id > $5)
            ORDER BY record_id
            LIMIT $6
            "#
        ))
        .bind(tenant_id)
        .bind(filter.subscription_id)
        .bind(&filter.metric_name)
        .bind(filter.is_billed)
        .bind(filter.page_token)
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| {
            AppError::DatabaseError(anyhow::anyhow!("Failed to list usage records: {}", e))
        })?;

        timer.observe_duration();

        Ok(records)
    }

    /// Mark usage records billed, all-or-nothing. Fails without applying if
    /// any id is already billed or missing.
    #[instrument(skip(self, usage_ids), fields(tenant_id = %tenant_id, invoice_id = %invoice_id))]
    pub async fn mark_billed(
        &self,
        tenant_id: Uuid,
        usage_ids: &[Uuid],
        invoice_id: Uuid,
    ) -> Result<u64, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["mark_billed"])
            .start_timer();

        let mut tx = self.pool.begin().await.map_err(|e| {
            AppError::DatabaseError(anyhow::anyhow!("Failed to begin transaction: {}", e))
        })?;

        let count = mark_billed_in_tx(&mut tx, tenant_id, usage_ids, invoice_id).await?;

        tx.commit().await.map_err(|e| {
            AppError::DatabaseError(anyhow::anyhow!("Failed to commit transaction: {}", e))
        })?;

        timer.observe_duration();

        Ok(count)
    }

    // =========================================================================
    // Invoice Operations
    // =========================================================================

    /// Generate the invoice for a subscription's current billing period.
    /// Idempotent per (subscription, next_billing_date at call time): a
    /// second call returns the existing invoice.
    #[instrument(skip(self, tax), fields(tenant_id = %tenant_id, subscription_id = %subscription_id))]
    pub async fn generate_subscription_invoice(
        &self,
        tenant_id: Uuid,
        subscription_id: Uuid,
        tax: &TaxConfig,
    ) -> Result<InvoiceWithLines, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["generate_subscription_invoice"])
            .start_timer();

        let subscription = self
            .get_subscription(tenant_id, subscription_id)
            .await?
            .ok_or_else(|| AppError::NotFound(anyhow::anyhow!("Subscription not found")))?;

        let status = SubscriptionStatus::from_string(&subscription.status);
        if status.is_terminal() {
            return Err(AppError::Conflict(anyhow::anyhow!(
                "Cannot invoice a {} subscription",
                status.as_str()
            )));
        }

        let period_key = subscription
            .next_billing_date
            .map(|d| d.to_string())
            .unwrap_or_else(|| format!("one_time-{}", subscription.start_date));

        let tax_split = compute_tax(
            subscription.base_price - subscription.discount_amount,
            &subscription.tenant_state_code,
            &tax.platform_state_code,
            tax.rate,
        );

        let plan = self.get_plan(subscription.plan_id).await?;
        let description = plan
            .map(|p| format!("{} ({})", p.name, p.billing_cycle))
            .unwrap_or_else(|| "Subscription charge".to_string());

        let mut tx = self.pool.begin().await.map_err(|e| {
            AppError::DatabaseError(anyhow::anyhow!("Failed to begin transaction: {}", e))
        })?;

        let invoice_number: String = sqlx::query_scalar("SELECT next_invoice_number($1)")
            .bind(tenant_id)
            .fetch_one(&mut *tx)
            .await
            .map_err(|e| {
                AppError::DatabaseError(anyhow::anyhow!("Failed to allocate invoice number: {}", e))
            })?;

        let invoice_id = Uuid::new_v4();
        let total_amount = subscription.total_amount;
        let inserted = sqlx::query_as::<_, Invoice>(&format!(
            r#"
            INSERT INTO invoices (invoice_id, tenant_id, subscription_id, invoice_number, invoice_period_key, status, subtotal, discount_amount, cgst_amount, sgst_amount, igst_amount, tax_amount, total_amount, paid_amount, balance_due, currency, issue_date, due_date)
            VALUES ($1, $2, $3, $4, $5, 'issued', $6, $7, $8, $9, $10, $11, $12, 0, $12, $13, CURRENT_DATE, $14)
            RETURNING {INVOICE_COLUMNS}
            "#
        ))
        .bind(invoice_id)
        .bind(tenant_id)
        .bind(subscription_id)
        .bind(&invoice_number)
        .bind(&period_key)
        .bind(subscription.base_price)
        .bind(subscription.discount_amount)
        .bind(tax_split.cgst)
        .bind(tax_split.sgst)
        .bind(tax_split.igst)
        .bind(tax_split.total_tax)
        .bind(total_amount)
        .bind(&subscription.currency)
        .bind(subscription.next_billing_date)
        .fetch_one(&mut *tx)
        .await;

        let invoice = match inserted {
            Ok(invoice) => invoice,
            Err(sqlx::Error::Database(ref db_err)) if db_err.is_unique_violation() => {
                // A concurrent caller generated this period's invoice first;
                // return its result instead of creating a duplicate.
                drop(tx);
                timer.observe_duration();
                let existing = self
                    .get_invoice_by_period_key(subscription_id, &period_key)
                    .await?
                    .ok_or_else(|| {
                        AppError::DatabaseError(anyhow::anyhow!(
                            "Invoice period conflict without an existing row"
                        ))
                    })?;
                let line_items = self.get_line_items(tenant_id, existing.invoice_id).await?;
                return Ok(InvoiceWithLines {
                    invoice: existing,
                    line_items,
                });
            }
            Err(e) => {
                return Err(AppError::DatabaseError(anyhow::anyhow!(
                    "Failed to create invoice: {}",
                    e
                )))
            }
        };

        let line_item = sqlx::query_as::<_, LineItem>(
            r#"
            INSERT INTO line_items (line_item_id, invoice_id, tenant_id, description, quantity, unit_price, amount, tax_rate, tax_amount, sort_order)
            VALUES ($1, $2, $3, $4, 1, $5, $5, $6, $7, 0)
            RETURNING line_item_id, invoice_id, tenant_id, description, metric_name, quantity, unit_price, amount, tax_rate, tax_amount, sort_order, created_utc
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(invoice_id)
        .bind(tenant_id)
        .bind(&description)
        .bind(subscription.base_price)
        .bind(tax.rate)
        .bind(tax_split.total_tax)
        .fetch_one(&mut *tx)
        .await
        .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Failed to create line item: {}", e)))?;

        tx.commit().await.map_err(|e| {
            AppError::DatabaseError(anyhow::anyhow!("Failed to commit transaction: {}", e))
        })?;

        timer.observe_duration();
        info!(
            invoice_id = %invoice.invoice_id,
            invoice_number = %invoice.invoice_number,
            "Subscription invoice generated"
        );

        Ok(InvoiceWithLines {
            invoice,
            line_items: vec![line_item],
        })
    }

    /// Generate an invoice from aggregated unbilled usage. Aggregation, line
    /// items, and billing marks land in one transaction.
    #[instrument(skip(self, tax), fields(tenant_id = %tenant_id, subscription_id = %subscription_id))]
    pub async fn generate_usage_invoice(
        &self,
        tenant_id: Uuid,
        subscription_id: Uuid,
        period_start: NaiveDate,
        period_end: NaiveDate,
        tenant_state_code: &str,
        tax: &TaxConfig,
    ) -> Result<InvoiceWithLines, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["generate_usage_invoice"])
            .start_timer();

        let subscription = self
            .get_subscription(tenant_id, subscription_id)
            .await?
            .ok_or_else(|| AppError::NotFound(anyhow::anyhow!("Subscription not found")))?;

        let mut tx = self.pool.begin().await.map_err(|e| {
            AppError::DatabaseError(anyhow::anyhow!("Failed to begin transaction: {}", e))
        })?;

        // Lock the unbilled records for the period so concurrent generation
        // cannot bill them twice.
        let records = sqlx::query_as::<_, UsageRecord>(&format!(
            r#"
            SELECT {USAGE_COLUMNS}
            FROM usage_records
            WHERE tenant_id = $1 AND subscription_id = $2
              AND period_start >= $3 AND period_end <= $4
              AND is_billed = FALSE
            ORDER BY record_id
            FOR UPDATE
            "#
        ))
        .bind(tenant_id)
        .bind(subscription_id)
        .bind(period_start)
        .bind(period_end)
        .fetch_all(&mut *tx)
        .await
        .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Failed to read usage: {}", e)))?;

        let period_key = format!("usage-{}:{}", period_start, period_end);

        if records.is_empty() {
            drop(tx);
            // The period may already be billed; repeat calls return the
            // invoice that billed it.
            if let Some(existing) = self
                .get_invoice_by_period_key(subscription_id, &period_key)
                .await?
            {
                timer.observe_duration();
                let line_items = self.get_line_items(tenant_id, existing.invoice_id).await?;
                return Ok(InvoiceWithLines {
                    invoice: existing,
                    line_items,
                });
            }
            return Err(AppError::BadRequest(anyhow::anyhow!(
                "No unbilled usage in the requested period"
            )));
        }

        // Group by metric and unit price so every line satisfies
        // amount = quantity * unit_price.
        let mut groups: BTreeMap<(String, Decimal), (Decimal, Decimal)> = BTreeMap::new();
        for record in &records {
            let entry = groups
                .entry((record.metric_name.clone(), record.unit_price))
                .or_insert((Decimal::ZERO, Decimal::ZERO));
            entry.0 += record.quantity;
            entry.1 += record.quantity * record.unit_price;
        }

        let subtotal: Decimal = groups.values().map(|(_, amount)| *amount).sum();
        let tax_split = compute_tax(subtotal, tenant_state_code, &tax.platform_state_code, tax.rate);
        let total_amount = subtotal + tax_split.total_tax;

        let invoice_number: String = sqlx::query_scalar("SELECT next_invoice_number($1)")
            .bind(tenant_id)
            .fetch_one(&mut *tx)
            .await
            .map_err(|e| {
                AppError::DatabaseError(anyhow::anyhow!("Failed to allocate invoice number: {}", e))
            })?;

        let invoice_id = Uuid::new_v4();
        let inserted = sqlx::query_as::<_, Invoice>(&format!(
            r#"
            INSERT INTO invoices (invoice_id, tenant_id, subscription_id, invoice_number, invoice_period_key, status, subtotal, discount_amount, cgst_amount, sgst_amount, igst_amount, tax_amount, total_amount, paid_amount, balance_due, currency, issue_date)
            VALUES ($1, $2, $3, $4, $5, 'issued', $6, 0, $7, $8, $9, $10, $11, 0, $11, $12, CURRENT_DATE)
            RETURNING {INVOICE_COLUMNS}
            "#
        ))
        .bind(invoice_id)
        .bind(tenant_id)
        .bind(subscription_id)
        .bind(&invoice_number)
        .bind(&period_key)
        .bind(subtotal)
        .bind(tax_split.cgst)
        .bind(tax_split.sgst)
        .bind(tax_split.igst)
        .bind(tax_split.total_tax)
        .bind(total_amount)
        .bind(&subscription.currency)
        .fetch_one(&mut *tx)
        .await;

        let invoice = match inserted {
            Ok(invoice) => invoice,
            Err(sqlx::Error::Database(ref db_err)) if db_err.is_unique_violation() => {
                drop(tx);
                timer.observe_duration();
                let existing = self
                    .get_invoice_by_period_key(subscription_id, &period_key)
                    .await?
                    .ok_or_else(|| {
                        AppError::DatabaseError(anyhow::anyhow!(
                            "Invoice period conflict without an existing row"
                        ))
                    })?;
                let line_items = self.get_line_items(tenant_id, existing.invoice_id).await?;
                return Ok(InvoiceWithLines {
                    invoice: existing,
                    line_items,
                });
            }
            Err(e) => {
                return Err(AppError::DatabaseError(anyhow::anyhow!(
                    "Failed to create usage invoice: {}",
                    e
                )))
            }
        };

        let mut line_items = Vec::with_capacity(groups.len());
        for (sort_order, ((metric_name, unit_price), (quantity, amount))) in
            groups.into_iter().enumerate()
        {
            let line_tax = compute_tax(amount, tenant_state_code, &tax.platform_state_code, tax.rate);
            let line_item = sqlx::query_as::<_, LineItem>(
                r#"
                INSERT INTO line_items (line_item_id, invoice_id, tenant_id, description, metric_name, quantity, unit_price, amount, tax_rate, tax_amount, sort_order)
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
                RETURNING line_item_id, invoice_id, tenant_id, description, metric_name, quantity, unit_price, amount, tax_rate, tax_amount, sort_order, created_utc
                "#,
            )
            .bind(Uuid::new_v4())
            .bind(invoice_id)
            .bind(tenant_id)
            .bind(format!("Usage: {}", metric_name))
            .bind(&metric_name)
            .bind(quantity)
            .bind(unit_price)
            .bind(amount)
            .bind(tax.rate)
            .bind(line_tax.total_tax)
            .bind(sort_order as i32)
            .fetch_one(&mut *tx)
            .await
            .map_err(|e| {
                AppError::DatabaseError(anyhow::anyhow!("Failed to create line item: {}", e))
            })?;
            line_items.push(line_item);
        }

        let record_ids: Vec<Uuid> = records.iter().map(|r| r.record_id).collect();
        mark_billed_in_tx(&mut tx, tenant_id, &record_ids, invoice_id).await?;

        tx.commit().await.map_err(|e| {
            AppError::DatabaseError(anyhow::anyhow!("Failed to commit transaction: {}", e))
        })?;

        timer.observe_duration();
        info!(
            invoice_id = %invoice.invoice_id,
            invoice_number = %invoice.invoice_number,
            records = record_ids.len(),
            "Usage invoice generated"
        );

        Ok(InvoiceWithLines {
            invoice,
            line_items,
        })
    }

    /// Get an invoice by ID.
    #[instrument(skip(self), fields(tenant_id = %tenant_id, invoice_id = %invoice_id))]
    pub async fn get_invoice(
        &self,
        tenant_id: Uuid,
        invoice_id: Uuid,
    ) -> Result<Option<Invoice>, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["get_invoice"])
            .start_timer();

        let invoice = sqlx::query_as::<_, Invoice>(&format!(
            "SELECT {INVOICE_COLUMNS} FROM invoices WHERE tenant_id = $1 AND invoice_id = $2"
        ))
        .bind(tenant_id)
        .bind(invoice_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Failed to get invoice: {}", e)))?;

        timer.observe_duration();

        Ok(invoice)
    }

    /// Get an invoice by its subscription/period deduplication key.
    async fn get_invoice_by_period_key(
        &self,
        subscription_id: Uuid,
        period_key: &str,
    ) -> Result<Option<Invoice>, AppError> {
        let invoice = sqlx::query_as::<_, Invoice>(&format!(
            "SELECT {INVOICE_COLUMNS} FROM invoices WHERE subscription_id = $1 AND invoice_period_key = $2"
        ))
        .bind(subscription_id)
        .bind(period_key)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Failed to get invoice: {}", e)))?;

        Ok(invoice)
    }

    /// Get line items for an invoice.
    #[instrument(skip(self), fields(tenant_id = %tenant_id, invoice_id = %invoice_id))]
    pub async fn get_line_items(
        &self,
        tenant_id: Uuid,
        invoice_id: Uuid,
    ) -> Result<Vec<LineItem>, AppError> {
        let line_items = sqlx::query_as::<_, LineItem>(
            r#"
            SELECT line_item_id, invoice_id, tenant_id, description, metric_name, quantity, unit_price, amount, tax_rate, tax_amount, sort_order, created_utc
            FROM line_items
            WHERE tenant_id = $1 AND invoice_id = $2
            ORDER BY sort_order, created_utc
            "#,
        )
        .bind(tenant_id)
        .bind(invoice_id)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Failed to get line items: {}", e)))?;

        Ok(line_items)
    }

    /// List invoices for a tenant.
    #[instrument(skip(self, filter), fields(tenant_id = %tenant_id))]
    pub async fn list_invoices(
        &self,
        tenant_id: Uuid,
        filter: &ListInvoicesFilter,
    ) -> Result<Vec<Invoice>, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["list_invoices"])
            .start_timer();

        let limit = filter.page_size.clamp(1, 100) as i64;
        let status_str = filter.status.map(|s| s.as_str().to_string());

        let invoices = sqlx::query_as::<_, Invoice>(&format!(
            r#"
            SELECT {INVOICE_COLUMNS}
            FROM invoices
            WHERE tenant_id = $1
              AND ($2::varchar IS NULL OR status = $2)
              AND ($3::uuid IS NULL OR subscription_id = $3)
              AND ($4::date IS NULL OR issue_date >= $4)
              AND ($5::date IS NULL OR issue_date <= $5)
              AND ($6::uuid IS NULL OR invoice_id > $6)
            ORDER BY invoice_id
            LIMIT $7
            "#
        ))
        .bind(tenant_id)
        .bind(&status_str)
        .bind(filter.subscription_id)
        .bind(filter.start_date)
        .bind(filter.end_date)
        .bind(filter.page_token)
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Failed to list invoices: {}", e)))?;

        timer.observe_duration();

        Ok(invoices)
    }

    /// Apply a payment amount to an invoice. Overpayment is rejected, never
    /// clamped; the caller issues a refund or credit separately.
    #[instrument(skip(self), fields(tenant_id = %tenant_id, invoice_id = %invoice_id))]
    pub async fn mark_invoice_paid(
        &self,
        tenant_id: Uuid,
        invoice_id: Uuid,
        paid_amount: Decimal,
        payment_date: NaiveDate,
    ) -> Result<Invoice, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["mark_invoice_paid"])
            .start_timer();

        let mut tx = self.pool.begin().await.map_err(|e| {
            AppError::DatabaseError(anyhow::anyhow!("Failed to begin transaction: {}", e))
        })?;

        let invoice = mark_paid_in_tx(&mut tx, tenant_id, invoice_id, paid_amount, payment_date).await?;

        tx.commit().await.map_err(|e| {
            AppError::DatabaseError(anyhow::anyhow!("Failed to commit transaction: {}", e))
        })?;

        timer.observe_duration();
        info!(
            invoice_id = %invoice_id,
            status = %invoice.status,
            balance_due = %invoice.balance_due,
            "Invoice payment applied"
        );

        Ok(invoice)
    }

    // =========================================================================
    // Payment Operations
    // =========================================================================

    /// Record a gateway payment confirmation. Idempotent on
    /// `gateway_transaction_id`: re-delivery returns the original payment
    /// without re-applying it. Unmatched confirmations are stored rather
    /// than rejected.
    #[instrument(skip(self, input), fields(tenant_id = %tenant_id, gateway_transaction_id = %input.gateway_transaction_id))]
    pub async fn record_payment(
        &self,
        tenant_id: Uuid,
        input: &RecordPaymentRequest,
    ) -> Result<RecordedPayment, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["record_payment"])
            .start_timer();

        if input.amount <= Decimal::ZERO {
            return Err(AppError::BadRequest(anyhow::anyhow!(
                "Payment amount must be positive"
            )));
        }

        let mut tx = self.pool.begin().await.map_err(|e| {
            AppError::DatabaseError(anyhow::anyhow!("Failed to begin transaction: {}", e))
        })?;

        // Resolve the invoice and owning subscription before insert so the
        // stored row carries what was actually applied.
        let invoice = match input.invoice_id {
            Some(invoice_id) => sqlx::query_as::<_, Invoice>(&format!(
                "SELECT {INVOICE_COLUMNS} FROM invoices WHERE tenant_id = $1 AND invoice_id = $2 FOR UPDATE"
            ))
            .bind(tenant_id)
            .bind(invoice_id)
            .fetch_optional(&mut *tx)
            .await
            .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Failed to read invoice: {}", e)))?,
            None => None,
        };

        let subscription_id = invoice
            .as_ref()
            .and_then(|i| i.subscription_id)
            .or(input.subscription_id);

        let subscription = match subscription_id {
            Some(id) => lock_subscription(&mut tx, tenant_id, id).await?,
            None => None,
        };

        // Applying would overpay when the gateway amount exceeds the balance;
        // store the confirmation unmatched for manual reconciliation instead
        // of losing it.
        let applicable_invoice = invoice.as_ref().filter(|i| {
            i.status != InvoiceStatus::Cancelled.as_str()
                && i.paid_amount + input.amount <= i.total_amount
        });

        let matched = applicable_invoice.is_some() || subscription.is_some();
        if !matched {
            warn!(
                gateway_transaction_id = %input.gateway_transaction_id,
                "Payment confirmation did not match an invoice or subscription; storing unmatched"
            );
        }

        let payment_id = Uuid::new_v4();
        let inserted = sqlx::query_as::<_, Payment>(&format!(
            r#"
            INSERT INTO payments (payment_id, tenant_id, invoice_id, subscription_id, gateway_name, gateway_transaction_id, amount, currency, status, unmatched)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, 'completed', $9)
            ON CONFLICT (gateway_transaction_id) DO NOTHING
            RETURNING {PAYMENT_COLUMNS}
            "#
        ))
        .bind(payment_id)
        .bind(tenant_id)
        .bind(applicable_invoice.map(|i| i.invoice_id))
        .bind(subscription.as_ref().map(|s| s.subscription_id))
        .bind(&input.gateway_name)
        .bind(&input.gateway_transaction_id)
        .bind(input.amount)
        .bind(&input.currency)
        .bind(!matched)
        .fetch_optional(&mut *tx)
        .await
        .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Failed to record payment: {}", e)))?;

        let payment = match inserted {
            Some(payment) => payment,
            None => {
                // Re-delivery of an already recorded confirmation.
                drop(tx);
                timer.observe_duration();
                let existing = sqlx::query_as::<_, Payment>(&format!(
                    "SELECT {PAYMENT_COLUMNS} FROM payments WHERE gateway_transaction_id = $1"
                ))
                .bind(&input.gateway_transaction_id)
                .fetch_one(&self.pool)
                .await
                .map_err(|e| {
                    AppError::DatabaseError(anyhow::anyhow!("Failed to re-read payment: {}", e))
                })?;
                info!(
                    payment_id = %existing.payment_id,
                    gateway_transaction_id = %input.gateway_transaction_id,
                    "Duplicate payment confirmation ignored"
                );
                return Ok(RecordedPayment {
                    payment: existing,
                    newly_recorded: false,
                });
            }
        };

        if let Some(invoice) = applicable_invoice {
            mark_paid_in_tx(
                &mut tx,
                tenant_id,
                invoice.invoice_id,
                input.amount,
                Utc::now().date_naive(),
            )
            .await?;
        }

        if let Some(subscription) = &subscription {
            let status = SubscriptionStatus::from_string(&subscription.status);
            if matches!(
                status,
                SubscriptionStatus::Pending | SubscriptionStatus::PastDue
            ) {
                let next = transition(status, SubscriptionEvent::PaymentRecorded)?;
                let plan = self.get_plan(subscription.plan_id).await?;
                let cycle = plan
                    .map(|p| BillingCycle::from_string(&p.billing_cycle))
                    .unwrap_or(BillingCycle::Monthly);
                let anchor = subscription
                    .next_billing_date
                    .unwrap_or_else(|| Utc::now().date_naive());
                let next_billing = advance_billing_date(anchor, cycle);

                sqlx::query(
                    r#"
                    UPDATE subscriptions
                    SET status = $3, next_billing_date = $4, updated_utc = NOW()
                    WHERE tenant_id = $1 AND subscription_id = $2
                    "#,
                )
                .bind(tenant_id)
                .bind(subscription.subscription_id)
                .bind(next.as_str())
                .bind(next_billing)
                .execute(&mut *tx)
                .await
                .map_err(|e| {
                    AppError::DatabaseError(anyhow::anyhow!(
                        "Failed to activate subscription: {}",
                        e
                    ))
                })?;

                info!(
                    subscription_id = %subscription.subscription_id,
                    from = status.as_str(),
                    to = next.as_str(),
                    "Subscription activated by payment"
                );
            }
        }

        tx.commit().await.map_err(|e| {
            AppError::DatabaseError(anyhow::anyhow!("Failed to commit transaction: {}", e))
        })?;

        timer.observe_duration();
        info!(
            payment_id = %payment.payment_id,
            amount = %payment.amount,
            unmatched = payment.unmatched,
            "Payment recorded"
        );

        Ok(RecordedPayment {
            payment,
            newly_recorded: true,
        })
    }

    /// Get a payment by ID.
    #[instrument(skip(self), fields(tenant_id = %tenant_id, payment_id = %payment_id))]
    pub async fn get_payment(
        &self,
        tenant_id: Uuid,
        payment_id: Uuid,
    ) -> Result<Option<Payment>, AppError> {
        let payment = sqlx::query_as::<_, Payment>(&format!(
            "SELECT {PAYMENT_COLUMNS} FROM payments WHERE tenant_id = $1 AND payment_id = $2"
        ))
        .bind(tenant_id)
        .bind(payment_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Failed to get payment: {}", e)))?;

        Ok(payment)
    }

    /// List payments for a tenant.
    #[instrument(skip(self, filter), fields(tenant_id = %tenant_id))]
    pub async fn list_payments(
        &self,
        tenant_id: Uuid,
        filter: &ListPaymentsFilter,
    ) -> Result<Vec<Payment>, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["list_payments"])
            .start_timer();

        let limit = filter.page_size.clamp(1, 100) as i64;

        let payments = sqlx::query_as::<_, Payment>(&format!(
            r#"
            SELECT {PAYMENT_COLUMNS}
            FROM payments
            WHERE tenant_id = $1
              AND ($2::uuid IS NULL OR invoice_id = $2)
              AND ($3::uuid IS NULL OR subscription_id = $3)
              AND ($4::bool IS NULL OR unmatched = $4)
              AND ($5::uuid IS NULL OR payment_id > $5)
            ORDER BY payment_id
            LIMIT $6
            "#
        ))
        .bind(tenant_id)
        .bind(filter.invoice_id)
        .bind(filter.subscription_id)
        .bind(filter.unmatched)
        .bind(filter.page_token)
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Failed to list payments: {}", e)))?;

        timer.observe_duration();

        Ok(payments)
    }

    // =========================================================================
    // Partner & Commission Operations
    // =========================================================================

    /// Create a partner.
    #[instrument(skip(self, input))]
    pub async fn create_partner(&self, input: &CreatePartner) -> Result<Partner, AppError> {
        if input.commission_value < Decimal::ZERO {
            return Err(AppError::BadRequest(anyhow::anyhow!(
                "Commission value must not be negative"
            )));
        }

        let partner_id = Uuid::new_v4();
        let partner = sqlx::query_as::<_, Partner>(
            r#"
            INSERT INTO partners (partner_id, name, commission_type, commission_value)
            VALUES ($1, $2, $3, $4)
            RETURNING partner_id, name, commission_type, commission_value, is_active, created_utc
            "#,
        )
        .bind(partner_id)
        .bind(&input.name)
        .bind(input.commission_type.as_str())
        .bind(input.commission_value)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Failed to create partner: {}", e)))?;

        info!(partner_id = %partner.partner_id, name = %partner.name, "Partner created");

        Ok(partner)
    }

    /// Get a partner by ID.
    #[instrument(skip(self), fields(partner_id = %partner_id))]
    pub async fn get_partner(&self, partner_id: Uuid) -> Result<Option<Partner>, AppError> {
        let partner = sqlx::query_as::<_, Partner>(
            r#"
            SELECT partner_id, name, commission_type, commission_value, is_active, created_utc
            FROM partners
            WHERE partner_id = $1
            "#,
        )
        .bind(partner_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Failed to get partner: {}", e)))?;

        Ok(partner)
    }

    /// Compute and persist the commission for a payment. Exactly one
    /// commission row exists per payment; recomputation returns it.
    #[instrument(skip(self), fields(payment_id = %payment_id, partner_id = %partner_id))]
    pub async fn create_commission(
        &self,
        payment_id: Uuid,
        partner_id: Uuid,
        tenant_override_rate: Option<Decimal>,
    ) -> Result<Commission, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["create_commission"])
            .start_timer();

        let payment = sqlx::query_as::<_, Payment>(&format!(
            "SELECT {PAYMENT_COLUMNS} FROM payments WHERE payment_id = $1"
        ))
        .bind(payment_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Failed to read payment: {}", e)))?
        .ok_or_else(|| AppError::NotFound(anyhow::anyhow!("Payment not found")))?;

        let partner = self
            .get_partner(partner_id)
            .await?
            .ok_or_else(|| AppError::NotFound(anyhow::anyhow!("Partner not found")))?;

        if !partner.is_active {
            return Err(AppError::BadRequest(anyhow::anyhow!(
                "Partner is not active"
            )));
        }

        let commission_type = CommissionType::from_string(&partner.commission_type);
        let rate = tenant_override_rate.unwrap_or(partner.commission_value);
        let commission_amount = commission::compute(payment.amount, commission_type, rate);

        let commission_id = Uuid::new_v4();
        let inserted = sqlx::query_as::<_, Commission>(&format!(
            r#"
            INSERT INTO commissions (commission_id, partner_id, tenant_id, payment_id, base_amount, commission_rate, commission_amount, status)
            VALUES ($1, $2, $3, $4, $5, $6, $7, 'pending')
            ON CONFLICT (payment_id) DO NOTHING
            RETURNING {COMMISSION_COLUMNS}
            "#
        ))
        .bind(commission_id)
        .bind(partner_id)
        .bind(payment.tenant_id)
        .bind(payment_id)
        .bind(payment.amount)
        .bind(rate)
        .bind(commission_amount)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| {
            AppError::DatabaseError(anyhow::anyhow!("Failed to create commission: {}", e))
        })?;

        let commission = match inserted {
            Some(commission) => {
                info!(
                    commission_id = %commission.commission_id,
                    commission_amount = %commission.commission_amount,
                    "Commission created"
                );
                commission
            }
            None => sqlx::query_as::<_, Commission>(&format!(
                "SELECT {COMMISSION_COLUMNS} FROM commissions WHERE payment_id = $1"
            ))
            .bind(payment_id)
            .fetch_one(&self.pool)
            .await
            .map_err(|e| {
                AppError::DatabaseError(anyhow::anyhow!("Failed to re-read commission: {}", e))
            })?,
        };

        timer.observe_duration();

        Ok(commission)
    }

    /// Get a commission by ID.
    #[instrument(skip(self), fields(commission_id = %commission_id))]
    pub async fn get_commission(
        &self,
        commission_id: Uuid,
    ) -> Result<Option<Commission>, AppError> {
        let commission = sqlx::query_as::<_, Commission>(&format!(
            "SELECT {COMMISSION_COLUMNS} FROM commissions WHERE commission_id = $1"
        ))
        .bind(commission_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Failed to get commission: {}", e)))?;

        Ok(commission)
    }

    /// List commissions for a partner.
    #[instrument(skip(self), fields(partner_id = %partner_id))]
    pub async fn list_commissions(&self, partner_id: Uuid) -> Result<Vec<Commission>, AppError> {
        let commissions = sqlx::query_as::<_, Commission>(&format!(
            "SELECT {COMMISSION_COLUMNS} FROM commissions WHERE partner_id = $1 ORDER BY created_utc"
        ))
        .bind(partner_id)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| {
            AppError::DatabaseError(anyhow::anyhow!("Failed to list commissions: {}", e))
        })?;

        Ok(commissions)
    }

    /// Change a commission's status along its state machine.
    #[instrument(skip(self), fields(commission_id = %commission_id))]
    pub async fn update_commission_status(
        &self,
        commission_id: Uuid,
        next: CommissionStatus,
    ) -> Result<Commission, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["update_commission_status"])
            .start_timer();

        let mut tx = self.pool.begin().await.map_err(|e| {
            AppError::DatabaseError(anyhow::anyhow!("Failed to begin transaction: {}", e))
        })?;

        let commission = sqlx::query_as::<_, Commission>(&format!(
            "SELECT {COMMISSION_COLUMNS} FROM commissions WHERE commission_id = $1 FOR UPDATE"
        ))
        .bind(commission_id)
        .fetch_optional(&mut *tx)
        .await
        .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Failed to read commission: {}", e)))?
        .ok_or_else(|| AppError::NotFound(anyhow::anyhow!("Commission not found")))?;

        let current = CommissionStatus::from_string(&commission.status);
        current.check_transition(next)?;

        let updated = sqlx::query_as::<_, Commission>(&format!(
            r#"
            UPDATE commissions
            SET status = $2, updated_utc = NOW()
            WHERE commission_id = $1
            RETURNING {COMMISSION_COLUMNS}
            "#
        ))
        .bind(commission_id)
        .bind(next.as_str())
        .fetch_one(&mut *tx)
        .await
        .map_err(|e| {
            AppError::DatabaseError(anyhow::anyhow!("Failed to update commission: {}", e))
        })?;

        tx.commit().await.map_err(|e| {
            AppError::DatabaseError(anyhow::anyhow!("Failed to commit transaction: {}", e))
        })?;

        timer.observe_duration();
        info!(
            commission_id = %commission_id,
            from = current.as_str(),
            to = next.as_str(),
            "Commission transitioned"
        );

        Ok(updated)
    }
}

/// Read a subscription row with a row lock inside a transaction.
async fn lock_subscription(
    tx: &mut Transaction<'_, Postgres>,
    tenant_id: Uuid,
    subscription_id: Uuid,
) -> Result<Option<Subscription>, AppError> {
    let subscription = sqlx::query_as::<_, Subscription>(&format!(
        "SELECT {SUBSCRIPTION_COLUMNS} FROM subscriptions WHERE tenant_id = $1 AND subscription_id = $2 FOR UPDATE"
    ))
    .bind(tenant_id)
    .bind(subscription_id)
    .fetch_optional(&mut **tx)
    .await
    .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Failed to read subscription: {}", e)))?;

    Ok(subscription)
}

/// Apply a payment amount to an invoice inside an open transaction.
async fn mark_paid_in_tx(
    tx: &mut Transaction<'_, Postgres>,
    tenant_id: Uuid,
    invoice_id: Uuid,
    paid_amount: Decimal,
    _payment_date: NaiveDate,
) -> Result<Invoice, AppError> {
    if paid_amount <= Decimal::ZERO {
        return Err(AppError::BadRequest(anyhow::anyhow!(
            "Paid amount must be positive"
        )));
    }

    let invoice = sqlx::query_as::<_, Invoice>(&format!(
        "SELECT {INVOICE_COLUMNS} FROM invoices WHERE tenant_id = $1 AND invoice_id = $2 FOR UPDATE"
    ))
    .bind(tenant_id)
    .bind(invoice_id)
    .fetch_optional(&mut **tx)
    .await
    .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Failed to read invoice: {}", e)))?
    .ok_or_else(|| AppError::NotFound(anyhow::anyhow!("Invoice not found")))?;

    let current = InvoiceStatus::from_string(&invoice.status);
    if current == InvoiceStatus::Cancelled {
        return Err(AppError::Conflict(anyhow::anyhow!(
            "Cannot apply payment to a cancelled invoice"
        )));
    }

    let new_paid = invoice.paid_amount + paid_amount;
    if new_paid > invoice.total_amount {
        return Err(AppError::InvariantViolation(anyhow::anyhow!(
            "Payment of {} would exceed invoice total {} (already paid {})",
            paid_amount,
            invoice.total_amount,
            invoice.paid_amount
        )));
    }

    let balance_due = invoice.total_amount - new_paid;
    let next = if balance_due.is_zero() {
        InvoiceStatus::Paid
    } else {
        InvoiceStatus::PartiallyPaid
    };
    // A further partial payment keeps the status in place; only actual
    // status changes go through the forward-only check.
    if next != current {
        current.check_transition(next)?;
    }

    let updated = sqlx::query_as::<_, Invoice>(&format!(
        r#"
        UPDATE invoices
        SET status = $3, paid_amount = $4, balance_due = $5, updated_utc = NOW()
        WHERE tenant_id = $1 AND invoice_id = $2
        RETURNING {INVOICE_COLUMNS}
        "#
    ))
    .bind(tenant_id)
    .bind(invoice_id)
    .bind(next.as_str())
    .bind(new_paid)
    .bind(balance_due)
    .fetch_one(&mut **tx)
    .await
    .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Failed to update invoice: {}", e)))?;

    Ok(updated)
}

/// Mark usage records billed inside an open transaction, failing (not
/// partially applying) if any id is already billed or missing.
async fn mark_billed_in_tx(
    tx: &mut Transaction<'_, Postgres>,
    tenant_id: Uuid,
    usage_ids: &[Uuid],
    invoice_id: Uuid,
) -> Result<u64, AppError> {
    if usage_ids.is_empty() {
        return Ok(0);
    }

    let result = sqlx::query(
        r#"
        UPDATE usage_records
        SET is_billed = TRUE, billed_in_invoice_id = $3
        WHERE tenant_id = $1 AND record_id = ANY($2) AND is_billed = FALSE
        "#,
    )
    .bind(tenant_id)
    .bind(usage_ids)
    .bind(invoice_id)
    .execute(&mut **tx)
    .await
    .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Failed to mark usage billed: {}", e)))?;

    if result.rows_affected() != usage_ids.len() as u64 {
        return Err(AppError::Conflict(anyhow::anyhow!(
            "Usage records already billed or missing ({} of {} updated)",
            result.rows_affected(),
            usage_ids.len()
        )));
    }

    Ok(result.rows_affected())
}

/// Advance a billing date by one cycle; one-time plans have no next date.
fn advance_billing_date(date: NaiveDate, cycle: BillingCycle) -> Option<NaiveDate> {
    cycle.months().map(|months| date + Months::new(months))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn advance_billing_date_follows_cycle() {
        let start = NaiveDate::from_ymd_opt(2025, 1, 31).unwrap();
        assert_eq!(
            advance_billing_date(start, BillingCycle::Monthly),
            Some(NaiveDate::from_ymd_opt(2025, 2, 28).unwrap())
        );
        assert_eq!(
            advance_billing_date(start, BillingCycle::Quarterly),
            Some(NaiveDate::from_ymd_opt(2025, 4, 30).unwrap())
        );
        assert_eq!(
            advance_billing_date(start, BillingCycle::Yearly),
            Some(NaiveDate::from_ymd_opt(2026, 1, 31).unwrap())
        );
        assert_eq!(advance_billing_date(start, BillingCycle::OneTime), None);
    }
}
