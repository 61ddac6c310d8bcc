//! Tenant context extraction for multi-tenancy support.
//!
//! Tenant identity is established by the platform's BFF after
//! authentication; this core trusts the `X-Tenant-ID` header it sets.

use axum::async_trait;
use axum::extract::FromRequestParts;
use axum::http::request::Parts;
use service_core::error::AppError;
use uuid::Uuid;

/// Tenant context extracted from request headers.
#[derive(Debug, Clone)]
pub struct TenantContext {
    pub tenant_id: Uuid,
    /// Actor recorded in audit entries; defaults to "system" for
    /// scheduler- and webhook-originated calls.
    pub actor: String,
}

#[async_trait]
impl<S> FromRequestParts<S> for TenantContext
where
    S: Send + Sync,
{
    type Rejection = AppError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let tenant_id = parts
            .headers
            .get("X-Tenant-ID")
            .and_then(|v| v.to_str().ok())
            .ok_or_else(|| {
                AppError::BadRequest(anyhow::anyhow!("Missing X-Tenant-ID header"))
            })?;

        let tenant_id = Uuid::parse_str(tenant_id).map_err(|_| {
            AppError::BadRequest(anyhow::anyhow!("X-Tenant-ID must be a UUID"))
        })?;

        let actor = parts
            .headers
            .get("X-Actor-ID")
            .and_then(|v| v.to_str().ok())
            .unwrap_or("system")
            .to_string();

        let span = tracing::Span::current();
        span.record("tenant_id", tenant_id.to_string().as_str());

        Ok(TenantContext { tenant_id, actor })
    }
}
