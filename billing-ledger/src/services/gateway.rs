//! Payment gateway boundary.
//!
//! The ledger core never initiates charges or speaks a gateway wire
//! protocol; it consumes gateway-confirmed events. This module holds the
//! abstract interface used by the platform's checkout flow and the webhook
//! signature verification applied before a confirmation is recorded.

use async_trait::async_trait;
use hmac::{Hmac, Mac};
use secrecy::{ExposeSecret, Secret};
use service_core::error::AppError;
use sha2::Sha256;

/// A payment order created at the gateway, referenced by checkout.
#[derive(Debug, Clone)]
pub struct GatewayOrder {
    pub order_ref: String,
    pub amount_minor: u64,
    pub currency: String,
}

/// Abstract payment gateway. Implementations live outside this core; the
/// trait exists so nothing here depends on a concrete provider.
#[async_trait]
pub trait PaymentGateway: Send + Sync {
    /// Create an order for the given amount in minor units.
    async fn create_order(&self, amount_minor: u64, currency: &str)
        -> Result<GatewayOrder, AppError>;

    /// Verify a checkout signature for an order reference.
    async fn verify_payment(&self, order_ref: &str, signature: &str) -> Result<bool, AppError>;
}

/// Verifies HMAC-SHA256 webhook signatures over the raw request body.
#[derive(Clone)]
pub struct WebhookVerifier {
    secret: Secret<String>,
    required: bool,
}

impl WebhookVerifier {
    pub fn new(secret: Secret<String>, required: bool) -> Self {
        Self { secret, required }
    }

    /// Check the signature header against the raw body. When verification is
    /// not required (local development), a missing header is accepted.
    pub fn verify(&self, body: &str, signature: Option<&str>) -> Result<(), AppError> {
        let signature = match signature {
            Some(s) => s,
            None if !self.required => return Ok(()),
            None => {
                return Err(AppError::Forbidden(anyhow::anyhow!(
                    "Missing webhook signature header"
                )))
            }
        };

        let expected = compute_signature(body, self.secret.expose_secret())?;
        if expected == signature {
            Ok(())
        } else {
            tracing::warn!("Webhook signature verification failed");
            Err(AppError::Forbidden(anyhow::anyhow!(
                "Invalid webhook signature"
            )))
        }
    }
}

/// Compute HMAC-SHA256 signature, hex encoded.
fn compute_signature(payload: &str, secret: &str) -> Result<String, AppError> {
    type HmacSha256 = Hmac<Sha256>;
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
        .map_err(|_| AppError::InternalError(anyhow::anyhow!("Invalid key length")))?;
    mac.update(payload.as_bytes());
    let result = mac.finalize();
    Ok(hex::encode(result.into_bytes()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_valid_signature() {
        let verifier = WebhookVerifier::new(Secret::new("test_secret".to_string()), true);
        let body = r#"{"gateway_transaction_id":"pay_123"}"#;
        let signature = compute_signature(body, "test_secret").unwrap();
        assert!(verifier.verify(body, Some(&signature)).is_ok());
    }

    #[test]
    fn rejects_invalid_signature() {
        let verifier = WebhookVerifier::new(Secret::new("test_secret".to_string()), true);
        assert!(verifier.verify("{}", Some("bad_signature")).is_err());
    }

    #[test]
    fn missing_signature_rejected_only_when_required() {
        let strict = WebhookVerifier::new(Secret::new("s".to_string()), true);
        assert!(strict.verify("{}", None).is_err());

        let lax = WebhookVerifier::new(Secret::new("s".to_string()), false);
        assert!(lax.verify("{}", None).is_ok());
    }
}
