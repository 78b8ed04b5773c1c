//! Payment provider configuration

use crate::error::{BillingError, BillingResult};

/// Configuration for the payment provider integration
#[derive(Debug, Clone)]
pub struct PaymentConfig {
    /// Provider secret API key
    pub secret_key: String,
    /// Webhook signing secret. Empty disables signature verification
    /// (development only).
    pub webhook_secret: String,
    /// Provider REST API base URL
    pub api_base: String,
}

impl PaymentConfig {
    /// Create config from environment variables
    pub fn from_env() -> BillingResult<Self> {
        Ok(Self {
            secret_key: std::env::var("STRIPE_SECRET_KEY")
                .map_err(|_| BillingError::Config("STRIPE_SECRET_KEY not set".to_string()))?,
            webhook_secret: std::env::var("STRIPE_WEBHOOK_SECRET").unwrap_or_default(),
            api_base: std::env::var("STRIPE_API_BASE")
                .unwrap_or_else(|_| "https://api.stripe.com".to_string()),
        })
    }
}
