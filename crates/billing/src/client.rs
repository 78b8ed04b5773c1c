//! Payment provider client
//!
//! Thin wrapper over the provider's REST API. The reconciliation core
//! only needs three calls: retrieve a subscription (to refresh local
//! state during webhook handling), retrieve a customer's email (last
//! resort for resolving a local user), and cancel a subscription.

use crate::config::PaymentConfig;
use crate::error::{BillingError, BillingResult};
use crate::events::SubscriptionObject;

/// Outcome of a cancellation call against the provider
#[derive(Debug)]
pub enum CancelOutcome {
    /// The provider acknowledged the cancellation
    Canceled(serde_json::Value),
    /// The provider has no such subscription; local cleanup may proceed
    NotFound,
}

/// Payment provider API client
#[derive(Clone)]
pub struct PaymentClient {
    http: reqwest::Client,
    config: PaymentConfig,
}

impl PaymentClient {
    /// Create a new client from config
    pub fn new(config: PaymentConfig) -> Self {
        Self {
            http: reqwest::Client::new(),
            config,
        }
    }

    /// Get the config
    pub fn config(&self) -> &PaymentConfig {
        &self.config
    }

    /// Retrieve a subscription from the provider
    pub async fn get_subscription(&self, subscription_id: &str) -> BillingResult<SubscriptionObject> {
        let url = format!("{}/v1/subscriptions/{}", self.config.api_base, subscription_id);
        let response = self
            .http
            .get(&url)
            .bearer_auth(&self.config.secret_key)
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(BillingError::ProviderApi(format!(
                "GET subscription {} failed: {} {}",
                subscription_id, status, body
            )));
        }

        let subscription = response.json::<SubscriptionObject>().await?;
        Ok(subscription)
    }

    /// Retrieve a customer's email from the provider
    pub async fn customer_email(&self, customer_id: &str) -> BillingResult<Option<String>> {
        let url = format!("{}/v1/customers/{}", self.config.api_base, customer_id);
        let response = self
            .http
            .get(&url)
            .bearer_auth(&self.config.secret_key)
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(BillingError::ProviderApi(format!(
                "GET customer {} failed: {} {}",
                customer_id, status, body
            )));
        }

        let customer = response.json::<serde_json::Value>().await?;
        Ok(customer
            .get("email")
            .and_then(|v| v.as_str())
            .map(|s| s.to_string()))
    }

    /// Cancel a subscription at the provider
    ///
    /// `immediate = false` marks it to cancel at period end instead of
    /// deleting it outright. A missing subscription is reported as
    /// `CancelOutcome::NotFound` so the caller can still clean up local
    /// state; any other failure is a provider error and local state
    /// must NOT be mutated.
    pub async fn cancel_subscription(
        &self,
        subscription_id: &str,
        immediate: bool,
    ) -> BillingResult<CancelOutcome> {
        let url = format!("{}/v1/subscriptions/{}", self.config.api_base, subscription_id);

        let response = if immediate {
            self.http
                .delete(&url)
                .bearer_auth(&self.config.secret_key)
                .send()
                .await?
        } else {
            self.http
                .post(&url)
                .bearer_auth(&self.config.secret_key)
                .form(&[("cancel_at_period_end", "true")])
                .send()
                .await?
        };

        if response.status().is_success() {
            let body = response.json::<serde_json::Value>().await?;
            return Ok(CancelOutcome::Canceled(body));
        }

        let status = response.status();
        let body = response.text().await.unwrap_or_default();

        // "resource_missing" means the provider never had (or already
        // dropped) this subscription; treat it as cancellable locally.
        let missing = serde_json::from_str::<serde_json::Value>(&body)
            .ok()
            .and_then(|v| {
                v.get("error")
                    .and_then(|e| e.get("code"))
                    .and_then(|c| c.as_str())
                    .map(|c| c == "resource_missing")
            })
            .unwrap_or(false);

        if missing {
            tracing::info!(
                subscription_id = %subscription_id,
                "Provider subscription not found, proceeding with local cancellation"
            );
            return Ok(CancelOutcome::NotFound);
        }

        Err(BillingError::ProviderApi(format!(
            "cancel subscription {} failed: {} {}",
            subscription_id, status, body
        )))
    }
}
