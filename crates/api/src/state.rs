//! Shared application state

use std::sync::Arc;

use labcompat_billing::{EmailService, PaymentClient, PaymentConfig, WebhookHandler};
use sqlx::PgPool;

use crate::config::Config;

/// State shared by all request handlers
#[derive(Clone)]
pub struct AppState {
    pub pool: PgPool,
    pub config: Arc<Config>,
    pub webhooks: Arc<WebhookHandler>,
    pub payments: PaymentClient,
    pub email: EmailService,
}

impl AppState {
    pub fn new(
        pool: PgPool,
        config: Config,
        payment_config: PaymentConfig,
        email: EmailService,
    ) -> Self {
        let webhooks = Arc::new(WebhookHandler::new(
            pool.clone(),
            payment_config.clone(),
            email.clone(),
        ));
        let payments = PaymentClient::new(payment_config);
        Self {
            pool,
            config: Arc::new(config),
            webhooks,
            payments,
            email,
        }
    }
}
