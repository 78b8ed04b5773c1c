//! Notification emails
//!
//! Handlers queue `Notification`s while a transaction is open; the
//! queue is drained sequentially after commit. Sending is best-effort:
//! a failure is logged and never retried, and never affects the
//! already-committed state.

use serde::Serialize;

/// Email configuration
#[derive(Debug, Clone)]
pub struct EmailConfig {
    /// Email API key; empty disables sending
    pub api_key: String,
    /// From address
    pub email_from: String,
    /// App name for branding
    pub app_name: String,
    /// Email API endpoint
    pub api_url: String,
}

impl EmailConfig {
    /// Create config from environment variables
    pub fn from_env() -> Self {
        Self {
            api_key: std::env::var("RESEND_API_KEY").unwrap_or_default(),
            email_from: std::env::var("EMAIL_FROM")
                .unwrap_or_else(|_| "Labcompat <noreply@labcompat.com.br>".to_string()),
            app_name: std::env::var("APP_NAME").unwrap_or_else(|_| "Labcompat".to_string()),
            api_url: std::env::var("EMAIL_API_URL")
                .unwrap_or_else(|_| "https://api.resend.com/emails".to_string()),
        }
    }

    /// Check if email sending is enabled
    pub fn is_enabled(&self) -> bool {
        !self.api_key.is_empty()
    }
}

/// One queued notification
#[derive(Debug, Clone, Serialize)]
pub struct Notification {
    pub to: String,
    pub subject: String,
    pub html: String,
}

fn format_brl(cents: i64) -> String {
    format!("R$ {:.2}", cents as f64 / 100.0)
}

impl Notification {
    pub fn subscription_created(
        to: &str,
        name: &str,
        plan_name: &str,
        monthly_price_cents: i64,
        monthly_credits: i64,
    ) -> Self {
        Self {
            to: to.to_string(),
            subject: format!("Assinatura criada: {}", plan_name),
            html: format!(
                "<p>Olá {}, sua assinatura foi criada. Plano: {} ({}). Créditos/mês: {}.</p>",
                name,
                plan_name,
                format_brl(monthly_price_cents),
                monthly_credits
            ),
        }
    }

    pub fn subscription_updated(to: &str, name: &str, provider_subscription_id: &str) -> Self {
        Self {
            to: to.to_string(),
            subject: format!("Assinatura atualizada — {}", provider_subscription_id),
            html: format!(
                "<p>Olá {}, sua assinatura foi atualizada. Subscription: {}.</p>",
                name, provider_subscription_id
            ),
        }
    }

    pub fn subscription_canceled(to: &str, name: &str, provider_subscription_id: &str) -> Self {
        Self {
            to: to.to_string(),
            subject: format!("Assinatura cancelada — {}", provider_subscription_id),
            html: format!(
                "<p>Olá {}, sua assinatura foi marcada como inativa. Subscription: {}.</p>",
                name, provider_subscription_id
            ),
        }
    }

    pub fn subscription_payment_received(
        to: &str,
        name: &str,
        provider_subscription_id: &str,
        amount_cents: Option<i64>,
    ) -> Self {
        let amount = amount_cents
            .map(format_brl)
            .unwrap_or_else(|| "n/a".to_string());
        Self {
            to: to.to_string(),
            subject: format!("Pagamento recebido — assinatura {}", provider_subscription_id),
            html: format!(
                "<p>Olá {}, recebemos o pagamento da sua assinatura. Valor: {}.</p>",
                name, amount
            ),
        }
    }

    pub fn subscription_payment_failed(
        to: &str,
        name: &str,
        provider_subscription_id: &str,
        invoice_id: &str,
    ) -> Self {
        Self {
            to: to.to_string(),
            subject: format!("Falha no pagamento — assinatura {}", provider_subscription_id),
            html: format!(
                "<p>Olá {}, detectamos falha no pagamento da assinatura (invoice {}). \
                 Por favor, verifique seus dados de pagamento.</p>",
                name, invoice_id
            ),
        }
    }

    pub fn purchase_confirmed(to: &str, name: &str, amount_cents: i64, credits: i64) -> Self {
        Self {
            to: to.to_string(),
            subject: format!("Compra confirmada — créditos adicionados ({})", credits),
            html: format!(
                "<p>Olá {}, recebemos seu pagamento ({}). Créditos adicionados: {}.</p>",
                name,
                format_brl(amount_cents),
                credits
            ),
        }
    }

    pub fn payment_reconciled(to: &str, name: &str, purchase_id: i64, amount_cents: i64) -> Self {
        Self {
            to: to.to_string(),
            subject: format!("Pagamento confirmado — compra {}", purchase_id),
            html: format!(
                "<p>Olá {}, recebemos seu pagamento ({}).</p>",
                name,
                format_brl(amount_cents)
            ),
        }
    }

    /// Result-available notice. Deliberately carries no result content;
    /// the user must sign in to read the report.
    pub fn result_available(
        to: &str,
        name: &str,
        request_id: i64,
        chemical_product: &str,
        biological_product: &str,
    ) -> Self {
        Self {
            to: to.to_string(),
            subject: format!("Resultado disponível — solicitação #{}", request_id),
            html: format!(
                "<p>Olá {},</p>\
                 <p>O resultado da sua solicitação foi registrado no sistema.</p>\
                 <ul>\
                 <li><strong>ID da solicitação:</strong> {}</li>\
                 <li><strong>Produto químico:</strong> {}</li>\
                 <li><strong>Produto biológico:</strong> {}</li>\
                 </ul>\
                 <p>Por segurança, o conteúdo do resultado não é enviado por email. \
                 Acesse sua conta para visualizar o relatório completo.</p>",
                name, request_id, chemical_product, biological_product
            ),
        }
    }
}

/// Notification email service
#[derive(Clone)]
pub struct EmailService {
    config: EmailConfig,
    client: reqwest::Client,
}

impl EmailService {
    /// Create a new email service
    pub fn new(config: EmailConfig) -> Self {
        Self {
            config,
            client: reqwest::Client::new(),
        }
    }

    /// Create from environment variables
    pub fn from_env() -> Self {
        Self::new(EmailConfig::from_env())
    }

    /// Send one email.
    ///
    /// Returns `true` on success, `false` on any failure — sending is
    /// never allowed to fail webhook processing or an API response.
    pub async fn send(&self, notification: &Notification) -> bool {
        if !self.config.is_enabled() {
            tracing::warn!(
                to = %notification.to,
                subject = %notification.subject,
                "Email not configured, skipping"
            );
            return false;
        }

        let body = serde_json::json!({
            "from": self.config.email_from,
            "to": [notification.to],
            "subject": notification.subject,
            "html": notification.html,
        });

        let response = self
            .client
            .post(&self.config.api_url)
            .header("Authorization", format!("Bearer {}", self.config.api_key))
            .header("Content-Type", "application/json")
            .json(&body)
            .send()
            .await;

        match response {
            Ok(resp) if resp.status().is_success() => {
                tracing::info!(
                    to = %notification.to,
                    subject = %notification.subject,
                    "Notification email sent"
                );
                true
            }
            Ok(resp) => {
                let status = resp.status();
                let body = resp.text().await.unwrap_or_default();
                tracing::error!(
                    to = %notification.to,
                    subject = %notification.subject,
                    status = %status,
                    body = %body,
                    "Failed to send notification email - non-fatal"
                );
                false
            }
            Err(e) => {
                tracing::error!(
                    to = %notification.to,
                    subject = %notification.subject,
                    error = %e,
                    "Failed to send notification email - non-fatal"
                );
                false
            }
        }
    }

    /// Drain a post-commit notification queue sequentially, avoiding a
    /// burst at the email API.
    pub async fn send_all(&self, notifications: Vec<Notification>) {
        for notification in notifications {
            self.send(&notification).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_brl() {
        assert_eq!(format_brl(1000), "R$ 10.00");
        assert_eq!(format_brl(99), "R$ 0.99");
        assert_eq!(format_brl(0), "R$ 0.00");
    }

    #[test]
    fn test_result_available_omits_result_content() {
        let n = Notification::result_available("a@b.com", "Ana", 42, "Cobre", "Trichoderma");
        assert!(n.subject.contains("#42"));
        assert!(n.html.contains("Cobre"));
        assert!(n.html.contains("não é enviado por email"));
    }

    #[test]
    fn test_disabled_config() {
        let config = EmailConfig {
            api_key: String::new(),
            email_from: "x".to_string(),
            app_name: "x".to_string(),
            api_url: "http://localhost".to_string(),
        };
        assert!(!config.is_enabled());
    }
}
