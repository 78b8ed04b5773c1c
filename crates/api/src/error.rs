//! API error types and handling
//!
//! Error bodies are JSON `{"error": "...", "detalhe": {...}?}` with
//! short user-facing messages; internal exception text never leaks.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use labcompat_billing::BillingError;
use serde_json::json;

/// Application error type
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    // Authentication
    #[error("Autenticação necessária")]
    Unauthorized,
    #[error("Token inválido ou expirado")]
    InvalidToken,
    #[error("{0}")]
    Forbidden(String),

    // Validation
    #[error("{0}")]
    Validation(String),

    // Resources
    #[error("{0}")]
    NotFound(String),
    #[error("{0}")]
    Conflict(String),

    // Billing
    #[error("Saldo insuficiente: são necessários {required} créditos.")]
    InsufficientCredits { required: i64, available: i64 },
    #[error("Configuração do sistema ausente. Contate o administrador.")]
    MissingConfig,

    // External collaborators
    #[error("stripe_error")]
    ExternalService(String),

    // Internal
    #[error("Erro interno do servidor")]
    Database(String),
    #[error("Erro interno do servidor")]
    Internal,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, body) = match &self {
            ApiError::Unauthorized | ApiError::InvalidToken => (
                StatusCode::UNAUTHORIZED,
                json!({"error": self.to_string()}),
            ),
            ApiError::Forbidden(msg) => (StatusCode::FORBIDDEN, json!({"error": msg})),
            ApiError::Validation(msg) => (StatusCode::BAD_REQUEST, json!({"error": msg})),
            ApiError::NotFound(msg) => (StatusCode::NOT_FOUND, json!({"error": msg})),
            ApiError::Conflict(msg) => (StatusCode::CONFLICT, json!({"error": msg})),
            ApiError::InsufficientCredits {
                required,
                available,
            } => (
                StatusCode::BAD_REQUEST,
                json!({
                    "error": self.to_string(),
                    "detalhe": {
                        "creditos_necessarios": required,
                        "saldo_atual": available,
                    }
                }),
            ),
            ApiError::MissingConfig => (
                StatusCode::INTERNAL_SERVER_ERROR,
                json!({"error": self.to_string()}),
            ),
            ApiError::ExternalService(msg) => (
                StatusCode::BAD_GATEWAY,
                json!({"error": "stripe_error", "detalhe": {"message": msg}}),
            ),
            ApiError::Database(_) | ApiError::Internal => (
                StatusCode::INTERNAL_SERVER_ERROR,
                json!({"error": self.to_string()}),
            ),
        };

        (status, Json(body)).into_response()
    }
}

impl From<sqlx::Error> for ApiError {
    fn from(err: sqlx::Error) -> Self {
        tracing::error!("Database error: {:?}", err);
        match err {
            sqlx::Error::RowNotFound => {
                ApiError::NotFound("Recurso não encontrado".to_string())
            }
            sqlx::Error::Database(db_err) => {
                if let Some(code) = db_err.code() {
                    // PostgreSQL unique violation
                    if code == "23505" {
                        return ApiError::Conflict("Recurso já existe".to_string());
                    }
                }
                ApiError::Database(db_err.to_string())
            }
            _ => ApiError::Database(err.to_string()),
        }
    }
}

impl From<BillingError> for ApiError {
    fn from(err: BillingError) -> Self {
        match err {
            BillingError::InsufficientCredits {
                required,
                available,
            } => ApiError::InsufficientCredits {
                required,
                available,
            },
            BillingError::WebhookSignatureInvalid => {
                ApiError::Validation("Assinatura do webhook inválida".to_string())
            }
            BillingError::InvalidEvent(msg) | BillingError::InvalidInput(msg) => {
                ApiError::Validation(msg)
            }
            BillingError::UserNotFound(msg) | BillingError::SubscriptionNotFound(msg) => {
                ApiError::NotFound(msg)
            }
            BillingError::PlanNotFound(id) => {
                ApiError::NotFound(format!("Plano {} não encontrado", id))
            }
            BillingError::Forbidden(msg) => ApiError::Forbidden(msg),
            BillingError::AlreadyExists(msg) => ApiError::Conflict(msg),
            BillingError::ProviderApi(msg) => ApiError::ExternalService(msg),
            BillingError::ConfigMissing => ApiError::MissingConfig,
            BillingError::Config(msg) | BillingError::Database(msg) | BillingError::Internal(msg) => {
                tracing::error!(error = %msg, "Billing internal error");
                ApiError::Database(msg)
            }
        }
    }
}

/// Result type alias for API handlers
pub type ApiResult<T> = Result<T, ApiError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_insufficient_credits_status_and_detail() {
        let err = ApiError::InsufficientCredits {
            required: 5,
            available: 3,
        };
        let response = err.into_response();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[test]
    fn test_external_service_is_bad_gateway() {
        let err = ApiError::ExternalService("timeout".to_string());
        let response = err.into_response();
        assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
    }

    #[test]
    fn test_billing_error_mapping() {
        let err: ApiError = BillingError::InsufficientCredits {
            required: 2,
            available: 0,
        }
        .into();
        assert!(matches!(
            err,
            ApiError::InsufficientCredits {
                required: 2,
                available: 0
            }
        ));

        let err: ApiError = BillingError::WebhookSignatureInvalid.into();
        assert!(matches!(err, ApiError::Validation(_)));

        let err: ApiError = BillingError::ConfigMissing.into();
        assert!(matches!(err, ApiError::MissingConfig));
    }
}
