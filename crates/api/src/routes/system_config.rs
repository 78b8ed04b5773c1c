//! System configuration routes
//!
//! Config rows are versioned; the `current` pointer moves to the new
//! row transactionally. The request price in credits and the validity
//! window are server-forced, never client-settable.

use axum::{
    extract::{Extension, State},
    http::StatusCode,
    Json,
};
use labcompat_billing::settings::{self, NewConfig};
use labcompat_shared::SystemConfig;
use serde::Deserialize;
use time::format_description::well_known::Rfc3339;
use time::macros::format_description;
use time::{Date, OffsetDateTime};

use crate::auth::AuthUser;
use crate::error::{ApiError, ApiResult};
use crate::state::AppState;

/// GET /config/latest
pub async fn latest_config(State(state): State<AppState>) -> ApiResult<Json<SystemConfig>> {
    let mut conn = state.pool.acquire().await?;
    match settings::current_config(&mut conn).await {
        Ok(config) => Ok(Json(config)),
        Err(labcompat_billing::BillingError::ConfigMissing) => Err(ApiError::NotFound(
            "Nenhuma configuração encontrada".to_string(),
        )),
        Err(e) => Err(ApiError::from(e)),
    }
}

#[derive(Debug, Deserialize)]
pub struct CreateConfigBody {
    pub preco_do_credito_em_centavos: i64,
    pub descricao: Option<String>,
    pub data_estabelecimento: Option<String>,
}

/// POST /config — admin only
pub async fn create_config(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthUser>,
    Json(body): Json<CreateConfigBody>,
) -> ApiResult<(StatusCode, Json<SystemConfig>)> {
    auth.require_admin()?;

    let established_at = match &body.data_estabelecimento {
        Some(raw) => Some(parse_established_at(raw)?),
        None => None,
    };

    let mut tx = state.pool.begin().await?;
    let created = settings::create_config(
        &mut tx,
        NewConfig {
            credit_price_cents: body.preco_do_credito_em_centavos,
            description: body.descricao.clone(),
            established_at,
        },
    )
    .await
    .map_err(ApiError::from)?;
    tx.commit().await?;

    Ok((StatusCode::CREATED, Json(created)))
}

/// Accept an RFC 3339 timestamp or a bare `YYYY-MM-DD` date.
fn parse_established_at(raw: &str) -> Result<OffsetDateTime, ApiError> {
    if let Ok(timestamp) = OffsetDateTime::parse(raw, &Rfc3339) {
        return Ok(timestamp);
    }
    Date::parse(raw, format_description!("[year]-[month]-[day]"))
        .map(|date| date.midnight().assume_utc())
        .map_err(|_| ApiError::Validation("data_estabelecimento inválida".to_string()))
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_established_at() {
        assert!(parse_established_at("2025-10-01").is_ok());
        assert!(parse_established_at("2025-10-01T12:30:00Z").is_ok());
        assert!(parse_established_at("amanhã").is_err());
        assert!(parse_established_at("2025-13-01").is_err());
    }
}
