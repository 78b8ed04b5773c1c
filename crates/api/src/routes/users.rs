//! Balance routes

use std::str::FromStr;

use axum::{
    extract::{Extension, State},
    Json,
};
use labcompat_billing::{ledger, spend, spend::AdjustOperation};
use serde::Deserialize;
use serde_json::{json, Value};

use crate::auth::AuthUser;
use crate::error::{ApiError, ApiResult};
use crate::state::AppState;

/// GET /usuarios/saldo
pub async fn get_balance(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthUser>,
) -> ApiResult<Json<Value>> {
    let mut conn = state.pool.acquire().await?;

    let user: Option<(i64, String)> = sqlx::query_as("SELECT id, name FROM users WHERE id = $1")
        .bind(auth.user_id)
        .fetch_optional(&mut *conn)
        .await?;
    let (id, nome) =
        user.ok_or_else(|| ApiError::NotFound("Usuário não encontrado".to_string()))?;

    let saldo = ledger::compute_balance(&mut conn, id)
        .await
        .map_err(ApiError::from)?;

    Ok(Json(json!({
        "saldo_em_creditos": saldo,
        "user": {"id": id, "nome": nome},
    })))
}

#[derive(Debug, Deserialize)]
pub struct AdjustBalanceBody {
    pub amount: i64,
    #[serde(default = "default_operation")]
    pub operation: String,
    pub target_user_id: Option<i64>,
    pub reason: Option<String>,
}

fn default_operation() -> String {
    "add".to_string()
}

/// PATCH /usuarios/saldo — add/subtract/set, admin-gated for other
/// users and for `set`.
pub async fn adjust_balance(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthUser>,
    Json(body): Json<AdjustBalanceBody>,
) -> ApiResult<Json<Value>> {
    if body.amount < 0 {
        return Err(ApiError::Validation(
            "amount deve ser um inteiro não-negativo".to_string(),
        ));
    }
    let operation = AdjustOperation::from_str(&body.operation).map_err(|_| {
        ApiError::Validation("operation inválida. Use 'add', 'subtract' ou 'set'".to_string())
    })?;

    let target_user_id = body.target_user_id.unwrap_or(auth.user_id);
    if target_user_id != auth.user_id && !auth.is_admin() {
        return Err(ApiError::Forbidden(
            "Permissão negada para modificar saldo de outro usuário".to_string(),
        ));
    }
    if operation == AdjustOperation::Set && !auth.is_admin() {
        return Err(ApiError::Forbidden(
            "Apenas admin pode usar operation 'set'".to_string(),
        ));
    }

    let mut tx = state.pool.begin().await?;

    let target: Option<(i64, String)> = sqlx::query_as("SELECT id, name FROM users WHERE id = $1")
        .bind(target_user_id)
        .fetch_optional(&mut *tx)
        .await?;
    let (id, nome) =
        target.ok_or_else(|| ApiError::NotFound("Usuário alvo não encontrado".to_string()))?;

    let new_balance = spend::adjust(
        &mut tx,
        auth.user_id,
        id,
        operation,
        body.amount,
        body.reason.as_deref(),
    )
    .await
    .map_err(ApiError::from)?;

    tx.commit().await?;

    Ok(Json(json!({
        "success": true,
        "user": {"id": id, "nome": nome, "saldo_em_creditos": new_balance},
    })))
}
