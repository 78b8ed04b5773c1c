//! Subscription routes: owner→member credit transfer and explicit
//! cancellation.
//!
//! Cancellation talks to the payment provider BEFORE touching local
//! state: a transient provider failure returns 502 and mutates nothing,
//! so local and external truth cannot diverge.

use axum::{
    extract::{Extension, State},
    Json,
};
use labcompat_billing::{spend, subscriptions, CancelOutcome};
use labcompat_shared::{Subscription, SubscriptionStatus, User};
use serde::Deserialize;
use serde_json::{json, Value};

use crate::auth::AuthUser;
use crate::error::{ApiError, ApiResult};
use crate::state::AppState;

const USER_COLUMNS: &str =
    "id, name, email, password_hash, role, subscription_id, has_purchased, created_at";

#[derive(Debug, Deserialize)]
pub struct TransferBody {
    #[serde(rename = "targetUserId")]
    pub target_user_id: Option<i64>,
    pub quantidade: Option<i64>,
}

/// POST /assinaturas/me/contas/transferir
///
/// Only the owner of an Enterprise subscription may transfer, and only
/// to an account linked to that same subscription.
pub async fn transfer_credits(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthUser>,
    Json(body): Json<TransferBody>,
) -> ApiResult<Json<Value>> {
    let quantity = body.quantidade.unwrap_or(0);
    let target_id = body.target_user_id.unwrap_or(0);
    if quantity <= 0 || target_id <= 0 {
        return Err(ApiError::Validation(
            "targetUserId (number) e quantidade (number>0) são obrigatórios".to_string(),
        ));
    }

    let mut conn = state.pool.acquire().await?;

    let requester: Option<User> = sqlx::query_as(&format!(
        "SELECT {} FROM users WHERE id = $1",
        USER_COLUMNS
    ))
    .bind(auth.user_id)
    .fetch_optional(&mut *conn)
    .await?;
    let requester = requester
        .ok_or_else(|| ApiError::NotFound("Usuário solicitante não encontrado".to_string()))?;

    let subscription = match requester.subscription_id {
        Some(sub_id) => subscriptions::find_by_id(&mut conn, sub_id)
            .await
            .map_err(ApiError::from)?,
        None => None,
    };
    let subscription = subscription.ok_or_else(|| {
        ApiError::Forbidden("Acesso negado: requer assinatura com plano 'Enterprise'".to_string())
    })?;

    let plan = subscriptions::find_plan(&mut conn, subscription.plan_id)
        .await
        .map_err(ApiError::from)?;
    if !plan.is_enterprise() {
        return Err(ApiError::Forbidden(
            "Acesso negado: requer assinatura com plano 'Enterprise'".to_string(),
        ));
    }

    if subscription.owner_id != requester.id {
        return Err(ApiError::Forbidden(
            "Apenas o dono da assinatura pode transferir créditos".to_string(),
        ));
    }

    let target: Option<User> = sqlx::query_as(&format!(
        "SELECT {} FROM users WHERE id = $1",
        USER_COLUMNS
    ))
    .bind(target_id)
    .fetch_optional(&mut *conn)
    .await?;
    let target =
        target.ok_or_else(|| ApiError::NotFound("Usuário alvo não encontrado".to_string()))?;

    if target.id == requester.id {
        return Err(ApiError::Validation(
            "Não é permitido transferir para si mesmo".to_string(),
        ));
    }
    if target.subscription_id != Some(subscription.id) {
        return Err(ApiError::Forbidden(
            "Usuário alvo não está vinculado à sua assinatura".to_string(),
        ));
    }
    drop(conn);

    let mut tx = state.pool.begin().await?;
    let outcome = spend::transfer(&mut tx, requester.id, target.id, quantity, subscription.id)
        .await
        .map_err(ApiError::from)?;
    tx.commit().await?;

    Ok(Json(json!({
        "success": true,
        "donoId": subscription.owner_id,
        "transferencia": {
            "quantidade": quantity,
            "data_recebimento": outcome
                .received_at
                .format(&time::format_description::well_known::Rfc3339)
                .unwrap_or_default(),
            "pacote_negativo_id": outcome.debit_packet_id,
            "pacote_positivo_id": outcome.credit_packet_id,
            "targetUserId": target.id,
            "ownerUserId": requester.id,
        },
        "saldo_antes": outcome.balance_before,
        "saldo_depois": outcome.balance_after,
    })))
}

#[derive(Debug, Deserialize)]
pub struct CancelBody {
    #[serde(rename = "assinaturaId")]
    pub assinatura_id: Option<i64>,
    #[serde(rename = "subscriptionId")]
    pub subscription_id: Option<String>,
    #[serde(default = "default_immediate")]
    pub immediate: bool,
}

fn default_immediate() -> bool {
    true
}

/// POST /cancelamentoAssinatura/cancelar
pub async fn cancel_subscription(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthUser>,
    Json(body): Json<CancelBody>,
) -> ApiResult<Json<Value>> {
    if body.assinatura_id.is_none() && body.subscription_id.is_none() {
        return Err(ApiError::Validation(
            "Forneça assinaturaId ou subscriptionId".to_string(),
        ));
    }

    let mut conn = state.pool.acquire().await?;
    let subscription: Option<Subscription> = match (body.assinatura_id, &body.subscription_id) {
        (Some(id), _) => subscriptions::find_by_id(&mut conn, id)
            .await
            .map_err(ApiError::from)?,
        (None, Some(provider_id)) => subscriptions::find_by_provider_id(&mut conn, provider_id)
            .await
            .map_err(ApiError::from)?,
        (None, None) => None,
    };
    let subscription = subscription
        .ok_or_else(|| ApiError::NotFound("Assinatura não encontrada".to_string()))?;

    if subscription.owner_id != auth.user_id {
        return Err(ApiError::Forbidden(
            "Apenas o dono pode cancelar a assinatura".to_string(),
        ));
    }

    // Idempotent: an already-canceled subscription acknowledges without
    // further calls.
    let already_canceled = !subscription.active
        || subscription.status == SubscriptionStatus::Canceled.as_str();
    if already_canceled {
        return Ok(Json(json!({
            "ok": true,
            "note": "already_cancelled_local",
            "assinatura": subscription,
        })));
    }

    // Provider first; local state is only touched after the provider
    // acknowledged (or provably never had the subscription).
    let provider_response: Option<Value> = match &subscription.provider_subscription_id {
        Some(provider_id) => {
            match state
                .payments
                .cancel_subscription(provider_id, body.immediate)
                .await
            {
                Ok(CancelOutcome::Canceled(response)) => Some(response),
                Ok(CancelOutcome::NotFound) => Some(json!({
                    "note": "provider_subscription_not_found",
                    "subscriptionId": provider_id,
                })),
                Err(e) => {
                    tracing::warn!(
                        subscription_id = subscription.id,
                        provider_subscription_id = %provider_id,
                        error = %e,
                        "Provider cancellation failed, local state unchanged"
                    );
                    return Err(ApiError::from(e));
                }
            }
        }
        None => None,
    };

    // Collect member details before unlinking, for the response body.
    let members: Vec<(i64, String, String)> =
        sqlx::query_as("SELECT id, name, email FROM users WHERE subscription_id = $1")
            .bind(subscription.id)
            .fetch_all(&mut *conn)
            .await?;
    drop(conn);

    let mut tx = state.pool.begin().await?;
    subscriptions::mark_canceled(
        &mut tx,
        subscription.id,
        SubscriptionStatus::Canceled.as_str(),
        None,
    )
    .await
    .map_err(ApiError::from)?;
    subscriptions::unlink_members(
        &mut tx,
        subscription.id,
        &format!(
            "Vínculo removido devido ao cancelamento da assinatura {} por usuário {}",
            subscription.id, auth.user_id
        ),
    )
    .await
    .map_err(ApiError::from)?;
    tx.commit().await?;

    let mut conn = state.pool.acquire().await?;
    let updated = subscriptions::find_by_id(&mut conn, subscription.id)
        .await
        .map_err(ApiError::from)?;

    let desvinculados: Vec<Value> = members
        .into_iter()
        .map(|(id, nome, email)| json!({"id": id, "nome": nome, "email": email}))
        .collect();

    Ok(Json(json!({
        "ok": true,
        "note": "cancelled",
        "stripe": provider_response,
        "assinatura": updated,
        "desvinculados": desvinculados,
    })))
}
