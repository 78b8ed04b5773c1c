//! Analysis request routes
//!
//! Creating a request debits exactly the configured credit price inside
//! the same transaction as the request insert: if the balance is
//! insufficient, neither row is created.

use std::collections::{BTreeMap, HashMap};

use axum::{
    extract::{Extension, Path, State},
    http::StatusCode,
    Json,
};
use labcompat_billing::{ledger, settings, spend, subscriptions, Notification};
use labcompat_shared::{AnalysisRequest, Plan, Product, RequestStatus, Subscription, User};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::auth::AuthUser;
use crate::error::{ApiError, ApiResult};
use crate::state::AppState;

const REQUEST_COLUMNS: &str = "id, user_id, chemical_product_id, biological_product_id, \
     priority, status, final_result, result_notes, requested_at, resulted_at";

const USER_COLUMNS: &str =
    "id, name, email, password_hash, role, subscription_id, has_purchased, created_at";

/// Request body: ids preferred, names accepted for older clients
#[derive(Debug, Deserialize)]
pub struct CreateRequestBody {
    pub id_produto_quimico: Option<i64>,
    pub id_produto_biologico: Option<i64>,
    pub nome_produto_quimico: Option<String>,
    pub nome_produto_biologico: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct UserSummary {
    pub id: i64,
    pub nome: String,
    pub email: String,
}

/// A request enriched with the product names clients expect at the top
/// level
#[derive(Debug, Serialize)]
pub struct RequestView {
    #[serde(flatten)]
    pub request: AnalysisRequest,
    pub nome_produto_quimico: Option<String>,
    pub nome_produto_biologico: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub usuario: Option<UserSummary>,
}

#[derive(Debug, Serialize)]
pub struct CreateRequestResponse {
    pub solicitacao: RequestView,
    pub custo_em_creditos: i64,
    pub saldo_antes: i64,
    pub saldo_depois: i64,
}

/// POST /solicitacoes
pub async fn create_request(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthUser>,
    Json(body): Json<CreateRequestBody>,
) -> ApiResult<(StatusCode, Json<CreateRequestResponse>)> {
    let has_ids = body.id_produto_quimico.is_some() && body.id_produto_biologico.is_some();
    let has_names = body.nome_produto_quimico.is_some() && body.nome_produto_biologico.is_some();
    if !has_ids && !has_names {
        return Err(ApiError::Validation(
            "Forneça id_produto_quimico & id_produto_biologico OU \
             nome_produto_quimico & nome_produto_biologico"
                .to_string(),
        ));
    }

    let mut conn = state.pool.acquire().await?;

    let chemical = resolve_product(
        &mut conn,
        body.id_produto_quimico,
        body.nome_produto_quimico.as_deref(),
        "químico",
    )
    .await?;
    let biological = resolve_product(
        &mut conn,
        body.id_produto_biologico,
        body.nome_produto_biologico.as_deref(),
        "biológico",
    )
    .await?;

    let user = find_user(&mut conn, auth.user_id).await?;
    let priority = match current_subscription_plan(&mut conn, &user).await? {
        Some((_, plan)) => plan.time_priority,
        None => 0,
    };

    let config = settings::current_config(&mut conn)
        .await
        .map_err(ApiError::from)?;
    let price = config.request_price_credits;
    drop(conn);

    let mut tx = state.pool.begin().await?;

    let created: AnalysisRequest = sqlx::query_as(&format!(
        r#"
        INSERT INTO analysis_requests
            (user_id, chemical_product_id, biological_product_id, priority, status)
        VALUES ($1, $2, $3, $4, $5)
        RETURNING {}
        "#,
        REQUEST_COLUMNS
    ))
    .bind(user.id)
    .bind(chemical.id)
    .bind(biological.id)
    .bind(priority)
    .bind(RequestStatus::EmAndamento.to_string())
    .fetch_one(&mut *tx)
    .await?;

    let (saldo_antes, saldo_depois) = if price > 0 {
        let origin = format!("consumo_solicitacao:{}", created.id);
        let outcome = spend::debit_for(&mut tx, user.id, price, &origin)
            .await
            .map_err(ApiError::from)?;
        (outcome.balance_before, outcome.balance_after)
    } else {
        let balance = ledger::compute_balance(&mut tx, user.id)
            .await
            .map_err(ApiError::from)?;
        (balance, balance)
    };

    tx.commit().await?;

    let view = RequestView {
        request: created,
        nome_produto_quimico: Some(chemical.name),
        nome_produto_biologico: Some(biological.name),
        usuario: None,
    };

    Ok((
        StatusCode::CREATED,
        Json(CreateRequestResponse {
            solicitacao: view,
            custo_em_creditos: price,
            saldo_antes,
            saldo_depois,
        }),
    ))
}

/// GET /solicitacoes — the caller's requests; Enterprise members see
/// every request under their subscription.
pub async fn list_requests(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthUser>,
) -> ApiResult<Json<Vec<RequestView>>> {
    let mut conn = state.pool.acquire().await?;
    let user = find_user(&mut conn, auth.user_id).await?;

    let subscription = current_subscription_plan(&mut conn, &user).await?;
    let enterprise = subscription
        .as_ref()
        .map(|(_, plan)| plan.is_enterprise())
        .unwrap_or(false);

    let requests: Vec<AnalysisRequest> = if enterprise {
        let (sub, _) = subscription.as_ref().ok_or(ApiError::Internal)?;
        let mut ids: Vec<i64> = sqlx::query_as::<_, (i64,)>(
            "SELECT id FROM users WHERE subscription_id = $1",
        )
        .bind(sub.id)
        .fetch_all(&mut *conn)
        .await?
        .into_iter()
        .map(|(id,)| id)
        .collect();
        ids.push(user.id);
        ids.push(sub.owner_id);
        ids.sort_unstable();
        ids.dedup();

        sqlx::query_as(&format!(
            "SELECT {} FROM analysis_requests WHERE user_id = ANY($1) ORDER BY requested_at DESC",
            REQUEST_COLUMNS
        ))
        .bind(&ids)
        .fetch_all(&mut *conn)
        .await?
    } else {
        sqlx::query_as(&format!(
            "SELECT {} FROM analysis_requests WHERE user_id = $1 ORDER BY requested_at DESC",
            REQUEST_COLUMNS
        ))
        .bind(user.id)
        .fetch_all(&mut *conn)
        .await?
    };

    let views = enrich(&mut conn, requests, enterprise).await?;
    Ok(Json(views))
}

/// GET /solicitacoes/todas — admin listing grouped by priority, most
/// recent first within each group.
pub async fn list_all_requests(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthUser>,
) -> ApiResult<Json<BTreeMap<String, Vec<RequestView>>>> {
    auth.require_admin()?;

    let mut conn = state.pool.acquire().await?;
    let requests: Vec<AnalysisRequest> = sqlx::query_as(&format!(
        "SELECT {} FROM analysis_requests ORDER BY priority ASC, requested_at DESC",
        REQUEST_COLUMNS
    ))
    .fetch_all(&mut *conn)
    .await?;

    let views = enrich(&mut conn, requests, true).await?;

    let mut grouped: BTreeMap<String, Vec<RequestView>> = BTreeMap::new();
    for view in views {
        grouped
            .entry(view.request.priority.to_string())
            .or_default()
            .push(view);
    }
    Ok(Json(grouped))
}

#[derive(Debug, Deserialize)]
pub struct AttachResultBody {
    pub resultado_final: Option<String>,
    pub descricao_resultado: Option<String>,
}

/// POST /solicitacoes/:id/vincular — admin attaches the result. The
/// only operation allowed to mutate a request, exactly once in its
/// lifecycle.
pub async fn attach_result(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthUser>,
    Path(id): Path<i64>,
    Json(body): Json<AttachResultBody>,
) -> ApiResult<Json<Value>> {
    auth.require_admin()?;

    let final_result = body
        .resultado_final
        .as_deref()
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .ok_or_else(|| {
            ApiError::Validation(
                "Campo 'resultado_final' é obrigatório e deve ser uma string não vazia"
                    .to_string(),
            )
        })?;

    let updated: Option<AnalysisRequest> = sqlx::query_as(&format!(
        r#"
        UPDATE analysis_requests SET
            final_result = $2,
            result_notes = $3,
            status = $4,
            resulted_at = NOW()
        WHERE id = $1
        RETURNING {}
        "#,
        REQUEST_COLUMNS
    ))
    .bind(id)
    .bind(final_result)
    .bind(&body.descricao_resultado)
    .bind(RequestStatus::Finalizado.to_string())
    .fetch_optional(&state.pool)
    .await?;

    let updated =
        updated.ok_or_else(|| ApiError::NotFound("Solicitação não encontrada".to_string()))?;

    let mut conn = state.pool.acquire().await?;
    let requester = find_user(&mut conn, updated.user_id).await.ok();
    let names = product_names(
        &mut conn,
        &[updated.chemical_product_id, updated.biological_product_id],
    )
    .await?;
    drop(conn);

    let chemical_name = names
        .get(&updated.chemical_product_id)
        .cloned()
        .unwrap_or_else(|| "N/A".to_string());
    let biological_name = names
        .get(&updated.biological_product_id)
        .cloned()
        .unwrap_or_else(|| "N/A".to_string());

    // Best-effort result notice; the result content itself is never
    // emailed.
    if let Some(requester) = &requester {
        state
            .email
            .send(&Notification::result_available(
                &requester.email,
                &requester.name,
                updated.id,
                &chemical_name,
                &biological_name,
            ))
            .await;
    }

    let view = RequestView {
        request: updated,
        nome_produto_quimico: Some(chemical_name),
        nome_produto_biologico: Some(biological_name),
        usuario: None,
    };

    Ok(Json(json!({
        "message": "Resultado vinculado com sucesso",
        "solicitacao": view,
    })))
}

// =============================================================================
// Helpers
// =============================================================================

async fn resolve_product(
    conn: &mut sqlx::PgConnection,
    id: Option<i64>,
    name: Option<&str>,
    label: &str,
) -> ApiResult<Product> {
    const PRODUCT_COLUMNS: &str = "id, name, kind, gender, created_at";

    if let Some(id) = id {
        let product: Option<Product> = sqlx::query_as(&format!(
            "SELECT {} FROM products WHERE id = $1",
            PRODUCT_COLUMNS
        ))
        .bind(id)
        .fetch_optional(&mut *conn)
        .await?;
        return product.ok_or_else(|| {
            ApiError::Validation(format!("Produto {} id '{}' não encontrado", label, id))
        });
    }

    if let Some(name) = name {
        let product: Option<Product> = sqlx::query_as(&format!(
            "SELECT {} FROM products WHERE name = $1",
            PRODUCT_COLUMNS
        ))
        .bind(name)
        .fetch_optional(&mut *conn)
        .await?;
        return product.ok_or_else(|| {
            ApiError::Validation(format!("Produto {} '{}' não encontrado", label, name))
        });
    }

    Err(ApiError::Validation(format!(
        "Não foi possível resolver o produto {}",
        label
    )))
}

async fn find_user(conn: &mut sqlx::PgConnection, user_id: i64) -> ApiResult<User> {
    let user: Option<User> = sqlx::query_as(&format!(
        "SELECT {} FROM users WHERE id = $1",
        USER_COLUMNS
    ))
    .bind(user_id)
    .fetch_optional(&mut *conn)
    .await?;
    user.ok_or_else(|| ApiError::NotFound("Usuário não encontrado".to_string()))
}

/// The subscription governing a user: the one they are linked to as a
/// member, else their own newest active one.
async fn current_subscription_plan(
    conn: &mut sqlx::PgConnection,
    user: &User,
) -> ApiResult<Option<(Subscription, Plan)>> {
    let subscription = match user.subscription_id {
        Some(sub_id) => subscriptions::find_by_id(conn, sub_id)
            .await
            .map_err(ApiError::from)?,
        None => {
            const SUBSCRIPTION_COLUMNS: &str =
                "id, owner_id, plan_id, active, provider_subscription_id, provider_customer_id, \
                 provider_price_id, status, current_period_end, cancel_at_period_end, \
                 canceled_at, created_at";
            sqlx::query_as(&format!(
                "SELECT {} FROM subscriptions WHERE owner_id = $1 AND active \
                 ORDER BY id DESC LIMIT 1",
                SUBSCRIPTION_COLUMNS
            ))
            .bind(user.id)
            .fetch_optional(&mut *conn)
            .await?
        }
    };

    match subscription {
        Some(sub) => {
            let plan = subscriptions::find_plan(conn, sub.plan_id)
                .await
                .map_err(ApiError::from)?;
            Ok(Some((sub, plan)))
        }
        None => Ok(None),
    }
}

async fn product_names(
    conn: &mut sqlx::PgConnection,
    ids: &[i64],
) -> ApiResult<HashMap<i64, String>> {
    let rows: Vec<(i64, String)> =
        sqlx::query_as("SELECT id, name FROM products WHERE id = ANY($1)")
            .bind(ids)
            .fetch_all(&mut *conn)
            .await?;
    Ok(rows.into_iter().collect())
}

/// Attach top-level product names (and user summaries when requested)
/// to a batch of requests.
async fn enrich(
    conn: &mut sqlx::PgConnection,
    requests: Vec<AnalysisRequest>,
    with_users: bool,
) -> ApiResult<Vec<RequestView>> {
    let mut product_ids: Vec<i64> = requests
        .iter()
        .flat_map(|r| [r.chemical_product_id, r.biological_product_id])
        .collect();
    product_ids.sort_unstable();
    product_ids.dedup();
    let names = product_names(conn, &product_ids).await?;

    let users: HashMap<i64, UserSummary> = if with_users {
        let mut user_ids: Vec<i64> = requests.iter().map(|r| r.user_id).collect();
        user_ids.sort_unstable();
        user_ids.dedup();
        let rows: Vec<(i64, String, String)> =
            sqlx::query_as("SELECT id, name, email FROM users WHERE id = ANY($1)")
                .bind(&user_ids)
                .fetch_all(&mut *conn)
                .await?;
        rows.into_iter()
            .map(|(id, nome, email)| (id, UserSummary { id, nome, email }))
            .collect()
    } else {
        HashMap::new()
    };

    Ok(requests
        .into_iter()
        .map(|request| {
            let usuario = users.get(&request.user_id).map(|u| UserSummary {
                id: u.id,
                nome: u.nome.clone(),
                email: u.email.clone(),
            });
            RequestView {
                nome_produto_quimico: names.get(&request.chemical_product_id).cloned(),
                nome_produto_biologico: names.get(&request.biological_product_id).cloned(),
                usuario,
                request,
            }
        })
        .collect())
}
