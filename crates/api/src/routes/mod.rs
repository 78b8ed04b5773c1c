//! API routes

pub mod health;
pub mod requests;
pub mod subscriptions;
pub mod system_config;
pub mod users;
pub mod webhook;

use axum::{
    middleware,
    routing::{get, post},
    Router,
};

use crate::auth::require_auth;
use crate::state::AppState;

/// Build the application router
pub fn create_router(state: AppState) -> Router {
    let public = Router::new()
        .route("/health", get(health::health))
        .route("/webhook", post(webhook::handle_webhook));

    let authenticated = Router::new()
        .route(
            "/solicitacoes",
            post(requests::create_request).get(requests::list_requests),
        )
        .route("/solicitacoes/todas", get(requests::list_all_requests))
        .route("/solicitacoes/:id/vincular", post(requests::attach_result))
        .route(
            "/usuarios/saldo",
            get(users::get_balance).patch(users::adjust_balance),
        )
        .route(
            "/assinaturas/me/contas/transferir",
            post(subscriptions::transfer_credits),
        )
        .route(
            "/cancelamentoAssinatura/cancelar",
            post(subscriptions::cancel_subscription),
        )
        .route("/config/latest", get(system_config::latest_config))
        .route("/config", post(system_config::create_config))
        .route_layer(middleware::from_fn_with_state(state.clone(), require_auth));

    public.merge(authenticated).with_state(state)
}
