//! Payment webhook ingestion
//!
//! The body must reach the verifier byte-for-byte as the provider sent
//! it, so the handler takes the raw string body and the signature
//! header untouched.

use axum::{extract::State, http::HeaderMap, Json};
use serde_json::{json, Value};

use crate::error::{ApiError, ApiResult};
use crate::state::AppState;

pub async fn handle_webhook(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: String,
) -> ApiResult<Json<Value>> {
    tracing::info!("Payment webhook received");

    let signature = headers
        .get("stripe-signature")
        .and_then(|value| value.to_str().ok());

    let ack = state
        .webhooks
        .process(&body, signature)
        .await
        .map_err(ApiError::from)?;

    let mut response = json!({"received": true});
    if let Some(note) = ack.note() {
        response["note"] = json!(note);
    }
    Ok(Json(response))
}
