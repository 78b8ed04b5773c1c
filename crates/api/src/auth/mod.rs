//! Authentication middleware
//!
//! Verifies the bearer credential and injects the resulting identity
//! into the request extensions.

pub mod jwt;

use axum::{
    extract::{Request, State},
    http::header,
    middleware::Next,
    response::Response,
};
use labcompat_shared::UserRole;

use crate::error::ApiError;
use crate::state::AppState;

/// Authenticated identity attached to each request
#[derive(Debug, Clone)]
pub struct AuthUser {
    pub user_id: i64,
    pub role: UserRole,
    pub email: Option<String>,
}

impl AuthUser {
    pub fn is_admin(&self) -> bool {
        self.role.is_admin()
    }

    pub fn require_admin(&self) -> Result<(), ApiError> {
        if self.is_admin() {
            Ok(())
        } else {
            Err(ApiError::Forbidden("Permissão negada".to_string()))
        }
    }
}

/// Middleware: verify the Authorization header and attach `AuthUser`
pub async fn require_auth(
    State(state): State<AppState>,
    mut request: Request,
    next: Next,
) -> Result<Response, ApiError> {
    let token = request
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix("Bearer "))
        .ok_or(ApiError::Unauthorized)?;

    let claims = jwt::verify_token(token, &state.config.jwt_secret)?;

    let user = AuthUser {
        user_id: claims.sub,
        role: UserRole::from_str_lossy(claims.role.as_deref().unwrap_or("user")),
        email: claims.email,
    };
    request.extensions_mut().insert(user);

    Ok(next.run(request).await)
}
