use crate::AppState;
use crate::api::error::AppError;
use crate::entities::{prelude::*, users};
use axum::{
    extract::{Request, State},
    http::HeaderMap,
    middleware::Next,
    response::Response,
};
use sea_orm::{ColumnTrait, EntityTrait, QueryFilter};
use std::net::SocketAddr;

/// Resolve the client IP, honoring X-Forwarded-For only when the service is
/// told it sits behind a trusted proxy.
pub fn client_ip(headers: &HeaderMap, addr: &SocketAddr, trust_proxy: bool) -> String {
    if trust_proxy
        && let Some(forwarded) = headers.get("x-forwarded-for").and_then(|v| v.to_str().ok())
        && let Some(first) = forwarded.split(',').next()
    {
        let first = first.trim();
        if !first.is_empty() {
            return first.to_string();
        }
    }
    addr.ip().to_string()
}

/// Look up the user behind a `token` header, if one was sent. A present but
/// unknown token is an error; a missing one is anonymous.
pub async fn optional_user(
    state: &AppState,
    headers: &HeaderMap,
) -> Result<Option<users::Model>, AppError> {
    let Some(token) = headers.get("token").and_then(|v| v.to_str().ok()) else {
        return Ok(None);
    };
    let user = Users::find()
        .filter(users::Column::Token.eq(token))
        .one(&state.db)
        .await?
        .ok_or(AppError::InvalidToken)?;
    if !user.enabled {
        return Err(AppError::Unauthorized(
            "This account has been disabled.".to_string(),
        ));
    }
    Ok(Some(user))
}

/// Layer for routes that always require a valid token. The resolved user is
/// attached as a request extension.
pub async fn auth_middleware(
    State(state): State<AppState>,
    mut req: Request,
    next: Next,
) -> Result<Response, AppError> {
    let user = optional_user(&state, req.headers())
        .await?
        .ok_or(AppError::InvalidToken)?;
    req.extensions_mut().insert(user);
    Ok(next.run(req).await)
}
