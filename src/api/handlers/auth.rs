use crate::AppState;
use crate::api::error::AppError;
use crate::api::middleware::auth::client_ip;
use crate::entities::{prelude::*, users};
use crate::utils::auth;
use axum::{
    Extension, Json,
    extract::{ConnectInfo, State},
    http::HeaderMap,
};
use chrono::Utc;
use sea_orm::{ActiveModelTrait, ColumnTrait, EntityTrait, QueryFilter, Set};
use serde::Deserialize;
use serde_json::{Value, json};
use std::net::SocketAddr;
use tracing::info;
use utoipa::ToSchema;

const MIN_PASSWORD_LENGTH: usize = 6;
const MAX_USERNAME_LENGTH: usize = 32;

#[derive(Deserialize, ToSchema)]
pub struct AuthRequest {
    pub username: String,
    pub password: String,
}

#[derive(Deserialize, ToSchema)]
pub struct ChangePasswordRequest {
    pub password: String,
}

#[derive(Deserialize, ToSchema)]
pub struct VerifyTokenRequest {
    pub token: String,
}

fn rate_limit_guard(state: &AppState, ip: &str) -> Result<(), AppError> {
    if !state.auth_limiter.allowed(ip) {
        return Err(AppError::RateLimited(
            "Too many auth failures, try again later.".to_string(),
        ));
    }
    Ok(())
}

#[utoipa::path(
    post,
    path = "/api/login",
    request_body = AuthRequest,
    responses(
        (status = 200, description = "Token issued"),
        (status = 401, description = "Wrong credentials"),
        (status = 429, description = "Rate limited")
    )
)]
pub async fn login(
    State(state): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    Json(req): Json<AuthRequest>,
) -> Result<Json<Value>, AppError> {
    let ip = client_ip(&headers, &addr, state.config.trust_proxy);
    rate_limit_guard(&state, &ip)?;

    let user = Users::find()
        .filter(users::Column::Username.eq(req.username.trim()))
        .one(&state.db)
        .await?;

    let authenticated = match &user {
        Some(user) => user.enabled && auth::verify_password(&req.password, &user.password)?,
        None => false,
    };
    match user {
        Some(user) if authenticated => {
            state.auth_limiter.reset(&ip);
            Ok(Json(json!({ "success": true, "token": user.token })))
        }
        _ => {
            state.auth_limiter.record_failure(&ip);
            Err(AppError::Unauthorized("Wrong credentials.".to_string()))
        }
    }
}

#[utoipa::path(
    post,
    path = "/api/register",
    request_body = AuthRequest,
    responses(
        (status = 200, description = "Account created"),
        (status = 403, description = "Registration disabled"),
        (status = 429, description = "Rate limited")
    )
)]
pub async fn register(
    State(state): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    Json(req): Json<AuthRequest>,
) -> Result<Json<Value>, AppError> {
    let ip = client_ip(&headers, &addr, state.config.trust_proxy);
    rate_limit_guard(&state, &ip)?;

    if !state.config.enable_user_accounts {
        return Err(AppError::Forbidden(
            "Registration is currently disabled.".to_string(),
        ));
    }

    let username = req.username.trim().to_string();
    if username.is_empty() || username.len() > MAX_USERNAME_LENGTH {
        return Err(AppError::BadRequest(format!(
            "Username must be 1 to {MAX_USERNAME_LENGTH} characters."
        )));
    }
    if username.eq_ignore_ascii_case("root") {
        state.auth_limiter.record_failure(&ip);
        return Err(AppError::BadRequest(
            "That username is reserved.".to_string(),
        ));
    }
    if req.password.len() < MIN_PASSWORD_LENGTH {
        return Err(AppError::BadRequest(format!(
            "Password must be at least {MIN_PASSWORD_LENGTH} characters."
        )));
    }

    let existing = Users::find()
        .filter(users::Column::Username.eq(&username))
        .one(&state.db)
        .await?;
    if existing.is_some() {
        state.auth_limiter.record_failure(&ip);
        return Err(AppError::BadRequest("Username already exists.".to_string()));
    }

    let now = Utc::now().timestamp();
    let token = auth::generate_token();
    users::ActiveModel {
        username: Set(username.clone()),
        password: Set(auth::hash_password(&req.password)?),
        token: Set(token.clone()),
        enabled: Set(true),
        permission: Set(users::permissions::USER),
        timestamp: Set(now),
        registration: Set(now),
        ..Default::default()
    }
    .insert(&state.db)
    .await?;

    state.stats.invalidate_users();
    info!("New user registered: {}", username);
    Ok(Json(json!({ "success": true, "token": token })))
}

#[utoipa::path(
    post,
    path = "/api/password/change",
    request_body = ChangePasswordRequest,
    responses((status = 200, description = "Password changed")),
    security(("token" = []))
)]
pub async fn change_password(
    State(state): State<AppState>,
    Extension(user): Extension<users::Model>,
    Json(req): Json<ChangePasswordRequest>,
) -> Result<Json<Value>, AppError> {
    if req.password.len() < MIN_PASSWORD_LENGTH {
        return Err(AppError::BadRequest(format!(
            "Password must be at least {MIN_PASSWORD_LENGTH} characters."
        )));
    }

    let mut active: users::ActiveModel = user.into();
    active.password = Set(auth::hash_password(&req.password)?);
    active.update(&state.db).await?;

    Ok(Json(json!({ "success": true })))
}

#[utoipa::path(
    post,
    path = "/api/tokens/verify",
    request_body = VerifyTokenRequest,
    responses(
        (status = 200, description = "Token is valid"),
        (status = 401, description = "Invalid token"),
        (status = 429, description = "Rate limited")
    )
)]
pub async fn verify_token(
    State(state): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    Json(req): Json<VerifyTokenRequest>,
) -> Result<Json<Value>, AppError> {
    let ip = client_ip(&headers, &addr, state.config.trust_proxy);
    rate_limit_guard(&state, &ip)?;

    let user = Users::find()
        .filter(users::Column::Token.eq(&req.token))
        .filter(users::Column::Enabled.eq(true))
        .one(&state.db)
        .await?;
    let Some(user) = user else {
        state.auth_limiter.record_failure(&ip);
        return Err(AppError::InvalidToken);
    };

    state.auth_limiter.reset(&ip);
    Ok(Json(json!({
        "success": true,
        "username": user.username,
        "group": users::permissions::group_name(user.permission),
        "retentionPeriods": state.retention.periods_for(user.permission),
        "defaultRetentionPeriod": state.retention.default_for(user.permission),
    })))
}

#[utoipa::path(
    post,
    path = "/api/tokens/change",
    responses((status = 200, description = "Token rotated")),
    security(("token" = []))
)]
pub async fn change_token(
    State(state): State<AppState>,
    Extension(user): Extension<users::Model>,
) -> Result<Json<Value>, AppError> {
    let token = auth::generate_token();
    let mut active: users::ActiveModel = user.into();
    active.token = Set(token.clone());
    active.timestamp = Set(Utc::now().timestamp());
    active.update(&state.db).await?;

    Ok(Json(json!({ "success": true, "token": token })))
}
