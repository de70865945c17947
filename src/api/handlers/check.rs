use crate::AppState;
use crate::api::error::AppError;
use crate::entities::users::permissions;
use axum::{Extension, Json, extract::State};
use serde_json::{Value, json};

/// Server capabilities, used by clients to configure their upload forms.
#[utoipa::path(
    get,
    path = "/api/check",
    responses((status = 200, description = "Server capabilities"))
)]
pub async fn check(State(state): State<AppState>) -> Json<Value> {
    let config = &state.config;
    Json(json!({
        "success": true,
        "private": config.private,
        "enableUserAccounts": config.enable_user_accounts,
        "maxSize": config.max_size,
        "chunkSize": config.chunk_size,
        "fileIdentifierLength": {
            "min": config.file_identifier_min,
            "max": config.file_identifier_max,
            "default": config.file_identifier_length,
        },
        "stripTags": config.strip_tags,
        "temporaryUploadAges": state.retention.periods_for(permissions::USER),
        "defaultTemporaryUploadAge": state.retention.default_for(permissions::USER),
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

/// Admin-only service statistics.
#[utoipa::path(
    get,
    path = "/api/stats",
    responses(
        (status = 200, description = "Service statistics"),
        (status = 403, description = "Not an admin")
    ),
    security(("token" = []))
)]
pub async fn stats(
    State(state): State<AppState>,
    Extension(user): Extension<crate::entities::users::Model>,
) -> Result<Json<Value>, AppError> {
    if !user.is_admin() {
        return Err(AppError::Forbidden(
            "You are not allowed to view the statistics.".to_string(),
        ));
    }
    let stats = state.stats.snapshot(&state.db).await?;
    Ok(Json(json!({ "success": true, "stats": stats })))
}
