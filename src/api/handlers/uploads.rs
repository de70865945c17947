use crate::AppState;
use crate::api::error::AppError;
use crate::entities::{albums, files, prelude::*, users};
use crate::services::query::{self, CompileOptions};
use axum::{
    Extension, Json,
    extract::{Path, State},
    http::HeaderMap,
};
use sea_orm::sea_query::NullOrdering;
use sea_orm::{ColumnTrait, EntityTrait, PaginatorTrait, QueryFilter, QueryOrder};
use serde_json::{Value, json};

fn header_str<'h>(headers: &'h HeaderMap, name: &str) -> Option<&'h str> {
    headers.get(name).and_then(|v| v.to_str().ok())
}

/// Serialize a file row for a listing, hiding uploader IPs from everyone
/// but moderators.
fn render_file(file: &files::Model, moderator: bool) -> Value {
    let mut value = serde_json::to_value(file).unwrap_or(Value::Null);
    if !moderator
        && let Some(map) = value.as_object_mut()
    {
        map.remove("ip");
    }
    value
}

async fn list(
    state: &AppState,
    user: &users::Model,
    page: i64,
    headers: &HeaderMap,
    album_scope: Option<i64>,
) -> Result<Json<Value>, AppError> {
    let all = header_str(headers, "all") == Some("1");
    if all && !user.is_moderator() {
        return Err(AppError::Forbidden(
            "You are not allowed to list all uploads.".to_string(),
        ));
    }
    let list_all = all && user.is_moderator();

    let opts = CompileOptions {
        moderator: user.is_moderator(),
        list_all,
        scope_userid: (!list_all).then_some(user.id),
        album_scope,
        tz_offset_minutes: header_str(headers, "minoffset")
            .and_then(|v| v.parse().ok())
            .unwrap_or(0),
    };
    let filters = header_str(headers, "filters").unwrap_or_default();
    let compiled = query::compile(&state.db, filters, &opts).await?;

    let mut select = Files::find().filter(compiled.condition);
    for key in &compiled.order {
        select = if key.nulls_last {
            select.order_by_with_nulls(key.column, key.order.clone(), NullOrdering::Last)
        } else {
            select.order_by(key.column, key.order.clone())
        };
    }

    let paginator = select.paginate(&state.db, state.config.page_size);
    let count = paginator.num_items().await?;
    let page = query::resolve_page(page, count, state.config.page_size);
    let rows = paginator.fetch_page(page).await?;

    let files: Vec<Value> = rows
        .iter()
        .map(|f| render_file(f, user.is_moderator()))
        .collect();

    Ok(Json(json!({
        "success": true,
        "files": files,
        "count": count,
        "page": page,
    })))
}

/// Paginated upload listing with filters.
pub async fn list_uploads(
    State(state): State<AppState>,
    Extension(user): Extension<users::Model>,
    page: Option<Path<i64>>,
    headers: HeaderMap,
) -> Result<Json<Value>, AppError> {
    let page = page.map(|p| p.0).unwrap_or(0);
    list(&state, &user, page, &headers, None).await
}

/// Paginated listing of one album's uploads.
#[utoipa::path(
    get,
    path = "/api/album/{albumid}/{page}",
    params(
        ("albumid" = i64, Path, description = "Album id"),
        ("page" = i64, Path, description = "Zero-based page")
    ),
    responses(
        (status = 200, description = "Paginated file list"),
        (status = 404, description = "Album not found")
    ),
    security(("token" = []))
)]
pub async fn list_album_uploads(
    State(state): State<AppState>,
    Extension(user): Extension<users::Model>,
    Path((albumid, page)): Path<(i64, i64)>,
    headers: HeaderMap,
) -> Result<Json<Value>, AppError> {
    let album = Albums::find_by_id(albumid)
        .filter(albums::Column::Enabled.eq(true))
        .one(&state.db)
        .await?
        .ok_or_else(|| AppError::NotFound("Album not found.".to_string()))?;
    if album.userid != user.id && !user.is_moderator() {
        return Err(AppError::Forbidden(
            "You do not own this album.".to_string(),
        ));
    }

    list(&state, &user, page, &headers, Some(albumid)).await
}

/// One file record by public name.
#[utoipa::path(
    get,
    path = "/api/upload/get/{identifier}",
    params(("identifier" = String, Path, description = "Public file name")),
    responses(
        (status = 200, description = "File record"),
        (status = 404, description = "Not found")
    ),
    security(("token" = []))
)]
pub async fn get_upload(
    State(state): State<AppState>,
    Extension(user): Extension<users::Model>,
    Path(identifier): Path<String>,
) -> Result<Json<Value>, AppError> {
    let mut select = Files::find().filter(files::Column::Name.eq(&identifier));
    if !user.is_moderator() {
        select = select.filter(files::Column::Userid.eq(user.id));
    }
    let file = select
        .one(&state.db)
        .await?
        .ok_or_else(|| AppError::NotFound("File not found.".to_string()))?;

    Ok(Json(json!({
        "success": true,
        "file": render_file(&file, user.is_moderator()),
    })))
}
