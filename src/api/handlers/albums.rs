use crate::AppState;
use crate::api::error::AppError;
use crate::entities::{albums, files, prelude::*, users};
use axum::{
    Extension, Json,
    body::Body,
    extract::{Path, State},
    http::header,
    response::{IntoResponse, Response},
};
use chrono::Utc;
use sea_orm::sea_query::Expr;
use sea_orm::{
    ActiveModelTrait, ColumnTrait, EntityTrait, PaginatorTrait, QueryFilter, QueryOrder, Set,
};
use serde::Deserialize;
use serde_json::{Value, json};
use std::collections::HashSet;
use tokio_util::io::ReaderStream;
use tracing::info;
use utoipa::ToSchema;

const MAX_ALBUM_NAME_LENGTH: usize = 70;
const MAX_ALBUM_DESCRIPTION_LENGTH: usize = 4000;

#[derive(Deserialize, ToSchema)]
pub struct CreateAlbumRequest {
    pub name: String,
    pub description: Option<String>,
    pub public: Option<bool>,
    pub download: Option<bool>,
}

#[derive(Deserialize, ToSchema)]
pub struct EditAlbumRequest {
    pub id: i64,
    pub name: Option<String>,
    pub description: Option<String>,
    pub public: Option<bool>,
    pub download: Option<bool>,
}

#[derive(Deserialize, ToSchema)]
pub struct RenameAlbumRequest {
    pub id: i64,
    pub name: String,
}

#[derive(Deserialize, ToSchema)]
pub struct AlbumIdRequest {
    pub id: i64,
}

#[derive(Deserialize, ToSchema)]
pub struct DeleteAlbumRequest {
    pub id: i64,
    /// Also delete every file in the album.
    pub purge: Option<bool>,
}

#[derive(Deserialize, ToSchema)]
pub struct AddFilesRequest {
    pub ids: Vec<i64>,
    /// Destination album; null removes the files from their albums.
    pub albumid: Option<i64>,
}

fn validate_album_name(name: &str) -> Result<String, AppError> {
    let name = name.trim().to_string();
    if name.is_empty() || name.len() > MAX_ALBUM_NAME_LENGTH {
        return Err(AppError::BadRequest(format!(
            "Album name must be 1 to {MAX_ALBUM_NAME_LENGTH} characters."
        )));
    }
    Ok(name)
}

/// Per `(user, enabled)` the album name must be unique.
async fn assert_name_free(
    state: &AppState,
    userid: i64,
    name: &str,
    exclude_id: Option<i64>,
) -> Result<(), AppError> {
    let mut select = Albums::find()
        .filter(albums::Column::Userid.eq(userid))
        .filter(albums::Column::Enabled.eq(true))
        .filter(albums::Column::Name.eq(name));
    if let Some(id) = exclude_id {
        select = select.filter(albums::Column::Id.ne(id));
    }
    if select.count(&state.db).await? > 0 {
        return Err(AppError::BadRequest(
            "There is already an album with that name.".to_string(),
        ));
    }
    Ok(())
}

async fn owned_album(
    state: &AppState,
    user: &users::Model,
    id: i64,
) -> Result<albums::Model, AppError> {
    let album = Albums::find_by_id(id)
        .filter(albums::Column::Enabled.eq(true))
        .one(&state.db)
        .await?
        .ok_or_else(|| AppError::NotFound("Album not found.".to_string()))?;
    if album.userid != user.id && !user.is_moderator() {
        return Err(AppError::Forbidden("You do not own this album.".to_string()));
    }
    Ok(album)
}

/// Every mutation funnels through here so `editedAt` stays monotonic and
/// the cached public render and ZIP freshness both react.
async fn touch_album(state: &AppState, album: &albums::Model) -> Result<(), AppError> {
    Albums::update_many()
        .col_expr(albums::Column::EditedAt, Expr::value(Utc::now().timestamp()))
        .filter(albums::Column::Id.eq(album.id))
        .exec(&state.db)
        .await?;
    state.caches.album_render.delete(&album.identifier);
    Ok(())
}

// ---- authenticated album management ----

pub async fn list_albums(
    State(state): State<AppState>,
    Extension(user): Extension<users::Model>,
    page: Option<Path<i64>>,
) -> Result<Json<Value>, AppError> {
    let page = page.map(|p| p.0).unwrap_or(0).max(0) as u64;

    let paginator = Albums::find()
        .filter(albums::Column::Userid.eq(user.id))
        .filter(albums::Column::Enabled.eq(true))
        .order_by_desc(albums::Column::Id)
        .paginate(&state.db, state.config.page_size);
    let count = paginator.num_items().await?;
    let rows = paginator.fetch_page(page).await?;

    let albums: Vec<Value> = rows
        .iter()
        .map(|album| {
            json!({
                "id": album.id,
                "name": album.name,
                "identifier": album.identifier,
                "description": album.description,
                "public": album.public,
                "download": album.download,
                "timestamp": album.timestamp,
                "editedAt": album.edited_at,
                "zipGeneratedAt": album.zip_generated_at,
            })
        })
        .collect();

    Ok(Json(json!({ "success": true, "albums": albums, "count": count })))
}

#[utoipa::path(
    post,
    path = "/api/albums",
    request_body = CreateAlbumRequest,
    responses(
        (status = 200, description = "Album created"),
        (status = 400, description = "Name taken or invalid")
    ),
    security(("token" = []))
)]
pub async fn create_album(
    State(state): State<AppState>,
    Extension(user): Extension<users::Model>,
    Json(req): Json<CreateAlbumRequest>,
) -> Result<Json<Value>, AppError> {
    let name = validate_album_name(&req.name)?;
    assert_name_free(&state, user.id, &name, None).await?;

    let description = req.description.unwrap_or_default();
    if description.len() > MAX_ALBUM_DESCRIPTION_LENGTH {
        return Err(AppError::BadRequest(
            "Album description is too long.".to_string(),
        ));
    }

    let identifier = state
        .ids
        .acquire_album_identifier(&state.db, state.config.album_identifier_length)
        .await?;
    let now = Utc::now().timestamp();

    let album = albums::ActiveModel {
        name: Set(name),
        identifier: Set(identifier.to_string()),
        userid: Set(user.id),
        enabled: Set(true),
        public: Set(req.public.unwrap_or(true)),
        download: Set(req.download.unwrap_or(true)),
        description: Set(description),
        timestamp: Set(now),
        edited_at: Set(now),
        zip_generated_at: Set(0),
        ..Default::default()
    }
    .insert(&state.db)
    .await?;

    state.stats.invalidate_albums();
    info!("Album {} created by {}", album.identifier, user.username);
    Ok(Json(json!({ "success": true, "id": album.id })))
}

#[utoipa::path(
    post,
    path = "/api/albums/edit",
    request_body = EditAlbumRequest,
    responses((status = 200, description = "Album updated")),
    security(("token" = []))
)]
pub async fn edit_album(
    State(state): State<AppState>,
    Extension(user): Extension<users::Model>,
    Json(req): Json<EditAlbumRequest>,
) -> Result<Json<Value>, AppError> {
    let album = owned_album(&state, &user, req.id).await?;

    let mut active: albums::ActiveModel = album.clone().into();
    if let Some(name) = &req.name {
        let name = validate_album_name(name)?;
        assert_name_free(&state, album.userid, &name, Some(album.id)).await?;
        active.name = Set(name);
    }
    if let Some(description) = req.description {
        if description.len() > MAX_ALBUM_DESCRIPTION_LENGTH {
            return Err(AppError::BadRequest(
                "Album description is too long.".to_string(),
            ));
        }
        active.description = Set(description);
    }
    if let Some(public) = req.public {
        active.public = Set(public);
    }
    if let Some(download) = req.download {
        active.download = Set(download);
    }
    active.update(&state.db).await?;

    touch_album(&state, &album).await?;
    Ok(Json(json!({ "success": true })))
}

#[utoipa::path(
    post,
    path = "/api/albums/rename",
    request_body = RenameAlbumRequest,
    responses((status = 200, description = "Album renamed")),
    security(("token" = []))
)]
pub async fn rename_album(
    State(state): State<AppState>,
    Extension(user): Extension<users::Model>,
    Json(req): Json<RenameAlbumRequest>,
) -> Result<Json<Value>, AppError> {
    let album = owned_album(&state, &user, req.id).await?;
    let name = validate_album_name(&req.name)?;
    assert_name_free(&state, album.userid, &name, Some(album.id)).await?;

    let mut active: albums::ActiveModel = album.clone().into();
    active.name = Set(name);
    active.update(&state.db).await?;

    touch_album(&state, &album).await?;
    Ok(Json(json!({ "success": true })))
}

#[utoipa::path(
    post,
    path = "/api/albums/disable",
    request_body = AlbumIdRequest,
    responses((status = 200, description = "Album soft-deleted")),
    security(("token" = []))
)]
pub async fn disable_album(
    State(state): State<AppState>,
    Extension(user): Extension<users::Model>,
    Json(req): Json<AlbumIdRequest>,
) -> Result<Json<Value>, AppError> {
    let album = owned_album(&state, &user, req.id).await?;

    let mut active: albums::ActiveModel = album.clone().into();
    active.enabled = Set(false);
    active.edited_at = Set(Utc::now().timestamp());
    active.update(&state.db).await?;

    let _ = state
        .paths
        .remove_scoped(&state.paths.zip(&album.identifier))
        .await;
    state.caches.album_render.delete(&album.identifier);
    state.stats.invalidate_albums();

    Ok(Json(json!({ "success": true })))
}

#[utoipa::path(
    post,
    path = "/api/albums/delete",
    request_body = DeleteAlbumRequest,
    responses((status = 200, description = "Album deleted")),
    security(("token" = []))
)]
pub async fn delete_album(
    State(state): State<AppState>,
    Extension(user): Extension<users::Model>,
    Json(req): Json<DeleteAlbumRequest>,
) -> Result<Json<Value>, AppError> {
    let album = owned_album(&state, &user, req.id).await?;

    let mut failed: Vec<Value> = Vec::new();
    if req.purge.unwrap_or(false) {
        let member_ids: Vec<i64> = Files::find()
            .filter(files::Column::Albumid.eq(album.id))
            .all(&state.db)
            .await?
            .into_iter()
            .map(|f| f.id)
            .collect();
        if !member_ids.is_empty() {
            failed = state
                .deleter
                .bulk_delete(
                    crate::services::deleter::DeleteSelector::Ids(member_ids),
                    &user,
                )
                .await?;
        }
    } else {
        // The album dies; its files stay, orphaned.
        Files::update_many()
            .col_expr(files::Column::Albumid, Expr::value(Option::<i64>::None))
            .filter(files::Column::Albumid.eq(album.id))
            .exec(&state.db)
            .await?;
    }

    Albums::delete_by_id(album.id).exec(&state.db).await?;
    let _ = state
        .paths
        .remove_scoped(&state.paths.zip(&album.identifier))
        .await;
    state.caches.album_render.delete(&album.identifier);
    state.stats.invalidate_albums();

    info!("Album {} deleted by {}", album.identifier, user.username);
    Ok(Json(json!({ "success": true, "failed": failed })))
}

#[utoipa::path(
    post,
    path = "/api/albums/addfiles",
    request_body = AddFilesRequest,
    responses((status = 200, description = "Files moved")),
    security(("token" = []))
)]
pub async fn add_files(
    State(state): State<AppState>,
    Extension(user): Extension<users::Model>,
    Json(req): Json<AddFilesRequest>,
) -> Result<Json<Value>, AppError> {
    if req.ids.is_empty() {
        return Err(AppError::BadRequest("No files provided.".to_string()));
    }

    if let Some(albumid) = req.albumid {
        owned_album(&state, &user, albumid).await?;
    }

    let mut select = Files::find().filter(files::Column::Id.is_in(req.ids.clone()));
    if !user.is_moderator() {
        select = select.filter(files::Column::Userid.eq(user.id));
    }
    let rows = select.all(&state.db).await?;

    let found: HashSet<i64> = rows.iter().map(|f| f.id).collect();
    let failed: Vec<Value> = req
        .ids
        .iter()
        .filter(|id| !found.contains(id))
        .map(|id| json!(id))
        .collect();

    // Both the previous and the destination albums changed content.
    let mut touched: HashSet<i64> = rows.iter().filter_map(|f| f.albumid).collect();
    if let Some(albumid) = req.albumid {
        touched.insert(albumid);
    }

    if !found.is_empty() {
        Files::update_many()
            .col_expr(files::Column::Albumid, Expr::value(req.albumid))
            .filter(files::Column::Id.is_in(found.iter().copied()))
            .exec(&state.db)
            .await?;
    }

    if !touched.is_empty() {
        Albums::update_many()
            .col_expr(albums::Column::EditedAt, Expr::value(Utc::now().timestamp()))
            .filter(albums::Column::Id.is_in(touched.iter().copied()))
            .exec(&state.db)
            .await?;
        for album in Albums::find()
            .filter(albums::Column::Id.is_in(touched.iter().copied()))
            .all(&state.db)
            .await?
        {
            state.caches.album_render.delete(&album.identifier);
        }
    }

    Ok(Json(json!({ "success": true, "failed": failed })))
}

// ---- public album surface ----

/// Render a public album with its file list, from cache when possible. The
/// hold marker keeps a thundering herd from all hitting the database.
#[utoipa::path(
    get,
    path = "/api/album/get/{identifier}",
    params(("identifier" = String, Path, description = "Album identifier")),
    responses(
        (status = 200, description = "Album with file list"),
        (status = 404, description = "No such public album")
    )
)]
pub async fn get_album(
    State(state): State<AppState>,
    Path(identifier): Path<String>,
) -> Result<Json<Value>, AppError> {
    if let Some(cached) = state.caches.album_render.get(&identifier) {
        return Ok(Json(cached));
    }

    let held = state.caches.album_render.hold(&identifier);
    let result = render_album(&state, &identifier).await;
    match result {
        Ok(render) => {
            if held {
                state.caches.album_render.set(&identifier, render.clone());
            }
            Ok(Json(render))
        }
        Err(e) => {
            if held {
                state.caches.album_render.release(&identifier);
            }
            Err(e)
        }
    }
}

async fn render_album(state: &AppState, identifier: &str) -> Result<Value, AppError> {
    let album = Albums::find()
        .filter(albums::Column::Identifier.eq(identifier))
        .filter(albums::Column::Enabled.eq(true))
        .filter(albums::Column::Public.eq(true))
        .one(&state.db)
        .await?
        .ok_or_else(|| AppError::NotFound("Album not found.".to_string()))?;

    let members = Files::find()
        .filter(files::Column::Albumid.eq(album.id))
        .order_by_desc(files::Column::Id)
        .all(&state.db)
        .await?;

    let files: Vec<Value> = members
        .iter()
        .map(|f| {
            json!({
                "name": f.name,
                "url": state.config.file_url(&f.name),
                "size": f.size,
                "timestamp": f.timestamp,
            })
        })
        .collect();

    Ok(json!({
        "success": true,
        "album": {
            "name": album.name,
            "description": album.description,
            "identifier": album.identifier,
            "download": album.download,
            "editedAt": album.edited_at,
            "count": files.len(),
            "files": files,
        },
    }))
}

/// Stream the album as a ZIP archive. Concurrent requests for a stale album
/// coalesce into one build.
#[utoipa::path(
    get,
    path = "/api/album/zip/{identifier}",
    params(
        ("identifier" = String, Path, description = "Album identifier"),
        ("v" = Option<String>, Query, description = "Cache-busting token, ignored")
    ),
    responses(
        (status = 200, description = "ZIP stream"),
        (status = 403, description = "Not public or downloads disabled"),
        (status = 404, description = "No such album")
    )
)]
pub async fn download_album_zip(
    State(state): State<AppState>,
    Path(identifier): Path<String>,
) -> Result<Response, AppError> {
    let archive = state.zipper.archive(&identifier).await?;

    let file = tokio::fs::File::open(&archive.path).await?;
    let size = file.metadata().await?.len();
    let stream = ReaderStream::new(file);

    // Quotes stripped so the filename cannot break the header.
    let filename: String = archive
        .album_name
        .chars()
        .filter(|c| *c != '"' && !c.is_control())
        .collect();

    Ok((
        [
            (header::CONTENT_TYPE, "application/zip".to_string()),
            (header::CONTENT_LENGTH, size.to_string()),
            (
                header::CONTENT_DISPOSITION,
                format!("attachment; filename=\"{filename}.zip\""),
            ),
        ],
        Body::from_stream(stream),
    )
        .into_response())
}
