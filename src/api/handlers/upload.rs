use crate::AppState;
use crate::api::error::AppError;
use crate::api::middleware::auth::{client_ip, optional_user};
use crate::entities::users;
use crate::services::ingest::{FinishChunksFile, IngestOutcome, UploadContext};
use axum::{
    Json,
    extract::{ConnectInfo, FromRequest, Multipart, Path, Request, State},
    http::{HeaderMap, header},
};
use serde::Deserialize;
use serde_json::{Value, json};
use std::net::SocketAddr;
use utoipa::ToSchema;

#[derive(Deserialize, ToSchema)]
pub struct UrlUploadRequest {
    pub urls: Vec<String>,
}

#[derive(Deserialize, ToSchema)]
pub struct FinishChunksRequest {
    pub files: Vec<FinishChunksFile>,
}

#[derive(Deserialize, ToSchema)]
pub struct DeleteUploadRequest {
    pub id: i64,
}

#[derive(Deserialize, ToSchema)]
pub struct BulkDeleteRequest {
    pub field: String,
    pub values: Vec<Value>,
}

fn header_str<'h>(headers: &'h HeaderMap, name: &str) -> Option<&'h str> {
    headers.get(name).and_then(|v| v.to_str().ok())
}

/// Build the request-scoped upload context from headers. Uploads require a
/// token only when the service runs private.
async fn upload_context(
    state: &AppState,
    headers: &HeaderMap,
    addr: &SocketAddr,
    albumid: Option<i64>,
) -> Result<UploadContext, AppError> {
    let user = optional_user(state, headers).await?;
    if state.config.private && user.is_none() {
        return Err(AppError::Unauthorized("No token provided.".to_string()));
    }

    let albumid = albumid.or_else(|| header_str(headers, "albumid").and_then(|v| v.parse().ok()));
    if albumid.is_some() && user.is_none() {
        return Err(AppError::Unauthorized(
            "Only registered users may upload to albums.".to_string(),
        ));
    }

    Ok(UploadContext {
        ip: client_ip(headers, addr, state.config.trust_proxy),
        user,
        albumid,
        age: header_str(headers, "age").and_then(|v| v.parse().ok()),
        filelength: header_str(headers, "filelength").and_then(|v| v.parse().ok()),
        strip_tags: header_str(headers, "striptags") == Some("1"),
    })
}

/// Upload files: `multipart/form-data` for direct uploads and chunks, JSON
/// `{urls: [...]}` for remote fetches.
pub async fn upload(
    State(state): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    albumid: Option<Path<i64>>,
    req: Request,
) -> Result<Json<Value>, AppError> {
    let headers = req.headers().clone();
    let ctx = upload_context(&state, &headers, &addr, albumid.map(|p| p.0)).await?;

    let content_type = header_str(&headers, header::CONTENT_TYPE.as_str()).unwrap_or_default();
    if content_type.starts_with("multipart/form-data") {
        let multipart = Multipart::from_request(req, &state)
            .await
            .map_err(|e| AppError::BadRequest(e.to_string()))?;
        match state.ingest.ingest_multipart(&ctx, multipart).await? {
            IngestOutcome::ChunkAck => Ok(Json(json!({ "success": true }))),
            IngestOutcome::Committed(files) => {
                Ok(Json(json!({ "success": true, "files": files })))
            }
        }
    } else {
        let bytes = axum::body::to_bytes(req.into_body(), 1024 * 1024)
            .await
            .map_err(|e| AppError::BadRequest(e.to_string()))?;
        let body: UrlUploadRequest = serde_json::from_slice(&bytes)
            .map_err(|_| AppError::BadRequest("Malformed JSON body.".to_string()))?;
        let files = state.ingest.ingest_urls(&ctx, body.urls).await?;
        Ok(Json(json!({ "success": true, "files": files })))
    }
}

/// Assemble previously uploaded chunks into committed files.
#[utoipa::path(
    post,
    path = "/api/upload/finishchunks",
    request_body = FinishChunksRequest,
    responses(
        (status = 200, description = "Chunks assembled"),
        (status = 400, description = "Invalid chunks")
    )
)]
pub async fn finish_chunks(
    State(state): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    Json(req): Json<FinishChunksRequest>,
) -> Result<Json<Value>, AppError> {
    let ctx = upload_context(&state, &headers, &addr, None).await?;
    let files = state.ingest.finish_chunked(&ctx, req.files).await?;
    Ok(Json(json!({ "success": true, "files": files })))
}

/// Delete one upload by row id.
#[utoipa::path(
    post,
    path = "/api/upload/delete",
    request_body = DeleteUploadRequest,
    responses((status = 200, description = "Deletion attempted")),
    security(("token" = []))
)]
pub async fn delete_upload(
    State(state): State<AppState>,
    axum::Extension(user): axum::Extension<users::Model>,
    Json(req): Json<DeleteUploadRequest>,
) -> Result<Json<Value>, AppError> {
    let failed = state
        .deleter
        .bulk_delete(
            crate::services::deleter::DeleteSelector::Ids(vec![req.id]),
            &user,
        )
        .await?;
    Ok(Json(json!({ "success": true, "failed": failed })))
}

/// Delete many uploads by id or by public name. Partial failures are
/// reported in `failed`, the response itself stays 200.
#[utoipa::path(
    post,
    path = "/api/upload/bulkdelete",
    request_body = BulkDeleteRequest,
    responses((status = 200, description = "Deletion attempted")),
    security(("token" = []))
)]
pub async fn bulk_delete(
    State(state): State<AppState>,
    axum::Extension(user): axum::Extension<users::Model>,
    Json(req): Json<BulkDeleteRequest>,
) -> Result<Json<Value>, AppError> {
    let selector = match req.field.as_str() {
        "id" => {
            let ids: Vec<i64> = req
                .values
                .iter()
                .filter_map(|v| v.as_i64())
                .collect();
            if ids.len() != req.values.len() {
                return Err(AppError::BadRequest(
                    "All values must be numeric ids.".to_string(),
                ));
            }
            crate::services::deleter::DeleteSelector::Ids(ids)
        }
        "name" => {
            let names: Vec<String> = req
                .values
                .iter()
                .filter_map(|v| v.as_str().map(|s| s.to_string()))
                .collect();
            if names.len() != req.values.len() {
                return Err(AppError::BadRequest(
                    "All values must be names.".to_string(),
                ));
            }
            crate::services::deleter::DeleteSelector::Names(names)
        }
        other => {
            return Err(AppError::BadRequest(format!(
                "Invalid delete field: {other}."
            )));
        }
    };

    let failed = state.deleter.bulk_delete(selector, &user).await?;
    Ok(Json(json!({ "success": true, "failed": failed })))
}
