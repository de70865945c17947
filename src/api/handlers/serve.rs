use crate::AppState;
use crate::api::error::AppError;
use crate::entities::{files, prelude::*};
use axum::{
    body::Body,
    extract::{Path, State},
    http::header,
    response::{IntoResponse, Response},
};
use sea_orm::{ColumnTrait, EntityTrait, QueryFilter};
use tokio_util::io::ReaderStream;

/// Look up the Content-Disposition for a committed upload, caching the
/// original name. The hold marker stops concurrent misses from stacking
/// database lookups for one hot file.
async fn disposition_for(state: &AppState, name: &str) -> Result<String, AppError> {
    if let Some(cached) = state.caches.disposition.get(name) {
        return Ok(cached);
    }

    let held = state.caches.disposition.hold(name);
    let row = Files::find()
        .filter(files::Column::Name.eq(name))
        .one(&state.db)
        .await;

    let row = match row {
        Ok(row) => row,
        Err(e) => {
            if held {
                state.caches.disposition.release(name);
            }
            return Err(e.into());
        }
    };
    let Some(row) = row else {
        if held {
            state.caches.disposition.release(name);
        }
        return Err(AppError::NotFound("File not found.".to_string()));
    };

    let safe_original: String = row
        .original
        .chars()
        .filter(|c| *c != '"' && !c.is_control())
        .collect();
    let disposition = format!("inline; filename=\"{safe_original}\"");
    if held {
        state.caches.disposition.set(name, disposition.clone());
    }
    Ok(disposition)
}

/// Serve a committed upload. Only mounted when `serve_files_with_node` is
/// enabled; otherwise a front-end web server owns the uploads directory.
pub async fn serve_file(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> Result<Response, AppError> {
    // Identifiers are alphanumeric plus an extension; anything else cannot
    // name an upload and must not reach the filesystem.
    if !name
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '.' || c == '-' || c == '_')
        || name.starts_with('.')
    {
        return Err(AppError::NotFound("File not found.".to_string()));
    }

    let disposition = disposition_for(&state, &name).await?;

    let path = state.paths.file(&name);
    let file = match tokio::fs::File::open(&path).await {
        Ok(file) => file,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            return Err(AppError::NotFound("File not found.".to_string()));
        }
        Err(e) => return Err(e.into()),
    };
    let size = file.metadata().await?.len();

    let mime = mime_guess::from_path(&name)
        .first_or_octet_stream()
        .to_string();

    Ok((
        [
            (header::CONTENT_TYPE, mime),
            (header::CONTENT_LENGTH, size.to_string()),
            (header::CONTENT_DISPOSITION, disposition),
        ],
        Body::from_stream(ReaderStream::new(file)),
    )
        .into_response())
}

/// Serve a generated thumbnail.
pub async fn serve_thumb(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> Result<Response, AppError> {
    if !name
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '.')
        || !name.ends_with(".png")
    {
        return Err(AppError::NotFound("Thumbnail not found.".to_string()));
    }

    let path = state.paths.thumbs().join(&name);
    let file = match tokio::fs::File::open(&path).await {
        Ok(file) => file,
        Err(_) => return Err(AppError::NotFound("Thumbnail not found.".to_string())),
    };

    Ok((
        [(header::CONTENT_TYPE, "image/png".to_string())],
        Body::from_stream(ReaderStream::new(file)),
    )
        .into_response())
}
