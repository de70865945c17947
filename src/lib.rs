pub mod api;
pub mod config;
pub mod entities;
pub mod infrastructure;
pub mod services;
pub mod utils;

use crate::config::Config;
use crate::infrastructure::paths::Paths;
use crate::services::chunks::ChunkCoordinator;
use crate::services::deleter::BulkDeleter;
use crate::services::idstore::IdStore;
use crate::services::ingest::IngestEngine;
use crate::services::retention::RetentionPolicy;
use crate::services::stats::StatsService;
use crate::services::zipper::AlbumZipper;
use crate::utils::datastore::Caches;
use crate::utils::ratelimit::AuthRateLimiter;
use axum::{
    Json, Router,
    middleware::from_fn_with_state,
    routing::{get, post},
};
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use utoipa::OpenApi;

#[derive(OpenApi)]
#[openapi(
    paths(
        api::handlers::check::check,
        api::handlers::check::stats,
        api::handlers::auth::login,
        api::handlers::auth::register,
        api::handlers::auth::change_password,
        api::handlers::auth::verify_token,
        api::handlers::auth::change_token,
        api::handlers::upload::finish_chunks,
        api::handlers::upload::delete_upload,
        api::handlers::upload::bulk_delete,
        api::handlers::uploads::list_album_uploads,
        api::handlers::uploads::get_upload,
        api::handlers::albums::create_album,
        api::handlers::albums::edit_album,
        api::handlers::albums::rename_album,
        api::handlers::albums::disable_album,
        api::handlers::albums::delete_album,
        api::handlers::albums::add_files,
        api::handlers::albums::get_album,
        api::handlers::albums::download_album_zip,
    ),
    components(schemas(
        api::handlers::auth::AuthRequest,
        api::handlers::auth::ChangePasswordRequest,
        api::handlers::auth::VerifyTokenRequest,
        api::handlers::upload::UrlUploadRequest,
        api::handlers::upload::FinishChunksRequest,
        api::handlers::upload::DeleteUploadRequest,
        api::handlers::upload::BulkDeleteRequest,
        api::handlers::albums::CreateAlbumRequest,
        api::handlers::albums::EditAlbumRequest,
        api::handlers::albums::RenameAlbumRequest,
        api::handlers::albums::AlbumIdRequest,
        api::handlers::albums::DeleteAlbumRequest,
        api::handlers::albums::AddFilesRequest,
        services::dbwriter::FileEntry,
        services::ingest::FinishChunksFile,
    )),
    tags(
        (name = "auth", description = "Accounts and tokens"),
        (name = "uploads", description = "Upload, list and delete files"),
        (name = "albums", description = "Group uploads into albums")
    )
)]
pub struct ApiDoc;

#[derive(Clone)]
pub struct AppState {
    pub db: sea_orm::DatabaseConnection,
    pub config: Arc<Config>,
    pub paths: Arc<Paths>,
    pub ids: Arc<IdStore>,
    pub chunks: Arc<ChunkCoordinator>,
    pub ingest: Arc<IngestEngine>,
    pub deleter: Arc<BulkDeleter>,
    pub zipper: Arc<AlbumZipper>,
    pub retention: Arc<RetentionPolicy>,
    pub caches: Arc<Caches>,
    pub stats: Arc<StatsService>,
    pub auth_limiter: Arc<AuthRateLimiter>,
}

pub fn create_app(state: AppState) -> Router {
    let auth_layer = from_fn_with_state(state.clone(), api::middleware::auth::auth_middleware);

    // Routes that are reachable without a token; uploads check the token
    // themselves because `private` mode makes it mandatory.
    let public_routes = Router::new()
        .route("/api/check", get(api::handlers::check::check))
        .route("/api/login", post(api::handlers::auth::login))
        .route("/api/register", post(api::handlers::auth::register))
        .route("/api/tokens/verify", post(api::handlers::auth::verify_token))
        .route("/api/upload", post(api::handlers::upload::upload))
        .route("/api/upload/:albumid", post(api::handlers::upload::upload))
        .route(
            "/api/upload/finishchunks",
            post(api::handlers::upload::finish_chunks),
        )
        .route("/api/album/get/:identifier", get(api::handlers::albums::get_album))
        .route(
            "/api/album/zip/:identifier",
            get(api::handlers::albums::download_album_zip),
        )
        .route(
            "/api-docs/openapi.json",
            get(|| async { Json(ApiDoc::openapi()) }),
        );

    let protected_routes = Router::new()
        .route(
            "/api/password/change",
            post(api::handlers::auth::change_password),
        )
        .route("/api/tokens/change", post(api::handlers::auth::change_token))
        .route("/api/upload/delete", post(api::handlers::upload::delete_upload))
        .route(
            "/api/upload/bulkdelete",
            post(api::handlers::upload::bulk_delete),
        )
        .route("/api/uploads", get(api::handlers::uploads::list_uploads))
        .route("/api/uploads/:page", get(api::handlers::uploads::list_uploads))
        .route(
            "/api/album/:albumid/:page",
            get(api::handlers::uploads::list_album_uploads),
        )
        .route(
            "/api/upload/get/:identifier",
            get(api::handlers::uploads::get_upload),
        )
        .route(
            "/api/albums",
            get(api::handlers::albums::list_albums).post(api::handlers::albums::create_album),
        )
        .route("/api/albums/:page", get(api::handlers::albums::list_albums))
        .route("/api/albums/edit", post(api::handlers::albums::edit_album))
        .route("/api/albums/rename", post(api::handlers::albums::rename_album))
        .route(
            "/api/albums/disable",
            post(api::handlers::albums::disable_album),
        )
        .route("/api/albums/delete", post(api::handlers::albums::delete_album))
        .route(
            "/api/albums/addfiles",
            post(api::handlers::albums::add_files),
        )
        .route("/api/stats", get(api::handlers::check::stats))
        .layer(auth_layer);

    let mut router = Router::new().merge(public_routes).merge(protected_routes);

    if state.config.serve_files_with_node {
        router = router
            .route("/thumbs/:name", get(api::handlers::serve::serve_thumb))
            .route("/:name", get(api::handlers::serve::serve_file));
    }

    let cors = if state.config.allowed_origins.iter().any(|o| o == "*") {
        CorsLayer::new()
            .allow_origin(Any)
            .allow_methods(Any)
            .allow_headers(Any)
    } else {
        let origins: Vec<axum::http::HeaderValue> = state
            .config
            .allowed_origins
            .iter()
            .filter_map(|s| s.parse().ok())
            .collect();
        CorsLayer::new()
            .allow_origin(origins)
            .allow_methods(Any)
            .allow_headers(Any)
    };

    router
        .layer(axum::extract::DefaultBodyLimit::max(
            state.config.max_size as usize + 10 * 1024 * 1024,
        ))
        .layer(cors)
        .with_state(state)
}
