use axum::Router;
use axum::body::Body;
use axum::extract::connect_info::MockConnectInfo;
use axum::http::{Request, Response, StatusCode};
use http_body_util::BodyExt;
use sea_orm::{ActiveModelTrait, Set};
use serde_json::Value;
use stashbin::config::Config;
use stashbin::entities::users;
use stashbin::infrastructure::{database, paths::Paths};
use stashbin::services::cdn::CdnPurger;
use stashbin::services::chunks::ChunkCoordinator;
use stashbin::services::dbwriter::DbWriter;
use stashbin::services::deleter::BulkDeleter;
use stashbin::services::idstore::IdStore;
use stashbin::services::ingest::IngestEngine;
use stashbin::services::retention::RetentionPolicy;
use stashbin::services::scanner::Scanner;
use stashbin::services::stats::StatsService;
use stashbin::services::sweeper::RetentionSweeper;
use stashbin::services::zipper::AlbumZipper;
use stashbin::utils::auth;
use stashbin::utils::datastore::Caches;
use stashbin::utils::ratelimit::AuthRateLimiter;
use stashbin::{AppState, create_app};
use std::net::SocketAddr;
use std::sync::Arc;
use tower::ServiceExt;

pub struct TestApp {
    pub app: Router,
    pub state: AppState,
    pub sweeper: Arc<RetentionSweeper>,
    // Held so the uploads root outlives the test.
    _tmp: tempfile::TempDir,
}

pub async fn spawn_app(config: Config, scanner: Arc<dyn Scanner>) -> TestApp {
    let tmp = tempfile::tempdir().unwrap();
    let config = Arc::new(Config {
        uploads_root: tmp.path().to_str().unwrap().to_string(),
        ..config
    });

    let db = sea_orm::Database::connect("sqlite::memory:").await.unwrap();
    database::run_migrations(&db).await.unwrap();

    let paths = Arc::new(Paths::new(&config.uploads_root));
    paths.init().await.unwrap();

    let caches = Caches::new();
    let stats = StatsService::new();
    let ids = IdStore::new(config.id_max_tries);
    let retention = Arc::new(RetentionPolicy::from_config(&config));
    let cdn = CdnPurger::new(Arc::clone(&config));
    let chunks = ChunkCoordinator::new(Arc::clone(&paths), Arc::clone(&config));
    let deleter = BulkDeleter::new(
        db.clone(),
        Arc::clone(&config),
        Arc::clone(&paths),
        Arc::clone(&caches),
        cdn,
        Arc::clone(&stats),
    );
    let writer = DbWriter::new(
        db.clone(),
        Arc::clone(&config),
        Arc::clone(&paths),
        Arc::clone(&caches),
        Arc::clone(&stats),
    );
    let ingest = IngestEngine::new(
        db.clone(),
        Arc::clone(&config),
        Arc::clone(&paths),
        Arc::clone(&ids),
        Arc::clone(&chunks),
        scanner,
        Arc::clone(&retention),
        writer,
    )
    .unwrap();
    let zipper = AlbumZipper::new(db.clone(), Arc::clone(&config), Arc::clone(&paths));
    let sweeper = RetentionSweeper::new(db.clone(), Arc::clone(&deleter), 60);

    let state = AppState {
        db,
        config,
        paths,
        ids,
        chunks,
        ingest,
        deleter,
        zipper,
        retention,
        caches,
        stats,
        auth_limiter: Arc::new(AuthRateLimiter::new()),
    };

    let app = create_app(state.clone())
        .layer(MockConnectInfo(SocketAddr::from(([127, 0, 0, 1], 52000))));

    TestApp {
        app,
        state,
        sweeper,
        _tmp: tmp,
    }
}

pub async fn seed_user(state: &AppState, username: &str, permission: i32) -> users::Model {
    users::ActiveModel {
        username: Set(username.to_string()),
        password: Set(auth::hash_password("hunter22").unwrap()),
        token: Set(auth::generate_token()),
        enabled: Set(true),
        permission: Set(permission),
        timestamp: Set(0),
        registration: Set(0),
        ..Default::default()
    }
    .insert(&state.db)
    .await
    .unwrap()
}

pub async fn send(app: &Router, request: Request<Body>) -> (StatusCode, Value) {
    let response: Response<_> = app.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    let json = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
    (status, json)
}

pub async fn send_raw(app: &Router, request: Request<Body>) -> (StatusCode, Vec<u8>) {
    let response: Response<_> = app.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    (status, bytes.to_vec())
}

pub const BOUNDARY: &str = "------------------------stashbintestboundary";

/// Build a `multipart/form-data` body by hand: text fields first, then file
/// parts, matching how real upload clients order them.
pub fn multipart_body(
    fields: &[(&str, &str)],
    files: &[(&str, &str, &str, &[u8])],
) -> (String, Vec<u8>) {
    let mut body = Vec::new();
    for (name, value) in fields {
        body.extend_from_slice(format!("--{BOUNDARY}\r\n").as_bytes());
        body.extend_from_slice(
            format!("Content-Disposition: form-data; name=\"{name}\"\r\n\r\n").as_bytes(),
        );
        body.extend_from_slice(value.as_bytes());
        body.extend_from_slice(b"\r\n");
    }
    for (name, filename, content_type, data) in files {
        body.extend_from_slice(format!("--{BOUNDARY}\r\n").as_bytes());
        body.extend_from_slice(
            format!(
                "Content-Disposition: form-data; name=\"{name}\"; filename=\"{filename}\"\r\n"
            )
            .as_bytes(),
        );
        body.extend_from_slice(format!("Content-Type: {content_type}\r\n\r\n").as_bytes());
        body.extend_from_slice(data);
        body.extend_from_slice(b"\r\n");
    }
    body.extend_from_slice(format!("--{BOUNDARY}--\r\n").as_bytes());
    (format!("multipart/form-data; boundary={BOUNDARY}"), body)
}
