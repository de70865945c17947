mod common;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use common::{multipart_body, seed_user, send, send_raw, spawn_app};
use sea_orm::{ColumnTrait, EntityTrait, PaginatorTrait, QueryFilter};
use serde_json::json;
use stashbin::config::Config;
use stashbin::entities::{albums, files, prelude::*};
use stashbin::services::scanner::NoOpScanner;
use std::sync::Arc;

async fn post_json(
    test: &common::TestApp,
    uri: &str,
    token: &str,
    body: serde_json::Value,
) -> (StatusCode, serde_json::Value) {
    let request = Request::builder()
        .method("POST")
        .uri(uri)
        .header("content-type", "application/json")
        .header("token", token)
        .body(Body::from(body.to_string()))
        .unwrap();
    send(&test.app, request).await
}

async fn create_album(test: &common::TestApp, token: &str, name: &str) -> i64 {
    let (status, json) = post_json(test, "/api/albums", token, json!({ "name": name })).await;
    assert_eq!(status, StatusCode::OK);
    json["id"].as_i64().unwrap()
}

async fn upload_to_album(test: &common::TestApp, token: &str, albumid: i64, data: &[u8]) -> String {
    let (content_type, body) =
        multipart_body(&[], &[("files[]", "member.txt", "text/plain", data)]);
    let request = Request::builder()
        .method("POST")
        .uri(format!("/api/upload/{albumid}"))
        .header("content-type", content_type)
        .header("token", token)
        .body(Body::from(body))
        .unwrap();
    let (status, json) = send(&test.app, request).await;
    assert_eq!(status, StatusCode::OK);
    json["files"][0]["name"].as_str().unwrap().to_string()
}

#[tokio::test]
async fn create_upload_and_fetch_public_album() {
    let test = spawn_app(Config::default(), Arc::new(NoOpScanner)).await;
    let user = seed_user(&test.state, "albumer", 0).await;

    let albumid = create_album(&test, &user.token, "holidays").await;
    upload_to_album(&test, &user.token, albumid, b"photo bytes").await;

    let album = Albums::find_by_id(albumid)
        .one(&test.state.db)
        .await
        .unwrap()
        .unwrap();
    assert!(album.edited_at >= album.timestamp);

    let request = Request::builder()
        .method("GET")
        .uri(format!("/api/album/get/{}", album.identifier))
        .body(Body::empty())
        .unwrap();
    let (status, json) = send(&test.app, request).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["album"]["name"], "holidays");
    assert_eq!(json["album"]["count"], 1);
}

#[tokio::test]
async fn duplicate_album_name_is_rejected() {
    let test = spawn_app(Config::default(), Arc::new(NoOpScanner)).await;
    let user = seed_user(&test.state, "dupal", 0).await;

    create_album(&test, &user.token, "same").await;
    let (status, json) = post_json(&test, "/api/albums", &user.token, json!({ "name": "same" })).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(json["description"].as_str().unwrap().contains("already"));
}

#[tokio::test]
async fn zip_download_and_freshness() {
    let test = spawn_app(Config::default(), Arc::new(NoOpScanner)).await;
    let user = seed_user(&test.state, "zipper", 0).await;

    let albumid = create_album(&test, &user.token, "zippable").await;
    let member = upload_to_album(&test, &user.token, albumid, b"zip me up").await;

    let album = Albums::find_by_id(albumid)
        .one(&test.state.db)
        .await
        .unwrap()
        .unwrap();

    let uri = format!("/api/album/zip/{}?v={}", album.identifier, album.edited_at);
    let request = Request::builder().method("GET").uri(&uri).body(Body::empty()).unwrap();
    let (status, bytes) = send_raw(&test.app, request).await;
    assert_eq!(status, StatusCode::OK);

    let mut zip = zip::ZipArchive::new(std::io::Cursor::new(bytes)).unwrap();
    assert_eq!(zip.len(), 1);
    {
        use std::io::Read;
        let mut entry = zip.by_name(&member).unwrap();
        let mut content = Vec::new();
        entry.read_to_end(&mut content).unwrap();
        assert_eq!(content, b"zip me up");
    }

    let reloaded = Albums::find_by_id(albumid)
        .one(&test.state.db)
        .await
        .unwrap()
        .unwrap();
    assert!(reloaded.zip_generated_at > reloaded.edited_at);
}

#[tokio::test]
async fn concurrent_zip_requests_serve_same_bytes() {
    let test = spawn_app(Config::default(), Arc::new(NoOpScanner)).await;
    let user = seed_user(&test.state, "parzip", 0).await;

    let albumid = create_album(&test, &user.token, "parallel").await;
    upload_to_album(&test, &user.token, albumid, b"contended content").await;

    let identifier = Albums::find_by_id(albumid)
        .one(&test.state.db)
        .await
        .unwrap()
        .unwrap()
        .identifier;

    let make_request = || {
        Request::builder()
            .method("GET")
            .uri(format!("/api/album/zip/{identifier}"))
            .body(Body::empty())
            .unwrap()
    };
    let (a, b) = tokio::join!(
        send_raw(&test.app, make_request()),
        send_raw(&test.app, make_request())
    );
    assert_eq!(a.0, StatusCode::OK);
    assert_eq!(b.0, StatusCode::OK);
    assert_eq!(a.1, b.1);
}

#[tokio::test]
async fn delete_album_with_purge_removes_files() {
    let test = spawn_app(Config::default(), Arc::new(NoOpScanner)).await;
    let user = seed_user(&test.state, "purger", 0).await;

    let albumid = create_album(&test, &user.token, "doomed").await;
    let member = upload_to_album(&test, &user.token, albumid, b"purge me").await;
    let identifier = Albums::find_by_id(albumid)
        .one(&test.state.db)
        .await
        .unwrap()
        .unwrap()
        .identifier;

    // Generate a ZIP so deletion also has an archive to clean up.
    let request = Request::builder()
        .method("GET")
        .uri(format!("/api/album/zip/{identifier}"))
        .body(Body::empty())
        .unwrap();
    let (status, _) = send_raw(&test.app, request).await;
    assert_eq!(status, StatusCode::OK);
    assert!(test.state.paths.zip(&identifier).exists());

    let (status, json) = post_json(
        &test,
        "/api/albums/delete",
        &user.token,
        json!({ "id": albumid, "purge": true }),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert!(json["failed"].as_array().unwrap().is_empty());

    assert!(Albums::find_by_id(albumid).one(&test.state.db).await.unwrap().is_none());
    assert_eq!(Files::find().count(&test.state.db).await.unwrap(), 0);
    assert!(!test.state.paths.file(&member).exists());
    assert!(!test.state.paths.zip(&identifier).exists());
}

#[tokio::test]
async fn delete_album_without_purge_orphans_files() {
    let test = spawn_app(Config::default(), Arc::new(NoOpScanner)).await;
    let user = seed_user(&test.state, "keeper", 0).await;

    let albumid = create_album(&test, &user.token, "shortlived").await;
    let member = upload_to_album(&test, &user.token, albumid, b"keep me").await;

    post_json(
        &test,
        "/api/albums/delete",
        &user.token,
        json!({ "id": albumid }),
    )
    .await;

    let row = Files::find()
        .filter(files::Column::Name.eq(&member))
        .one(&test.state.db)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(row.albumid, None);
    assert!(test.state.paths.file(&member).exists());
}

#[tokio::test]
async fn expired_album_member_sweep_bumps_edited_at() {
    let test = spawn_app(Config::default(), Arc::new(NoOpScanner)).await;
    let user = seed_user(&test.state, "sweeps", 0).await;

    let albumid = create_album(&test, &user.token, "leaky").await;
    let member = upload_to_album(&test, &user.token, albumid, b"expiring").await;

    // Backdate the expiry, then freeze the album timestamp to observe the bump.
    use sea_orm::sea_query::Expr;
    Files::update_many()
        .col_expr(files::Column::Expirydate, Expr::value(1))
        .filter(files::Column::Name.eq(&member))
        .exec(&test.state.db)
        .await
        .unwrap();
    Albums::update_many()
        .col_expr(albums::Column::EditedAt, Expr::value(1))
        .filter(albums::Column::Id.eq(albumid))
        .exec(&test.state.db)
        .await
        .unwrap();

    let deleted = test.sweeper.sweep_once().await.unwrap();
    assert_eq!(deleted, 1);

    assert_eq!(Files::find().count(&test.state.db).await.unwrap(), 0);
    assert!(!test.state.paths.file(&member).exists());

    let album = Albums::find_by_id(albumid)
        .one(&test.state.db)
        .await
        .unwrap()
        .unwrap();
    assert!(album.edited_at > 1);
}

#[tokio::test]
async fn addfiles_moves_between_albums() {
    let test = spawn_app(Config::default(), Arc::new(NoOpScanner)).await;
    let user = seed_user(&test.state, "mover", 0).await;

    let source = create_album(&test, &user.token, "source").await;
    let target = create_album(&test, &user.token, "target").await;
    let member = upload_to_album(&test, &user.token, source, b"migrating").await;

    let file_id = Files::find()
        .filter(files::Column::Name.eq(&member))
        .one(&test.state.db)
        .await
        .unwrap()
        .unwrap()
        .id;

    let (status, json) = post_json(
        &test,
        "/api/albums/addfiles",
        &user.token,
        json!({ "ids": [file_id], "albumid": target }),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert!(json["failed"].as_array().unwrap().is_empty());

    let row = Files::find_by_id(file_id)
        .one(&test.state.db)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(row.albumid, Some(target));
}
